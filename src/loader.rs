//! Compiled code files: a JSON rendering of a function tree, deserialised
//! with serde and turned into heap functions after validation.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, LineRange, LocalEntry, OpCode, Operand};
use crate::debug::instruction_len;
use crate::heap::{Heap, ObjRef};
use crate::object::{Function, Object};
use crate::value::Value;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed code file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{function}: invalid opcode {byte:#04x} at offset {offset}")]
    BadOpcode { function: String, offset: usize, byte: u8 },
    #[error("{function}: truncated instruction at offset {offset}")]
    Truncated { function: String, offset: usize },
    #[error("{function}: constant {index} out of range at offset {offset}")]
    ConstantOutOfRange { function: String, offset: usize, index: usize },
    #[error("{function}: constant at offset {offset} must be a {expected}")]
    ConstantKind { function: String, offset: usize, expected: &'static str },
    #[error("{function}: jump at offset {offset} lands outside the code ({target})")]
    JumpOutOfRange { function: String, offset: usize, target: isize },
}

// ── File model ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeFile {
    pub function: FunctionRepr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionRepr {
    pub name: String,
    pub filename: Option<String>,
    pub required_args: Vec<String>,
    pub keyword_args: Vec<String>,
    pub collects_args: bool,
    pub collects_kwargs: bool,
    pub upvalue_count: usize,
    pub docstring: Option<String>,
    pub code: Vec<u8>,
    /// `[start_offset, line]` pairs.
    pub lines: Vec<(usize, usize)>,
    pub constants: Vec<ConstantRepr>,
    pub locals: Vec<LocalRepr>,
}

impl Default for FunctionRepr {
    fn default() -> Self {
        FunctionRepr {
            name: "<module>".to_string(),
            filename: None,
            required_args: Vec::new(),
            keyword_args: Vec::new(),
            collects_args: false,
            collects_kwargs: false,
            upvalue_count: 0,
            docstring: None,
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            locals: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ConstantRepr {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Kwargs(i64),
    Function(Box<FunctionRepr>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRepr {
    pub slot: usize,
    pub name: String,
    pub birthday: usize,
    pub deathday: usize,
}

// ── Loading ─────────────────────────────────────────────────────────

pub fn load_file(heap: &mut Heap, path: &Path) -> Result<ObjRef, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io { path: path.to_path_buf(), source })?;
    let filename: Rc<str> = Rc::from(path.display().to_string());
    let file: CodeFile = serde_json::from_str(&text)?;
    load_function(heap, &file.function, Some(filename))
}

pub fn load_str(heap: &mut Heap, text: &str) -> Result<ObjRef, LoadError> {
    let file: CodeFile = serde_json::from_str(text)?;
    load_function(heap, &file.function, None)
}

/// Allocate `repr` and every nested function constant. `filename` overrides
/// the file name recorded in the code file.
pub fn load_function(heap: &mut Heap, repr: &FunctionRepr, filename: Option<Rc<str>>) -> Result<ObjRef, LoadError> {
    let filename = filename.or_else(|| repr.filename.as_deref().map(Rc::from));
    let mut chunk = Chunk::new(filename.clone());
    chunk.code = repr.code.clone();
    chunk.lines = repr.lines.iter().map(|&(start_offset, line)| LineRange { start_offset, line }).collect();
    chunk.locals = repr
        .locals
        .iter()
        .map(|l| LocalEntry { slot: l.slot, name: l.name.clone(), birthday: l.birthday, deathday: l.deathday })
        .collect();
    for constant in &repr.constants {
        let value = match constant {
            ConstantRepr::None => Value::None,
            ConstantRepr::Bool(b) => Value::Boolean(*b),
            ConstantRepr::Int(i) => Value::Integer(*i),
            ConstantRepr::Float(f) => Value::Floating(*f),
            ConstantRepr::Str(s) => Value::Object(heap.intern(s)),
            ConstantRepr::Kwargs(n) => Value::KwArgs(*n),
            ConstantRepr::Function(inner) => Value::Object(load_function(heap, inner, filename.clone())?),
        };
        chunk.add_constant(value);
    }

    let name = heap.intern(&repr.name);
    let mut function = Function::new(name, chunk);
    function.required_args = repr.required_args.iter().map(|a| heap.intern(a)).collect();
    function.keyword_args = repr.keyword_args.iter().map(|a| heap.intern(a)).collect();
    function.collects_args = repr.collects_args;
    function.collects_kwargs = repr.collects_kwargs;
    function.upvalue_count = repr.upvalue_count;
    function.docstring = repr.docstring.as_deref().map(|d| heap.intern(d));

    validate(heap, &repr.name, &function.chunk)?;
    Ok(heap.alloc(Object::Function(Rc::new(function))))
}

fn names_constant(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::DefineGlobal
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::DelGlobal
            | OpCode::Class
            | OpCode::Method
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper
            | OpCode::Import
    )
}

/// Walk every instruction: opcodes must be known, operands present,
/// constant references in range and of the right kind, jumps inside the code.
fn validate(heap: &Heap, name: &str, chunk: &Chunk) -> Result<(), LoadError> {
    let function = || name.to_string();
    let mut offset = 0;
    while offset < chunk.len() {
        let byte = chunk.code[offset];
        let Some((op, operand)) = chunk.decode(offset) else {
            return Err(match OpCode::from_byte(byte) {
                Some(_) => LoadError::Truncated { function: function(), offset },
                None => LoadError::BadOpcode { function: function(), offset, byte },
            });
        };
        let short = op.short_form();

        let uses_constant = short == OpCode::Constant || short == OpCode::Closure || names_constant(short);
        if uses_constant {
            let Some(&constant) = chunk.constants.get(operand) else {
                return Err(LoadError::ConstantOutOfRange { function: function(), offset, index: operand });
            };
            let object = constant.as_object().map(|r| heap.get(r));
            if short == OpCode::Closure && !matches!(object, Some(Object::Function(_))) {
                return Err(LoadError::ConstantKind { function: function(), offset, expected: "function" });
            }
            if names_constant(short) && !matches!(object, Some(Object::Str(_))) {
                return Err(LoadError::ConstantKind { function: function(), offset, expected: "string" });
            }
        }

        if op.operand() == Operand::Jump {
            let after = (offset + 3) as isize;
            let target = if short == OpCode::Loop { after - operand as isize } else { after + operand as isize };
            if target < 0 || target > chunk.len() as isize {
                return Err(LoadError::JumpOutOfRange { function: function(), offset, target });
            }
        }

        let Some(len) = instruction_len(heap, chunk, offset) else {
            return Err(LoadError::Truncated { function: function(), offset });
        };
        offset += len;
    }
    Ok(())
}
