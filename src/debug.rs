//! Introspection over compiled code: instruction boundaries, source lines and
//! local-variable lifetimes. Enough for a disassembler or traceback printer
//! without reaching into the VM.

use std::fmt::Write as _;

use serde::Serialize;

use crate::chunk::{Chunk, OpCode, Operand};
use crate::heap::Heap;
use crate::object::Function;
use crate::value::Value;

/// One line of a traceback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceFrame {
    pub function: String,
    pub filename: String,
    pub line: usize,
}

/// Byte length of the instruction at `offset`, or `None` when the byte is not
/// an opcode or the instruction runs past the end of the code.
pub fn instruction_len(heap: &Heap, chunk: &Chunk, offset: usize) -> Option<usize> {
    let (op, operand) = chunk.decode(offset)?;
    let mut len = 1 + op.operand().width();
    if op.short_form() == OpCode::Closure {
        let constant = chunk.constants.get(operand)?.as_object()?;
        let upvalues = heap.as_function(constant)?.upvalue_count;
        for _ in 0..upvalues {
            let flags = *chunk.code.get(offset + len)?;
            len += if flags & 2 != 0 { 4 } else { 2 };
        }
        if offset + len > chunk.len() {
            return None;
        }
    }
    Some(len)
}

/// Locals entering and leaving scope within one instruction.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScopeChanges<'a> {
    pub born: Vec<&'a str>,
    pub died: Vec<&'a str>,
}

pub fn scope_changes<'a>(function: &'a Function, offset: usize, len: usize) -> ScopeChanges<'a> {
    let within = |at: usize| at >= offset && at < offset + len;
    let locals = &function.chunk.locals;
    ScopeChanges {
        born: locals.iter().filter(|l| within(l.birthday)).map(|l| l.name.as_str()).collect(),
        died: locals.iter().filter(|l| within(l.deathday)).map(|l| l.name.as_str()).collect(),
    }
}

/// Name of local `slot` at `offset`: a parameter name, or the local whose
/// lifetime covers the offset.
pub fn local_name<'a>(heap: &'a Heap, function: &'a Function, slot: usize, offset: usize) -> Option<&'a str> {
    let required = function.required_args.len();
    if slot < required {
        return heap.as_str(function.required_args[slot]);
    }
    if slot < required + function.keyword_args.len() {
        return heap.as_str(function.keyword_args[slot - required]);
    }
    function
        .chunk
        .locals
        .iter()
        .find(|l| l.slot == slot && l.birthday <= offset && offset < l.deathday)
        .map(|l| l.name.as_str())
}

/// A one-line rendering of the instruction at `offset` for trace logging.
pub fn describe_instruction(heap: &Heap, function: &Function, offset: usize) -> String {
    let chunk = &function.chunk;
    let Some((op, operand)) = chunk.decode(offset) else {
        return format!("{offset:04} <bad opcode {:#04x}>", chunk.code.get(offset).copied().unwrap_or(0));
    };
    let mut out = format!("{offset:04} {:>4} {:<18}", chunk.line_number(offset), op.mnemonic());
    match (op.short_form(), op.operand()) {
        (_, Operand::None) => {}
        (OpCode::Loop, _) => {
            let _ = write!(out, " {operand} -> {}", (offset + 3).saturating_sub(operand));
        }
        (_, Operand::Jump) => {
            let _ = write!(out, " {operand} -> {}", offset + 3 + operand);
        }
        (OpCode::ExpandArgs, _) => {
            let mode = match operand {
                0 => "singleton",
                1 => "list",
                _ => "dict",
            };
            let _ = write!(out, " ({mode})");
        }
        (OpCode::GetLocal | OpCode::SetLocal, _) => {
            let _ = write!(out, " {operand}");
            if let Some(name) = local_name(heap, function, operand, offset) {
                let _ = write!(out, " ({name})");
            }
        }
        (OpCode::Constant | OpCode::Closure | OpCode::DefineGlobal | OpCode::GetGlobal
        | OpCode::SetGlobal | OpCode::DelGlobal | OpCode::Class | OpCode::Method
        | OpCode::GetProperty | OpCode::SetProperty | OpCode::GetSuper | OpCode::Import, _) => {
            let _ = write!(out, " {operand}");
            if let Some(constant) = chunk.constants.get(operand) {
                let _ = write!(out, " '{}'", describe_constant(heap, *constant));
            }
        }
        _ => {
            let _ = write!(out, " {operand}");
        }
    }
    let len = instruction_len(heap, chunk, offset).unwrap_or(1);
    let changes = scope_changes(function, offset, len);
    for name in changes.born {
        let _ = write!(out, " +{name}");
    }
    for name in changes.died {
        let _ = write!(out, " -{name}");
    }
    out
}

fn describe_constant(heap: &Heap, value: Value) -> String {
    match value {
        Value::Object(r) => match heap.as_str(r) {
            Some(text) => text.to_string(),
            None => match heap.as_function(r) {
                Some(function) => format!("<function {}>", heap.name(function.name)),
                None => "<object>".to_string(),
            },
        },
        Value::Integer(i) => i.to_string(),
        Value::Floating(f) => f.to_string(),
        Value::Boolean(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}
