use std::rc::Rc;

use crate::value::Value;

/// Largest index a long-form operand can carry.
pub const MAX_LONG_OPERAND: usize = (1 << 24) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// Raw byte operand (`DUP` depth, `EXPAND_ARGS` mode).
    Byte,
    /// One-byte index (constant, slot, upvalue, argument count).
    Short,
    /// Three-byte big-endian index.
    Long,
    /// Two-byte big-endian jump distance.
    Jump,
}

impl Operand {
    pub fn width(self) -> usize {
        match self {
            Operand::None => 0,
            Operand::Byte | Operand::Short => 1,
            Operand::Jump => 2,
            Operand::Long => 3,
        }
    }
}

macro_rules! opcodes {
    ($( $name:ident = $byte:literal, $mnemonic:literal, $operand:ident; )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum OpCode {
            $( $name = $byte, )*
        }

        impl OpCode {
            pub fn from_byte(byte: u8) -> Option<OpCode> {
                match byte {
                    $( $byte => Some(OpCode::$name), )*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( OpCode::$name => $mnemonic, )*
                }
            }

            pub fn operand(self) -> Operand {
                match self {
                    $( OpCode::$name => Operand::$operand, )*
                }
            }
        }
    };
}

// Long forms are the short form's byte with the high bit set.
opcodes! {
    Constant = 0x00, "CONSTANT", Short;
    None = 0x01, "NONE", None;
    True = 0x02, "TRUE", None;
    False = 0x03, "FALSE", None;
    Pop = 0x04, "POP", None;
    Dup = 0x05, "DUP", Byte;
    Swap = 0x06, "SWAP", None;
    Negate = 0x07, "NEGATE", None;
    Not = 0x08, "NOT", None;
    BitNegate = 0x09, "BITNEGATE", None;
    Add = 0x0A, "ADD", None;
    Subtract = 0x0B, "SUBTRACT", None;
    Multiply = 0x0C, "MULTIPLY", None;
    Divide = 0x0D, "DIVIDE", None;
    Modulo = 0x0E, "MODULO", None;
    Pow = 0x0F, "POW", None;
    BitOr = 0x10, "BITOR", None;
    BitXor = 0x11, "BITXOR", None;
    BitAnd = 0x12, "BITAND", None;
    ShiftLeft = 0x13, "SHIFTLEFT", None;
    ShiftRight = 0x14, "SHIFTRIGHT", None;
    Equal = 0x15, "EQUAL", None;
    Is = 0x16, "IS", None;
    Greater = 0x17, "GREATER", None;
    Less = 0x18, "LESS", None;
    DefineGlobal = 0x19, "DEFINE_GLOBAL", Short;
    GetGlobal = 0x1A, "GET_GLOBAL", Short;
    SetGlobal = 0x1B, "SET_GLOBAL", Short;
    DelGlobal = 0x1C, "DEL_GLOBAL", Short;
    GetLocal = 0x1D, "GET_LOCAL", Short;
    SetLocal = 0x1E, "SET_LOCAL", Short;
    GetUpvalue = 0x1F, "GET_UPVALUE", Short;
    SetUpvalue = 0x20, "SET_UPVALUE", Short;
    CloseUpvalue = 0x21, "CLOSE_UPVALUE", None;
    Jump = 0x22, "JUMP", Jump;
    JumpIfFalse = 0x23, "JUMP_IF_FALSE", Jump;
    JumpIfTrue = 0x24, "JUMP_IF_TRUE", Jump;
    Loop = 0x25, "LOOP", Jump;
    PushTry = 0x26, "PUSH_TRY", Jump;
    PushWith = 0x27, "PUSH_WITH", Jump;
    PopHandler = 0x28, "POP_HANDLER", None;
    CleanupWith = 0x29, "CLEANUP_WITH", None;
    Raise = 0x2A, "RAISE", None;
    Call = 0x2B, "CALL", Short;
    Kwargs = 0x2C, "KWARGS", Short;
    ExpandArgs = 0x2D, "EXPAND_ARGS", Byte;
    Closure = 0x2E, "CLOSURE", Short;
    Return = 0x2F, "RETURN", None;
    Class = 0x30, "CLASS", Short;
    Inherit = 0x31, "INHERIT", None;
    Method = 0x32, "METHOD", Short;
    Finalize = 0x33, "FINALIZE", None;
    Docstring = 0x34, "DOCSTRING", None;
    GetProperty = 0x35, "GET_PROPERTY", Short;
    SetProperty = 0x36, "SET_PROPERTY", Short;
    GetSuper = 0x37, "GET_SUPER", Short;
    InvokeGetter = 0x38, "INVOKE_GETTER", None;
    InvokeSetter = 0x39, "INVOKE_SETTER", None;
    InvokeDelete = 0x3A, "INVOKE_DELETE", None;
    Import = 0x3B, "IMPORT", Short;

    ConstantLong = 0x80, "CONSTANT_LONG", Long;
    DefineGlobalLong = 0x99, "DEFINE_GLOBAL_LONG", Long;
    GetGlobalLong = 0x9A, "GET_GLOBAL_LONG", Long;
    SetGlobalLong = 0x9B, "SET_GLOBAL_LONG", Long;
    DelGlobalLong = 0x9C, "DEL_GLOBAL_LONG", Long;
    GetLocalLong = 0x9D, "GET_LOCAL_LONG", Long;
    SetLocalLong = 0x9E, "SET_LOCAL_LONG", Long;
    GetUpvalueLong = 0x9F, "GET_UPVALUE_LONG", Long;
    SetUpvalueLong = 0xA0, "SET_UPVALUE_LONG", Long;
    CallLong = 0xAB, "CALL_LONG", Long;
    KwargsLong = 0xAC, "KWARGS_LONG", Long;
    ClosureLong = 0xAE, "CLOSURE_LONG", Long;
    ClassLong = 0xB0, "CLASS_LONG", Long;
    MethodLong = 0xB2, "METHOD_LONG", Long;
    GetPropertyLong = 0xB5, "GET_PROPERTY_LONG", Long;
    SetPropertyLong = 0xB6, "SET_PROPERTY_LONG", Long;
    GetSuperLong = 0xB7, "GET_SUPER_LONG", Long;
    ImportLong = 0xBB, "IMPORT_LONG", Long;
}

impl OpCode {
    pub fn is_long(self) -> bool {
        self.operand() == Operand::Long
    }

    /// The 3-byte-operand variant of a short-operand opcode.
    pub fn long_form(self) -> Option<OpCode> {
        if self.operand() != Operand::Short {
            return None;
        }
        OpCode::from_byte(self as u8 | 0x80)
    }

    /// Collapse a long variant onto its short form, so the dispatch loop can
    /// match on one name per operation.
    pub fn short_form(self) -> OpCode {
        if self.is_long() {
            OpCode::from_byte(self as u8 & 0x7F).unwrap_or(self)
        } else {
            self
        }
    }

    /// Net operand-stack effect of one execution of this instruction, or
    /// `None` when the instruction transfers control out of the block.
    pub fn stack_effect(self, operand: usize) -> Option<isize> {
        use OpCode::*;
        let effect = match self.short_form() {
            Constant | None | True | False | Dup | GetGlobal | GetLocal | GetUpvalue | PushTry
            | Kwargs | ExpandArgs | Closure | Class | Import => 1,
            PushWith => 2,
            Swap | Negate | Not | BitNegate | SetGlobal | DelGlobal | SetLocal | SetUpvalue
            | Jump | JumpIfFalse | JumpIfTrue | Loop | Finalize | GetProperty => 0,
            Pop | Add | Subtract | Multiply | Divide | Modulo | Pow | BitOr | BitXor | BitAnd
            | ShiftLeft | ShiftRight | Equal | Is | Greater | Less | DefineGlobal | CloseUpvalue
            | PopHandler | Inherit | Method | Docstring | SetProperty | GetSuper
            | InvokeGetter | InvokeDelete => -1,
            CleanupWith | InvokeSetter => -2,
            Call => -(operand as isize),
            Raise | Return => return Option::None,
            _ => return Option::None,
        };
        Some(effect)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("jump distance {distance} does not fit in 16 bits")]
    JumpTooFar { distance: usize },
    #[error("operand {index} exceeds the 24-bit long form")]
    OperandTooLarge { index: usize },
    #[error("{op} does not take an index operand")]
    NotIndexed { op: &'static str },
}

/// A run of instructions sharing one source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub start_offset: usize,
    pub line: usize,
}

/// A local variable occupying `slot` for offsets in `[birthday, deathday)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub slot: usize,
    pub name: String,
    pub birthday: usize,
    pub deathday: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<LineRange>,
    pub filename: Option<Rc<str>>,
    pub constants: Vec<Value>,
    pub locals: Vec<LocalEntry>,
}

impl Chunk {
    pub fn new(filename: Option<Rc<str>>) -> Self {
        Chunk { filename, ..Chunk::default() }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn write(&mut self, byte: u8, line: usize) {
        if self.lines.last().map(|r| r.line) != Some(line) {
            self.lines.push(LineRange { start_offset: self.code.len(), line });
        }
        self.code.push(byte);
    }

    pub fn write_op(&mut self, op: OpCode, line: usize) {
        self.write(op as u8, line);
    }

    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Emit `op` with an index operand, choosing the long form when the
    /// index does not fit in one byte.
    pub fn emit_operand(&mut self, op: OpCode, index: usize, line: usize) -> Result<(), ChunkError> {
        let op = op.short_form();
        if op.operand() != Operand::Short {
            return Err(ChunkError::NotIndexed { op: op.mnemonic() });
        }
        if index <= u8::MAX as usize {
            self.write_op(op, line);
            self.write(index as u8, line);
            return Ok(());
        }
        if index > MAX_LONG_OPERAND {
            return Err(ChunkError::OperandTooLarge { index });
        }
        let long = op.long_form().ok_or(ChunkError::NotIndexed { op: op.mnemonic() })?;
        self.write_op(long, line);
        self.write((index >> 16) as u8, line);
        self.write((index >> 8) as u8, line);
        self.write(index as u8, line);
        Ok(())
    }

    /// Add `value` to the pool and emit the instruction that pushes it.
    pub fn write_constant(&mut self, value: Value, line: usize) -> Result<usize, ChunkError> {
        let index = self.add_constant(value);
        self.emit_operand(OpCode::Constant, index, line)?;
        Ok(index)
    }

    pub fn emit_byte_op(&mut self, op: OpCode, byte: u8, line: usize) {
        self.write_op(op, line);
        self.write(byte, line);
    }

    /// Emit a forward jump with a placeholder distance; returns the offset of
    /// the operand for [`Chunk::patch_jump`].
    pub fn emit_jump(&mut self, op: OpCode, line: usize) -> usize {
        self.write_op(op, line);
        self.write(0xFF, line);
        self.write(0xFF, line);
        self.code.len() - 2
    }

    /// Point the jump whose operand is at `operand_offset` at the current end
    /// of the code.
    pub fn patch_jump(&mut self, operand_offset: usize) -> Result<(), ChunkError> {
        let distance = self.code.len() - (operand_offset + 2);
        if distance > u16::MAX as usize {
            return Err(ChunkError::JumpTooFar { distance });
        }
        self.code[operand_offset] = (distance >> 8) as u8;
        self.code[operand_offset + 1] = distance as u8;
        Ok(())
    }

    pub fn emit_loop(&mut self, loop_start: usize, line: usize) -> Result<(), ChunkError> {
        self.write_op(OpCode::Loop, line);
        let distance = self.code.len() + 2 - loop_start;
        if distance > u16::MAX as usize {
            return Err(ChunkError::JumpTooFar { distance });
        }
        self.write((distance >> 8) as u8, line);
        self.write(distance as u8, line);
        Ok(())
    }

    /// One capture descriptor of a `CLOSURE` instruction.
    pub fn emit_capture(&mut self, is_local: bool, index: usize, line: usize) -> Result<(), ChunkError> {
        let local_bit = if is_local { 1 } else { 0 };
        if index <= u8::MAX as usize {
            self.write(local_bit, line);
            self.write(index as u8, line);
        } else if index <= MAX_LONG_OPERAND {
            self.write(local_bit | 2, line);
            self.write((index >> 16) as u8, line);
            self.write((index >> 8) as u8, line);
            self.write(index as u8, line);
        } else {
            return Err(ChunkError::OperandTooLarge { index });
        }
        Ok(())
    }

    pub fn add_local(&mut self, slot: usize, name: impl Into<String>, birthday: usize, deathday: usize) {
        self.locals.push(LocalEntry { slot, name: name.into(), birthday, deathday });
    }

    /// Source line of the instruction at `offset`.
    pub fn line_number(&self, offset: usize) -> usize {
        let mut line = 0;
        for range in &self.lines {
            if range.start_offset > offset {
                break;
            }
            line = range.line;
        }
        line
    }

    pub fn read_u16(&self, offset: usize) -> usize {
        (self.code[offset] as usize) << 8 | self.code[offset + 1] as usize
    }

    pub fn read_u24(&self, offset: usize) -> usize {
        (self.code[offset] as usize) << 16
            | (self.code[offset + 1] as usize) << 8
            | self.code[offset + 2] as usize
    }

    /// Decode the opcode at `offset` and its fixed operand (0 when it has
    /// none). Returns `None` for an unknown byte or a truncated operand.
    pub fn decode(&self, offset: usize) -> Option<(OpCode, usize)> {
        let op = OpCode::from_byte(*self.code.get(offset)?)?;
        let width = op.operand().width();
        if offset + width >= self.code.len() {
            return None;
        }
        let operand = match op.operand() {
            Operand::None => 0,
            Operand::Byte | Operand::Short => self.code[offset + 1] as usize,
            Operand::Jump => self.read_u16(offset + 1),
            Operand::Long => self.read_u24(offset + 1),
        };
        Some((op, operand))
    }
}
