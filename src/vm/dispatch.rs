//! The dispatch loop and handler-stack unwinding.

use super::Vm;
use crate::chunk::OpCode;
use crate::debug;
use crate::exception::{ExceptionKind, HandlerFrame, Pending, Raised};
use crate::heap::ObjRef;
use crate::object::class::{self as class_model, Class};
use crate::object::{Closure, Dunder, Object};
use crate::value::{Handler, HandlerKind, KWARGS_DICT, KWARGS_LIST, KWARGS_SINGLE, Value};

impl Vm {
    /// Execute until the frame stack shrinks back to `floor` frames, returning
    /// the value the frame at `floor` returned. Exceptions not handled by a
    /// region inside those frames unwind them and propagate.
    pub(crate) fn run(&mut self, floor: usize) -> Result<Value, Raised> {
        loop {
            self.maybe_collect();
            match self.step(floor) {
                Ok(None) => {}
                Ok(Some(value)) => return Ok(value),
                Err(Raised(exception)) => self.unwind(exception, floor)?,
            }
        }
    }

    fn fetch(&mut self) -> Result<(OpCode, usize), Raised> {
        let frame = self.frame_mut();
        let offset = frame.ip;
        let chunk = &frame.function.chunk;
        let message = match chunk.decode(offset) {
            Some((op, operand)) => {
                frame.ip = offset + 1 + op.operand().width();
                return Ok((op, operand));
            }
            None => match chunk.code.get(offset) {
                Some(byte) => format!("invalid instruction {byte:#04x} at offset {offset}"),
                None => format!("execution ran off the end of the code at offset {offset}"),
            },
        };
        Err(self.error(ExceptionKind::SystemError, message))
    }

    fn constant(&mut self, index: usize) -> Result<Value, Raised> {
        match self.frame().function.chunk.constants.get(index) {
            Some(&value) => Ok(value),
            None => Err(self.error(ExceptionKind::SystemError, format!("constant {index} out of range"))),
        }
    }

    fn name_constant(&mut self, index: usize) -> Result<ObjRef, Raised> {
        match self.constant(index)? {
            Value::Object(r) if self.heap.as_str(r).is_some() => Ok(r),
            _ => Err(self.error(ExceptionKind::SystemError, format!("constant {index} is not a name"))),
        }
    }

    fn read_byte(&mut self) -> Result<u8, Raised> {
        let frame = self.frame_mut();
        match frame.function.chunk.code.get(frame.ip) {
            Some(&byte) => {
                frame.ip += 1;
                Ok(byte)
            }
            None => Err(self.error(ExceptionKind::SystemError, "truncated closure capture list")),
        }
    }

    /// One capture descriptor of `CLOSURE`: (is_local, index).
    fn read_capture(&mut self) -> Result<(bool, usize), Raised> {
        let flags = self.read_byte()?;
        let mut index = self.read_byte()? as usize;
        if flags & 2 != 0 {
            index = index << 16 | (self.read_byte()? as usize) << 8 | self.read_byte()? as usize;
        }
        Ok((flags & 1 != 0, index))
    }

    fn replace_top(&mut self, count: usize, value: Value) {
        let len = self.stack.len().saturating_sub(count);
        self.stack.truncate(len);
        self.push(value);
    }

    fn jump_forward(&mut self, distance: usize) {
        self.frame_mut().ip += distance;
    }

    // ── Globals ─────────────────────────────────────────────────────

    fn globals(&self) -> ObjRef {
        self.frame().globals
    }

    fn undefined_name(&mut self, name: ObjRef) -> Raised {
        let name = self.heap.name(name).to_string();
        self.error(ExceptionKind::NameError, format!("name '{name}' is not defined"))
    }

    fn step(&mut self, floor: usize) -> Result<Option<Value>, Raised> {
        if self.config.trace {
            let frame = self.frame();
            log::trace!(
                "{} | depth {}",
                debug::describe_instruction(&self.heap, &frame.function, frame.ip),
                self.stack.len()
            );
        }

        let (op, operand) = self.fetch()?;
        match op.short_form() {
            OpCode::Constant => {
                let value = self.constant(operand)?;
                self.push(value);
            }
            OpCode::None => self.push(Value::None),
            OpCode::True => self.push(Value::Boolean(true)),
            OpCode::False => self.push(Value::Boolean(false)),
            OpCode::Pop => {
                self.pop();
            }
            OpCode::Dup => {
                if operand >= self.stack.len() {
                    return Err(self.error(ExceptionKind::SystemError, "DUP past the bottom of the stack"));
                }
                let value = self.peek(operand);
                self.push(value);
            }
            OpCode::Swap => {
                let len = self.stack.len();
                if len >= 2 {
                    self.stack.swap(len - 1, len - 2);
                }
            }

            // ── Operators ───────────────────────────────────────────
            OpCode::Negate => {
                let value = self.negate(self.peek(0))?;
                self.replace_top(1, value);
            }
            OpCode::Not => {
                let truthy = self.truthy(self.peek(0))?;
                self.replace_top(1, Value::Boolean(!truthy));
            }
            OpCode::BitNegate => {
                let value = match self.peek(0) {
                    Value::Integer(i) => Value::Integer(!i),
                    other => {
                        let name = self.type_name(other);
                        return Err(self.error(
                            ExceptionKind::TypeError,
                            format!("bad operand type for unary ~: '{name}'"),
                        ));
                    }
                };
                self.replace_top(1, value);
            }
            OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::Modulo
            | OpCode::Pow
            | OpCode::BitOr
            | OpCode::BitXor
            | OpCode::BitAnd
            | OpCode::ShiftLeft
            | OpCode::ShiftRight => {
                let value = self.binary(op, self.peek(1), self.peek(0))?;
                self.replace_top(2, value);
            }
            OpCode::Equal => {
                let equal = self.values_equal(self.peek(1), self.peek(0))?;
                self.replace_top(2, Value::Boolean(equal));
            }
            OpCode::Is => {
                let same = self.peek(1).same(self.peek(0));
                self.replace_top(2, Value::Boolean(same));
            }
            OpCode::Greater | OpCode::Less => {
                let result = self.compare(op, self.peek(1), self.peek(0))?;
                self.replace_top(2, Value::Boolean(result));
            }

            // ── Variables ───────────────────────────────────────────
            OpCode::DefineGlobal => {
                let name = self.name_constant(operand)?;
                let value = self.pop();
                let globals = self.globals();
                if let Some(module) = self.heap.as_instance_mut(globals) {
                    module.fields.insert(name, value);
                }
            }
            OpCode::GetGlobal => {
                let name = self.name_constant(operand)?;
                let value = match self.get_field(self.globals(), name) {
                    Some(value) => value,
                    None => match self.get_field(self.builtins, name) {
                        Some(value) => value,
                        None => return Err(self.undefined_name(name)),
                    },
                };
                self.push(value);
            }
            OpCode::SetGlobal => {
                let name = self.name_constant(operand)?;
                let value = self.peek(0);
                let globals = self.globals();
                match self.heap.as_instance_mut(globals).and_then(|m| m.fields.get_mut(&name)) {
                    Some(slot) => *slot = value,
                    None => return Err(self.undefined_name(name)),
                }
            }
            OpCode::DelGlobal => {
                let name = self.name_constant(operand)?;
                let globals = self.globals();
                let removed = self.heap.as_instance_mut(globals).and_then(|m| m.fields.remove(&name));
                if removed.is_none() {
                    return Err(self.undefined_name(name));
                }
            }
            OpCode::GetLocal => {
                let slot = self.frame().base + operand;
                match self.stack.get(slot) {
                    Some(&value) => self.push(value),
                    None => return Err(self.error(ExceptionKind::SystemError, format!("local slot {operand} out of range"))),
                }
            }
            OpCode::SetLocal => {
                let slot = self.frame().base + operand;
                if slot >= self.stack.len() {
                    return Err(self.error(ExceptionKind::SystemError, format!("local slot {operand} out of range")));
                }
                let value = self.peek(0);
                self.stack[slot] = value;
            }
            OpCode::GetUpvalue => {
                let upvalue = self.upvalue(operand)?;
                let value = self.read_upvalue(upvalue);
                self.push(value);
            }
            OpCode::SetUpvalue => {
                let upvalue = self.upvalue(operand)?;
                self.write_upvalue(upvalue, self.peek(0));
            }
            OpCode::CloseUpvalue => {
                self.close_upvalues(self.stack.len().saturating_sub(1));
                self.pop();
            }

            // ── Control flow ────────────────────────────────────────
            OpCode::Jump => self.jump_forward(operand),
            OpCode::JumpIfFalse => {
                if !self.truthy(self.peek(0))? {
                    self.jump_forward(operand);
                }
            }
            OpCode::JumpIfTrue => {
                if self.truthy(self.peek(0))? {
                    self.jump_forward(operand);
                }
            }
            OpCode::Loop => {
                self.poll_interrupt()?;
                let frame = self.frame_mut();
                match frame.ip.checked_sub(operand) {
                    Some(target) => frame.ip = target,
                    None => return Err(self.error(ExceptionKind::SystemError, "loop target before start of code")),
                }
            }

            // ── Handlers ────────────────────────────────────────────
            OpCode::PushTry => {
                let target = self.frame().ip + operand;
                self.push(Value::Handler(Handler { kind: HandlerKind::Try, target }));
                self.handlers.push(HandlerFrame {
                    kind: HandlerKind::Try,
                    target,
                    frame: self.frames.len() - 1,
                    slot: self.stack.len() - 1,
                    pending: None,
                });
            }
            OpCode::PushWith => {
                let target = self.frame().ip + operand;
                let manager = self.peek(0);
                let class = self.type_of(manager);
                let (Some(enter), Some(_)) = (self.dunder(class, Dunder::Enter), self.dunder(class, Dunder::Exit)) else {
                    let name = self.type_name(manager);
                    return Err(self.error(
                        ExceptionKind::TypeError,
                        format!("can not use '{name}' as context manager"),
                    ));
                };
                self.push(Value::Handler(Handler { kind: HandlerKind::With, target }));
                let slot = self.stack.len() - 1;
                let entered = self.call_sync(enter, &[manager])?;
                self.push(entered);
                self.handlers.push(HandlerFrame {
                    kind: HandlerKind::With,
                    target,
                    frame: self.frames.len() - 1,
                    slot,
                    pending: None,
                });
            }
            OpCode::PopHandler => {
                let Some(record) = self.handlers.pop() else {
                    return Err(self.error(ExceptionKind::SystemError, "POP_HANDLER without an active handler"));
                };
                self.close_upvalues(record.slot);
                self.stack.truncate(record.slot);
            }
            OpCode::CleanupWith => return self.cleanup_with(floor),
            OpCode::Raise => {
                let value = self.peek(0);
                let exception = match value {
                    Value::Object(r) if self.heap.as_class(r).is_some() => self.call_sync(value, &[])?,
                    _ => value,
                };
                return Err(self.throw(exception));
            }

            // ── Calls ───────────────────────────────────────────────
            OpCode::Call => {
                self.call_value(operand)?;
            }
            OpCode::Kwargs => self.push(Value::KwArgs(operand as i64)),
            OpCode::ExpandArgs => {
                let marker = match operand {
                    0 => KWARGS_SINGLE,
                    1 => KWARGS_LIST,
                    2 => KWARGS_DICT,
                    _ => {
                        return Err(self.error(
                            ExceptionKind::SystemError,
                            format!("invalid argument expansion mode {operand}"),
                        ));
                    }
                };
                self.push(Value::KwArgs(marker));
            }
            OpCode::Closure => self.make_closure(operand)?,
            OpCode::Return => {
                let result = self.pop();
                return Ok(self.return_from(result, floor));
            }

            // ── Classes and attributes ──────────────────────────────
            OpCode::Class => {
                let name = self.name_constant(operand)?;
                let filename = self.frame().function.chunk.filename.clone();
                let mut class = Class::new(name, Some(self.classes.object));
                class.filename = filename.map(|f| self.heap.intern(&f));
                let class = self.heap.alloc(Object::Class(class));
                self.push(Value::Object(class));
            }
            OpCode::Inherit => {
                let base = self.peek(1);
                let class = self.peek(0);
                let base_payload = match base.as_object().and_then(|r| self.heap.as_class(r)) {
                    Some(base) => base.payload,
                    None => return Err(self.error(ExceptionKind::TypeError, "superclass must be a class")),
                };
                match class.as_object().and_then(|r| self.heap.as_class_mut(r)) {
                    Some(class) => {
                        class.base = base.as_object();
                        class.payload = base_payload;
                    }
                    None => return Err(self.error(ExceptionKind::SystemError, "INHERIT target is not a class")),
                }
                self.pop();
            }
            OpCode::Method => {
                let name = self.name_constant(operand)?;
                let method = self.peek(0);
                let Some(class) = self.peek(1).as_object().filter(|&r| self.heap.as_class(r).is_some()) else {
                    return Err(self.error(ExceptionKind::SystemError, "METHOD target is not a class"));
                };
                self.define_method(class, name, method)?;
                self.pop();
            }
            OpCode::Finalize => {
                let Some(class) = self.peek(0).as_object().filter(|&r| self.heap.as_class(r).is_some()) else {
                    return Err(self.error(ExceptionKind::SystemError, "FINALIZE target is not a class"));
                };
                class_model::finalize(&mut self.heap, class, &self.dunders);
                if log::log_enabled!(log::Level::Debug) {
                    let name = self.heap.as_class(class).map(|c| self.heap.name(c.name)).unwrap_or("?");
                    log::debug!("finalized class {name}");
                }
            }
            OpCode::Docstring => {
                let doc = self.pop().as_object().filter(|&r| self.heap.as_str(r).is_some());
                if let Some(class) = self.peek(0).as_object().and_then(|r| self.heap.as_class_mut(r)) {
                    class.doc = doc;
                }
            }
            OpCode::GetProperty => {
                let name = self.name_constant(operand)?;
                let value = self.get_attribute(self.peek(0), name)?;
                self.replace_top(1, value);
            }
            OpCode::SetProperty => {
                let name = self.name_constant(operand)?;
                let value = self.set_attribute(self.peek(1), name, self.peek(0))?;
                self.replace_top(2, value);
            }
            OpCode::GetSuper => {
                let name = self.name_constant(operand)?;
                let value = self.get_super(self.peek(1), self.peek(0), name)?;
                self.replace_top(2, value);
            }
            OpCode::InvokeGetter => {
                let value = self.invoke_getter(self.peek(1), self.peek(0))?;
                self.replace_top(2, value);
            }
            OpCode::InvokeSetter => {
                let value = self.invoke_setter(self.peek(2), self.peek(1), self.peek(0))?;
                self.replace_top(3, value);
            }
            OpCode::InvokeDelete => {
                let value = self.invoke_delete(self.peek(1), self.peek(0))?;
                self.replace_top(2, value);
            }
            OpCode::Import => {
                let name = self.name_constant(operand)?;
                let module = self.import_module(name)?;
                self.push(Value::Object(module));
            }
            other => {
                return Err(self.error(
                    ExceptionKind::SystemError,
                    format!("unhandled opcode {}", other.mnemonic()),
                ));
            }
        }
        Ok(None)
    }

    fn upvalue(&mut self, index: usize) -> Result<ObjRef, Raised> {
        let closure = self.frame().closure;
        match self.heap.as_closure(closure).and_then(|c| c.upvalues.get(index)) {
            Some(&upvalue) => Ok(upvalue),
            None => Err(self.error(ExceptionKind::SystemError, format!("upvalue {index} out of range"))),
        }
    }

    fn make_closure(&mut self, index: usize) -> Result<(), Raised> {
        let function = match self.constant(index)? {
            Value::Object(r) if self.heap.as_function(r).is_some() => r,
            _ => return Err(self.error(ExceptionKind::SystemError, format!("constant {index} is not a function"))),
        };
        let Some(proto) = self.heap.as_function(function).cloned() else {
            return Err(self.error(ExceptionKind::SystemError, "closure prototype vanished"));
        };
        let mut upvalues = Vec::with_capacity(proto.upvalue_count);
        for _ in 0..proto.upvalue_count {
            let (is_local, index) = self.read_capture()?;
            let upvalue = if is_local {
                let slot = self.frame().base + index;
                self.capture_upvalue(slot)
            } else {
                self.upvalue(index)?
            };
            upvalues.push(upvalue);
        }
        let globals = self.globals();
        let closure = self.heap.alloc(Object::Closure(Closure { function, proto, upvalues, globals }));
        self.push(Value::Object(closure));
        Ok(())
    }

    // ── Returns and unwinding ───────────────────────────────────────

    /// Leave the current frame with `result`, first diverting through any
    /// `with` cleanup still active in it. Returns the result when the frame
    /// stack is back at `floor`.
    fn return_from(&mut self, result: Value, floor: usize) -> Option<Value> {
        let current = self.frames.len() - 1;
        while let Some(record) = self.handlers.last_mut() {
            if record.frame != current {
                break;
            }
            if record.kind == HandlerKind::With {
                record.pending = Some(Pending::Return(result));
                let (slot, target) = (record.slot, record.target);
                self.close_upvalues(slot + 1);
                self.stack.truncate(slot + 1);
                self.frame_mut().ip = target;
                return None;
            }
            self.handlers.pop();
        }

        let frame = self.frames.pop()?;
        self.close_upvalues(frame.base);
        self.stack.truncate(frame.base - 1);
        let result = frame.returns.unwrap_or(result);
        if self.frames.len() == floor {
            return Some(result);
        }
        self.push(result);
        None
    }

    /// Run `__exit__` for the innermost `with` region and resume however the
    /// region was being left.
    fn cleanup_with(&mut self, floor: usize) -> Result<Option<Value>, Raised> {
        let record = match self.handlers.pop() {
            Some(record) if record.kind == HandlerKind::With && record.frame == self.frames.len() - 1 => record,
            _ => return Err(self.error(ExceptionKind::SystemError, "CLEANUP_WITH without an active with block")),
        };
        self.close_upvalues(record.slot);
        self.stack.truncate(record.slot);
        let manager = self.peek(0);
        let class = self.type_of(manager);
        let Some(exit) = self.dunder(class, Dunder::Exit) else {
            let name = self.type_name(manager);
            return Err(self.error(ExceptionKind::TypeError, format!("'{name}' object has no __exit__")));
        };

        let pending_value = match record.pending {
            Some(Pending::Raise(value)) | Some(Pending::Return(value)) => value,
            None => Value::None,
        };
        // `__exit__` may raise and catch exceptions of its own.
        let pending_traceback = match record.pending {
            Some(Pending::Raise(exception)) => {
                self.last_traceback.clone().filter(|(raised, _)| raised.same(exception))
            }
            _ => None,
        };
        self.push(pending_value);
        self.call_sync(exit, &[manager])?;
        self.pop();
        self.pop();

        match record.pending {
            None => Ok(None),
            Some(Pending::Raise(exception)) => {
                if pending_traceback.is_some() {
                    self.last_traceback = pending_traceback;
                }
                Err(Raised(exception))
            }
            Some(Pending::Return(value)) => Ok(self.return_from(value, floor)),
        }
    }

    /// Transfer control to the innermost region owned by a frame at or above
    /// `floor`, or unwind those frames and propagate.
    fn unwind(&mut self, exception: Value, floor: usize) -> Result<(), Raised> {
        let Some(record) = self.handlers.innermost_from(floor).and_then(|i| self.handlers.get(i).copied()) else {
            if let Some(frame) = self.frames.get(floor) {
                let base = frame.base;
                self.close_upvalues(base);
                self.stack.truncate(base - 1);
            }
            self.frames.truncate(floor);
            return Err(Raised(exception));
        };

        self.close_upvalues(record.slot + 1);
        self.frames.truncate(record.frame + 1);
        self.stack.truncate(record.slot + 1);
        self.frame_mut().ip = record.target;
        match record.kind {
            HandlerKind::Try => {
                self.handlers.pop();
                self.stack[record.slot] = exception;
            }
            HandlerKind::With => {
                if let Some(active) = self.handlers.last_mut() {
                    active.pending = Some(Pending::Raise(exception));
                }
            }
        }
        Ok(())
    }
}
