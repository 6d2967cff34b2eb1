//! Operators, truthiness, equality and string conversion.

use super::Vm;
use crate::chunk::OpCode;
use crate::exception::{ExceptionKind, Raised};
use crate::heap::ObjRef;
use crate::object::class::find_method;
use crate::object::{Dunder, Object, Payload};
use crate::value::Value;

/// Largest string, in bytes, that repetition may build.
const MAX_STRING_LEN: usize = 1 << 30;

fn symbol(op: OpCode) -> &'static str {
    match op {
        OpCode::Add => "+",
        OpCode::Subtract => "-",
        OpCode::Multiply => "*",
        OpCode::Divide => "/",
        OpCode::Modulo => "%",
        OpCode::Pow => "**",
        OpCode::BitOr => "|",
        OpCode::BitXor => "^",
        OpCode::BitAnd => "&",
        OpCode::ShiftLeft => "<<",
        OpCode::ShiftRight => ">>",
        OpCode::Greater => ">",
        OpCode::Less => "<",
        _ => "?",
    }
}

/// Render a float the way the language prints it: integral values keep a
/// trailing `.0`.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

impl Vm {
    /// The class of any value.
    pub fn type_of(&self, value: Value) -> ObjRef {
        let classes = &self.classes;
        match value {
            Value::None => classes.none_type,
            Value::Boolean(_) => classes.bool_,
            Value::Integer(_) => classes.int,
            Value::Floating(_) => classes.float,
            Value::Handler(_) | Value::KwArgs(_) => classes.object,
            Value::Object(r) => match self.heap.get(r) {
                Object::Str(_) => classes.str_,
                Object::Function(_) | Object::Closure(_) => classes.function,
                Object::BoundMethod(_) => classes.method,
                Object::Native(_) => classes.builtin_function,
                Object::Class(_) => classes.type_,
                Object::Instance(instance) => instance.class,
                Object::Upvalue(_) => classes.object,
            },
        }
    }

    pub fn type_name(&self, value: Value) -> String {
        let class = self.type_of(value);
        match self.heap.as_class(class) {
            Some(class) => self.heap.name(class.name).to_string(),
            None => "object".to_string(),
        }
    }

    /// A special method of `class`: from the finalised cache, or by search
    /// for classes still under construction.
    pub(crate) fn dunder(&self, class: ObjRef, dunder: Dunder) -> Option<Value> {
        let cached = self.heap.as_class(class)?;
        if cached.finalized {
            cached.slot(dunder)
        } else {
            find_method(&self.heap, class, self.dunders.get(dunder))
        }
    }

    fn call_dunder(&mut self, receiver: Value, dunder: Dunder, args: &[Value]) -> Result<Option<Value>, Raised> {
        let Some(method) = self.dunder(self.type_of(receiver), dunder) else {
            return Ok(None);
        };
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(receiver);
        call_args.extend_from_slice(args);
        self.call_sync(method, &call_args).map(Some)
    }

    // ── Truthiness and equality ─────────────────────────────────────

    pub fn truthy(&mut self, value: Value) -> Result<bool, Raised> {
        if let Some(truthy) = value.primitive_truthiness() {
            return Ok(truthy);
        }
        let Value::Object(r) = value else { return Ok(true) };
        match self.heap.get(r) {
            Object::Str(text) => Ok(!text.is_empty()),
            Object::Instance(instance) => match &instance.payload {
                Payload::List(items) => Ok(!items.is_empty()),
                Payload::Dict(dict) => Ok(!dict.is_empty()),
                Payload::None => match self.call_dunder(value, Dunder::Len, &[])? {
                    Some(length) => Ok(!matches!(length, Value::Integer(0))),
                    None => Ok(true),
                },
            },
            _ => Ok(true),
        }
    }

    /// Language-level `==`.
    pub fn values_equal(&mut self, a: Value, b: Value) -> Result<bool, Raised> {
        match (a, b) {
            (Value::Integer(x), Value::Integer(y)) => return Ok(x == y),
            (Value::Integer(_) | Value::Floating(_), Value::Integer(_) | Value::Floating(_)) => {
                return Ok(a.as_number() == b.as_number());
            }
            _ => {}
        }
        if a.same(b) {
            return Ok(true);
        }
        let Value::Object(left) = a else { return Ok(false) };
        if let Some(result) = self.call_dunder(a, Dunder::Eq, &[b])? {
            return self.truthy(result);
        }
        let right = b.as_object();
        let lists = (self.heap.as_list(left).cloned(), right.and_then(|r| self.heap.as_list(r)).cloned());
        if let (Some(xs), Some(ys)) = lists {
            if xs.len() != ys.len() {
                return Ok(false);
            }
            let held: Vec<Value> = xs.iter().chain(&ys).copied().collect();
            return self.with_roots(&held, |vm| {
                for (&x, &y) in xs.iter().zip(&ys) {
                    if !vm.values_equal(x, y)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            });
        }
        Ok(false)
    }

    /// `>` and `<`.
    pub fn compare(&mut self, op: OpCode, a: Value, b: Value) -> Result<bool, Raised> {
        let greater = op.short_form() == OpCode::Greater;
        match (a, b) {
            (Value::Integer(x), Value::Integer(y)) => return Ok(if greater { x > y } else { x < y }),
            (Value::Integer(_) | Value::Floating(_), Value::Integer(_) | Value::Floating(_)) => {
                let (x, y) = (a.as_number().unwrap_or(0.0), b.as_number().unwrap_or(0.0));
                return Ok(if greater { x > y } else { x < y });
            }
            _ => {}
        }
        if let (Some(x), Some(y)) = (self.heap.value_str(a), self.heap.value_str(b)) {
            return Ok(if greater { x > y } else { x < y });
        }
        let dunder = if greater { Dunder::Gt } else { Dunder::Lt };
        if let Some(result) = self.call_dunder(a, dunder, &[b])? {
            return self.truthy(result);
        }
        let (left, right) = (self.type_name(a), self.type_name(b));
        Err(self.error(
            ExceptionKind::TypeError,
            format!("'{}' not supported between instances of '{left}' and '{right}'", symbol(op.short_form())),
        ))
    }

    // ── Arithmetic ──────────────────────────────────────────────────

    pub fn binary(&mut self, op: OpCode, a: Value, b: Value) -> Result<Value, Raised> {
        let op = op.short_form();
        match (a, b) {
            (Value::Integer(x), Value::Integer(y)) => return self.int_binary(op, x, y),
            (Value::Integer(_) | Value::Floating(_), Value::Integer(_) | Value::Floating(_))
                if !matches!(op, OpCode::BitOr | OpCode::BitXor | OpCode::BitAnd | OpCode::ShiftLeft | OpCode::ShiftRight) =>
            {
                let (x, y) = (a.as_number().unwrap_or(0.0), b.as_number().unwrap_or(0.0));
                return self.float_binary(op, x, y);
            }
            _ => {}
        }

        if op == OpCode::Add {
            if let Some(left) = self.heap.value_str(a).map(str::to_string) {
                let right = self.to_str(b)?;
                return Ok(self.intern(&(left + &right)));
            }
            let left = a.as_object().and_then(|r| self.heap.as_list(r)).cloned();
            let right = b.as_object().and_then(|r| self.heap.as_list(r)).cloned();
            if let (Some(mut left), Some(right)) = (left, right) {
                left.extend(right);
                return Ok(self.new_list(left));
            }
        }
        if op == OpCode::Multiply {
            if let (Some(text), Value::Integer(n)) = (self.heap.value_str(a), b) {
                let count = usize::try_from(n.max(0)).unwrap_or(usize::MAX);
                let fits = text.len().checked_mul(count).is_some_and(|len| len <= MAX_STRING_LEN);
                if !fits {
                    return Err(self.error(ExceptionKind::MemoryError, "repeated string is too long"));
                }
                let repeated = text.repeat(count);
                return Ok(self.intern(&repeated));
            }
        }

        let dunder = match op {
            OpCode::Add => Some(Dunder::Add),
            OpCode::Subtract => Some(Dunder::Sub),
            OpCode::Multiply => Some(Dunder::Mul),
            OpCode::Divide => Some(Dunder::Div),
            OpCode::Modulo => Some(Dunder::Mod),
            _ => None,
        };
        if let (Some(dunder), Value::Object(_)) = (dunder, a) {
            if let Some(result) = self.call_dunder(a, dunder, &[b])? {
                return Ok(result);
            }
        }

        let (left, right) = (self.type_name(a), self.type_name(b));
        Err(self.error(
            ExceptionKind::TypeError,
            format!("unsupported operand types for {}: '{left}' and '{right}'", symbol(op)),
        ))
    }

    fn int_binary(&mut self, op: OpCode, x: i64, y: i64) -> Result<Value, Raised> {
        let value = match op {
            OpCode::Add => Value::Integer(x.wrapping_add(y)),
            OpCode::Subtract => Value::Integer(x.wrapping_sub(y)),
            OpCode::Multiply => Value::Integer(x.wrapping_mul(y)),
            OpCode::Divide => {
                if y == 0 {
                    return Err(self.error(ExceptionKind::ZeroDivisionError, "division by zero"));
                }
                Value::Floating(x as f64 / y as f64)
            }
            OpCode::Modulo => {
                if y == 0 {
                    return Err(self.error(ExceptionKind::ZeroDivisionError, "integer modulo by zero"));
                }
                let r = x.wrapping_rem(y);
                Value::Integer(if r != 0 && (r < 0) != (y < 0) { r + y } else { r })
            }
            OpCode::Pow => match u32::try_from(y).ok().and_then(|e| x.checked_pow(e)) {
                Some(result) => Value::Integer(result),
                None => Value::Floating((x as f64).powf(y as f64)),
            },
            OpCode::BitOr => Value::Integer(x | y),
            OpCode::BitXor => Value::Integer(x ^ y),
            OpCode::BitAnd => Value::Integer(x & y),
            OpCode::ShiftLeft | OpCode::ShiftRight if y < 0 => {
                return Err(self.error(ExceptionKind::ValueError, "negative shift count"));
            }
            OpCode::ShiftLeft => Value::Integer(if y >= 64 { 0 } else { x.wrapping_shl(y as u32) }),
            OpCode::ShiftRight => Value::Integer(if y >= 64 { if x < 0 { -1 } else { 0 } } else { x >> y }),
            _ => return Err(self.error(ExceptionKind::SystemError, "not a binary operator")),
        };
        Ok(value)
    }

    fn float_binary(&mut self, op: OpCode, x: f64, y: f64) -> Result<Value, Raised> {
        let value = match op {
            OpCode::Add => x + y,
            OpCode::Subtract => x - y,
            OpCode::Multiply => x * y,
            OpCode::Divide => {
                if y == 0.0 {
                    return Err(self.error(ExceptionKind::ZeroDivisionError, "float division by zero"));
                }
                x / y
            }
            OpCode::Modulo => {
                if y == 0.0 {
                    return Err(self.error(ExceptionKind::ZeroDivisionError, "float modulo"));
                }
                let r = x % y;
                if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r }
            }
            OpCode::Pow => x.powf(y),
            _ => return Err(self.error(ExceptionKind::SystemError, "not a binary operator")),
        };
        Ok(Value::Floating(value))
    }

    pub fn negate(&mut self, value: Value) -> Result<Value, Raised> {
        match value {
            Value::Integer(i) => Ok(Value::Integer(i.wrapping_neg())),
            Value::Floating(f) => Ok(Value::Floating(-f)),
            _ => match self.call_dunder(value, Dunder::Neg, &[])? {
                Some(result) => Ok(result),
                None => {
                    let name = self.type_name(value);
                    Err(self.error(ExceptionKind::TypeError, format!("bad operand type for unary -: '{name}'")))
                }
            },
        }
    }

    // ── Conversions ─────────────────────────────────────────────────

    /// `str(value)`.
    pub fn to_str(&mut self, value: Value) -> Result<String, Raised> {
        match value {
            Value::None => Ok("None".to_string()),
            Value::Boolean(true) => Ok("True".to_string()),
            Value::Boolean(false) => Ok("False".to_string()),
            Value::Integer(i) => Ok(i.to_string()),
            Value::Floating(f) => Ok(format_float(f)),
            Value::Object(r) => {
                if let Some(text) = self.heap.as_str(r) {
                    return Ok(text.to_string());
                }
                match self.call_dunder(value, Dunder::Str, &[])? {
                    Some(result) => self.expect_string(result, "__str__"),
                    None => self.repr(value),
                }
            }
            _ => self.repr(value),
        }
    }

    /// `repr(value)`.
    pub fn repr(&mut self, value: Value) -> Result<String, Raised> {
        let mut active = Vec::new();
        self.repr_inner(value, &mut active)
    }

    fn expect_string(&mut self, value: Value, method: &str) -> Result<String, Raised> {
        match self.heap.value_str(value) {
            Some(text) => Ok(text.to_string()),
            None => {
                let name = self.type_name(value);
                Err(self.error(ExceptionKind::TypeError, format!("{method} returned non-string (type {name})")))
            }
        }
    }

    fn repr_inner(&mut self, value: Value, active: &mut Vec<ObjRef>) -> Result<String, Raised> {
        let r = match value {
            Value::Object(r) => r,
            Value::Handler(handler) => return Ok(format!("<handler {:?} -> {}>", handler.kind, handler.target)),
            Value::KwArgs(n) => return Ok(format!("<kwargs {n}>")),
            _ => return self.to_str(value),
        };
        if let Some(text) = self.heap.as_str(r) {
            return Ok(quote(text));
        }
        if let Some(result) = self.call_dunder(value, Dunder::Repr, &[])? {
            return self.expect_string(result, "__repr__");
        }
        if active.contains(&r) {
            return Ok("...".to_string());
        }

        let text = match self.heap.get(r) {
            Object::Function(function) => format!("<function {}>", self.heap.name(function.name)),
            Object::Closure(closure) => format!("<function {}>", self.heap.name(closure.proto.name)),
            Object::Native(native) => format!("<built-in function {}>", native.name),
            Object::BoundMethod(bound) => {
                let method = bound.method;
                let name = match method.as_object().map(|m| self.heap.get(m)) {
                    Some(Object::Closure(closure)) => self.heap.name(closure.proto.name).to_string(),
                    Some(Object::Native(native)) => native.name.to_string(),
                    _ => "?".to_string(),
                };
                format!("<bound method {name}>")
            }
            Object::Class(class) => format!("<class '{}'>", self.heap.name(class.name)),
            Object::Upvalue(_) => "<upvalue>".to_string(),
            Object::Str(_) => unreachable!("strings are handled above"),
            Object::Instance(instance) => {
                let class = instance.class;
                match &instance.payload {
                    Payload::List(items) => {
                        let items = items.clone();
                        active.push(r);
                        let parts = self.with_roots(&items, |vm| {
                            items.iter().map(|&item| vm.repr_inner(item, active)).collect::<Result<Vec<_>, _>>()
                        });
                        active.pop();
                        format!("[{}]", parts?.join(", "))
                    }
                    Payload::Dict(dict) => {
                        let entries: Vec<_> = dict.iter().collect();
                        let held: Vec<Value> = entries.iter().flat_map(|&(key, item)| [key, item]).collect();
                        active.push(r);
                        let parts = self.with_roots(&held, |vm| {
                            let mut parts = Vec::with_capacity(entries.len());
                            for &(key, item) in &entries {
                                let key = vm.repr_inner(key, active)?;
                                let item = vm.repr_inner(item, active)?;
                                parts.push(format!("{key}: {item}"));
                            }
                            Ok(parts)
                        });
                        active.pop();
                        format!("{{{}}}", parts?.join(", "))
                    }
                    Payload::None if class == self.classes.module => {
                        let name = self.get_field(r, self.names.name);
                        let name = name.and_then(|n| self.heap.value_str(n)).unwrap_or("?");
                        format!("<module '{name}'>")
                    }
                    Payload::None => {
                        let name = self.heap.as_class(class).map(|c| self.heap.name(c.name)).unwrap_or("object");
                        format!("<{name} object>")
                    }
                }
            }
        };
        Ok(text)
    }
}
