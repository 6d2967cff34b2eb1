use std::hash::{Hash, Hasher};

use crate::heap::ObjRef;

/// Keyword-argument marker: one positional value follows.
pub const KWARGS_SINGLE: i64 = i64::MAX;
/// Keyword-argument marker: a list to spread as positionals follows.
pub const KWARGS_LIST: i64 = i64::MAX - 1;
/// Keyword-argument marker: a dict to spread as keywords follows.
pub const KWARGS_DICT: i64 = i64::MAX - 2;
/// Bound to optional parameters the caller did not supply.
pub const KWARGS_UNSET: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Try,
    With,
}

/// A tagged jump target: the kind of protected region and where its
/// except/cleanup code starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handler {
    pub kind: HandlerKind,
    pub target: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    None,
    Boolean(bool),
    Integer(i64),
    Floating(f64),
    Handler(Handler),
    Object(ObjRef),
    KwArgs(i64),
}

impl Default for Value {
    fn default() -> Self {
        Value::None
    }
}

impl Value {
    /// Identity / representation equality. Strings are interned, so two
    /// strings with the same contents are `same`.
    pub fn same(self, other: Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Floating(a), Value::Floating(b)) => a.to_bits() == b.to_bits() || a == b,
            (Value::Handler(a), Value::Handler(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::KwArgs(a), Value::KwArgs(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_object(self) -> Option<ObjRef> {
        match self {
            Value::Object(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_none(self) -> bool {
        matches!(self, Value::None)
    }

    pub fn is_unset(self) -> bool {
        matches!(self, Value::KwArgs(KWARGS_UNSET))
    }

    /// Numeric view used by mixed int/float arithmetic and comparisons.
    pub fn as_number(self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(i as f64),
            Value::Floating(f) => Some(f),
            _ => None,
        }
    }

    /// Truthiness of the non-object variants. Objects are decided by the VM,
    /// which can see string and container lengths.
    pub fn primitive_truthiness(self) -> Option<bool> {
        match self {
            Value::None => Some(false),
            Value::Boolean(b) => Some(b),
            Value::Integer(i) => Some(i != 0),
            Value::Floating(f) => Some(f != 0.0),
            Value::Handler(_) | Value::KwArgs(_) => Some(true),
            Value::Object(_) => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Floating(f)
    }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Self {
        Value::Object(r)
    }
}

/// Dictionary key: hashes and compares with [`Value::same`].
#[derive(Debug, Clone, Copy)]
pub struct ValueKey(pub Value);

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.same(other.0)
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.0).hash(state);
        match self.0 {
            Value::None => {}
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) | Value::KwArgs(i) => i.hash(state),
            // `same` treats 0.0 and -0.0 as one key.
            Value::Floating(f) => (if f == 0.0 { 0u64 } else { f.to_bits() }).hash(state),
            Value::Handler(h) => h.hash(state),
            Value::Object(r) => r.hash(state),
        }
    }
}
