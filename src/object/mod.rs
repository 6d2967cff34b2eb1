//! Heap object kinds and typed accessors over the [`Heap`].

pub mod class;

use std::collections::HashMap;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::exception::Raised;
use crate::heap::{Heap, ObjRef};
use crate::value::{Value, ValueKey};
use crate::vm::Vm;

pub use class::{Class, Dunder};

/// Host function signature. `args` includes the receiver for methods;
/// `kwargs` is a `dict` instance when the native accepts keywords and the
/// caller passed any.
pub type NativeFn = fn(&mut Vm, &[Value], Option<ObjRef>) -> Result<Value, Raised>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>,
}

impl Arity {
    pub const fn exactly(n: usize) -> Self {
        Arity { min: n, max: Some(n) }
    }

    pub const fn between(min: usize, max: usize) -> Self {
        Arity { min, max: Some(max) }
    }

    pub const fn at_least(min: usize) -> Self {
        Arity { min, max: None }
    }

    pub fn accepts(self, n: usize) -> bool {
        n >= self.min && self.max.is_none_or(|max| n <= max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    Function,
    /// Invoked immediately on attribute lookup with the receiver as its only
    /// argument.
    Property,
}

#[derive(Clone)]
pub struct Native {
    pub name: &'static str,
    pub function: NativeFn,
    pub arity: Arity,
    pub kind: NativeKind,
    pub accepts_kwargs: bool,
}

impl std::fmt::Debug for Native {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Native").field("name", &self.name).field("arity", &self.arity).finish()
    }
}

#[derive(Debug)]
pub struct Function {
    pub name: ObjRef,
    pub chunk: Chunk,
    /// Positional parameter names; the first `required_args.len()` slots.
    pub required_args: Vec<ObjRef>,
    /// Optional parameters following the required ones.
    pub keyword_args: Vec<ObjRef>,
    pub collects_args: bool,
    pub collects_kwargs: bool,
    pub upvalue_count: usize,
    pub docstring: Option<ObjRef>,
}

impl Function {
    pub fn new(name: ObjRef, chunk: Chunk) -> Self {
        Function {
            name,
            chunk,
            required_args: Vec::new(),
            keyword_args: Vec::new(),
            collects_args: false,
            collects_kwargs: false,
            upvalue_count: 0,
            docstring: None,
        }
    }

    /// Number of parameter slots, including collectors.
    pub fn parameter_slots(&self) -> usize {
        self.required_args.len()
            + self.keyword_args.len()
            + usize::from(self.collects_args)
            + usize::from(self.collects_kwargs)
    }
}

#[derive(Debug)]
pub struct Closure {
    pub function: ObjRef,
    pub proto: Rc<Function>,
    pub upvalues: Vec<ObjRef>,
    /// Module whose fields are this closure's globals.
    pub globals: ObjRef,
}

/// A captured variable: a live operand-stack slot until the owning frame
/// returns, then a heap copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
    index: HashMap<ValueKey, usize>,
}

impl Dict {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: Value) -> Option<Value> {
        self.index.get(&ValueKey(key)).map(|&i| self.entries[i].1)
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        match self.index.get(&ValueKey(key)) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(ValueKey(key), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn remove(&mut self, key: Value) -> Option<Value> {
        let i = self.index.remove(&ValueKey(key))?;
        let (_, value) = self.entries.swap_remove(i);
        if let Some((moved, _)) = self.entries.get(i) {
            self.index.insert(ValueKey(*moved), i);
        }
        Some(value)
    }

    pub fn keys(&self) -> impl Iterator<Item = Value> + '_ {
        self.entries.iter().map(|(k, _)| *k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().copied()
    }
}

/// Native storage carried by instances of `list`, `dict` and their
/// subclasses.
#[derive(Debug, Default)]
pub enum Payload {
    #[default]
    None,
    List(Vec<Value>),
    Dict(Dict),
}

#[derive(Debug)]
pub struct Instance {
    pub class: ObjRef,
    pub fields: HashMap<ObjRef, Value>,
    pub payload: Payload,
}

impl Instance {
    pub fn new(class: ObjRef, payload: Payload) -> Self {
        Instance { class, fields: HashMap::new(), payload }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Value,
}

#[derive(Debug)]
pub enum Object {
    Str(Rc<str>),
    Function(Rc<Function>),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    Native(Native),
}

fn trace_value(value: Value, work: &mut Vec<ObjRef>) {
    if let Value::Object(r) = value {
        work.push(r);
    }
}

impl Object {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::Str(_) => "str",
            Object::Function(_) => "function",
            Object::Closure(_) => "closure",
            Object::Upvalue(_) => "upvalue",
            Object::Class(_) => "class",
            Object::Instance(_) => "instance",
            Object::BoundMethod(_) => "method",
            Object::Native(_) => "native",
        }
    }

    /// Push every object this one references.
    pub fn trace(&self, work: &mut Vec<ObjRef>) {
        match self {
            Object::Str(_) | Object::Native(_) => {}
            Object::Function(function) => {
                work.push(function.name);
                work.extend(&function.required_args);
                work.extend(&function.keyword_args);
                work.extend(function.docstring);
                for &constant in &function.chunk.constants {
                    trace_value(constant, work);
                }
            }
            Object::Closure(closure) => {
                work.push(closure.function);
                work.push(closure.globals);
                work.extend(&closure.upvalues);
            }
            Object::Upvalue(Upvalue::Closed(value)) => trace_value(*value, work),
            Object::Upvalue(Upvalue::Open(_)) => {}
            Object::Class(class) => class.trace(work),
            Object::Instance(instance) => {
                work.push(instance.class);
                for (&name, &value) in &instance.fields {
                    work.push(name);
                    trace_value(value, work);
                }
                match &instance.payload {
                    Payload::None => {}
                    Payload::List(items) => items.iter().for_each(|&v| trace_value(v, work)),
                    Payload::Dict(dict) => {
                        for (key, value) in dict.iter() {
                            trace_value(key, work);
                            trace_value(value, work);
                        }
                    }
                }
            }
            Object::BoundMethod(bound) => {
                trace_value(bound.receiver, work);
                trace_value(bound.method, work);
            }
        }
    }
}

// ── Typed accessors ─────────────────────────────────────────────────

impl Heap {
    pub fn as_str(&self, r: ObjRef) -> Option<&str> {
        match self.get(r) {
            Object::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Text of an interned name. Names handed to the VM are always strings.
    pub fn name(&self, r: ObjRef) -> &str {
        self.as_str(r).unwrap_or("<?>")
    }

    pub fn value_str(&self, value: Value) -> Option<&str> {
        self.as_str(value.as_object()?)
    }

    pub fn as_class(&self, r: ObjRef) -> Option<&Class> {
        match self.get(r) {
            Object::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn as_class_mut(&mut self, r: ObjRef) -> Option<&mut Class> {
        match self.get_mut(r) {
            Object::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn as_instance(&self, r: ObjRef) -> Option<&Instance> {
        match self.get(r) {
            Object::Instance(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn as_instance_mut(&mut self, r: ObjRef) -> Option<&mut Instance> {
        match self.get_mut(r) {
            Object::Instance(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn as_closure(&self, r: ObjRef) -> Option<&Closure> {
        match self.get(r) {
            Object::Closure(closure) => Some(closure),
            _ => None,
        }
    }

    pub fn as_function(&self, r: ObjRef) -> Option<&Rc<Function>> {
        match self.get(r) {
            Object::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_list(&self, r: ObjRef) -> Option<&Vec<Value>> {
        match &self.as_instance(r)?.payload {
            Payload::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self, r: ObjRef) -> Option<&mut Vec<Value>> {
        match &mut self.as_instance_mut(r)?.payload {
            Payload::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self, r: ObjRef) -> Option<&Dict> {
        match &self.as_instance(r)?.payload {
            Payload::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self, r: ObjRef) -> Option<&mut Dict> {
        match &mut self.as_instance_mut(r)?.payload {
            Payload::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn is_callable(&self, value: Value) -> bool {
        match value {
            Value::Object(r) => match self.get(r) {
                Object::Closure(_) | Object::BoundMethod(_) | Object::Class(_) => true,
                Object::Native(native) => native.kind == NativeKind::Function,
                Object::Instance(instance) => self
                    .as_class(instance.class)
                    .is_some_and(|class| class.slot(Dunder::Call).is_some()),
                _ => false,
            },
            _ => false,
        }
    }
}
