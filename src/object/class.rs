//! Classes, the dunder-slot cache and method resolution.

use std::collections::HashMap;

use crate::heap::{Heap, ObjRef};
use crate::value::Value;

macro_rules! dunders {
    ($( $variant:ident => $name:literal, )*) => {
        /// Special methods cached on a class when it is finalised.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Dunder {
            $( $variant, )*
        }

        impl Dunder {
            pub const ALL: &'static [Dunder] = &[$( Dunder::$variant, )*];
            pub const COUNT: usize = Dunder::ALL.len();

            pub fn name(self) -> &'static str {
                match self {
                    $( Dunder::$variant => $name, )*
                }
            }

            pub fn from_name(name: &str) -> Option<Dunder> {
                match name {
                    $( $name => Some(Dunder::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

dunders! {
    Init => "__init__",
    Str => "__str__",
    Repr => "__repr__",
    Get => "__get__",
    Set => "__set__",
    DelItem => "__delitem__",
    Eq => "__eq__",
    Lt => "__lt__",
    Gt => "__gt__",
    Add => "__add__",
    Sub => "__sub__",
    Mul => "__mul__",
    Div => "__div__",
    Mod => "__mod__",
    Neg => "__neg__",
    Call => "__call__",
    Enter => "__enter__",
    Exit => "__exit__",
    SetAttr => "__setattr__",
    Len => "__len__",
}

/// What kind of native payload instances of a class carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadKind {
    #[default]
    None,
    List,
    Dict,
}

#[derive(Debug)]
pub struct Class {
    pub name: ObjRef,
    pub base: Option<ObjRef>,
    pub methods: HashMap<ObjRef, Value>,
    slots: [Option<Value>; Dunder::COUNT],
    pub finalized: bool,
    pub payload: PayloadKind,
    pub filename: Option<ObjRef>,
    pub doc: Option<ObjRef>,
}

impl Class {
    pub fn new(name: ObjRef, base: Option<ObjRef>) -> Self {
        Class {
            name,
            base,
            methods: HashMap::new(),
            slots: [None; Dunder::COUNT],
            finalized: false,
            payload: PayloadKind::None,
            filename: None,
            doc: None,
        }
    }

    pub fn slot(&self, dunder: Dunder) -> Option<Value> {
        self.slots[dunder as usize]
    }

    pub(crate) fn trace(&self, work: &mut Vec<ObjRef>) {
        work.push(self.name);
        work.extend(self.base);
        work.extend(self.filename);
        work.extend(self.doc);
        for (&name, &method) in &self.methods {
            work.push(name);
            if let Value::Object(r) = method {
                work.push(r);
            }
        }
        for slot in self.slots.iter().flatten() {
            if let Value::Object(r) = slot {
                work.push(*r);
            }
        }
    }
}

/// Interned names of every [`Dunder`], indexed by discriminant.
#[derive(Debug, Clone)]
pub struct DunderNames([ObjRef; Dunder::COUNT]);

impl DunderNames {
    pub fn intern(heap: &mut Heap) -> Self {
        let first = heap.intern(Dunder::ALL[0].name());
        let mut names = [first; Dunder::COUNT];
        for &dunder in Dunder::ALL {
            names[dunder as usize] = heap.intern(dunder.name());
        }
        DunderNames(names)
    }

    pub fn get(&self, dunder: Dunder) -> ObjRef {
        self.0[dunder as usize]
    }

    pub fn lookup(&self, name: ObjRef) -> Option<Dunder> {
        self.0.iter().position(|&n| n == name).map(|i| Dunder::ALL[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.0.iter().copied()
    }
}

/// Search `class` and then its ancestors, nearest first.
pub fn find_method(heap: &Heap, class: ObjRef, name: ObjRef) -> Option<Value> {
    let mut current = Some(class);
    while let Some(r) = current {
        let class = heap.as_class(r)?;
        if let Some(&method) = class.methods.get(&name) {
            return Some(method);
        }
        current = class.base;
    }
    None
}

/// True when `class` is `ancestor` or derives from it.
pub fn is_subclass(heap: &Heap, class: ObjRef, ancestor: ObjRef) -> bool {
    let mut current = Some(class);
    while let Some(r) = current {
        if r == ancestor {
            return true;
        }
        current = heap.as_class(r).and_then(|c| c.base);
    }
    false
}

/// Resolve every dunder through the inheritance chain and cache the result.
/// A class is finalised once; later calls only refresh the cache.
pub fn finalize(heap: &mut Heap, class: ObjRef, names: &DunderNames) {
    let mut slots = [None; Dunder::COUNT];
    for &dunder in Dunder::ALL {
        slots[dunder as usize] = find_method(heap, class, names.get(dunder));
    }
    if let Some(class) = heap.as_class_mut(class) {
        class.slots = slots;
        class.finalized = true;
    }
}
