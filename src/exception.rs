//! Exception kinds raised by the VM itself and the typed handler stack.

use crate::value::{HandlerKind, Value};

/// An exception in flight. Carries the exception value; the traceback has
/// already been recorded by the VM at the raise point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Raised(pub Value);

macro_rules! exception_kinds {
    ($( $variant:ident, )*) => {
        /// Builtin exception classes, all deriving from `Exception`.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ExceptionKind {
            $( $variant, )*
        }

        impl ExceptionKind {
            pub const ALL: &'static [ExceptionKind] = &[$( ExceptionKind::$variant, )*];

            pub fn name(self) -> &'static str {
                match self {
                    $( ExceptionKind::$variant => stringify!($variant), )*
                }
            }
        }
    };
}

exception_kinds! {
    TypeError,
    ArgumentError,
    IndexError,
    KeyError,
    AttributeError,
    NameError,
    ImportError,
    OSError,
    ValueError,
    ZeroDivisionError,
    KeyboardInterrupt,
    RecursionError,
    NotImplementedError,
    SystemError,
    MemoryError,
}

/// How a `WITH` region is being left once its cleanup has run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pending {
    Raise(Value),
    Return(Value),
}

/// One active `try` or `with` region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandlerFrame {
    pub kind: HandlerKind,
    /// Absolute code offset of the except/cleanup entry.
    pub target: usize,
    /// Index of the call frame that pushed the region.
    pub frame: usize,
    /// Operand-stack slot holding the region's placeholder value.
    pub slot: usize,
    pub pending: Option<Pending>,
}

/// Regions are searched innermost first.
#[derive(Debug, Default)]
pub struct HandlerStack {
    records: Vec<HandlerFrame>,
}

impl HandlerStack {
    pub fn push(&mut self, record: HandlerFrame) {
        self.records.push(record);
    }

    pub fn pop(&mut self) -> Option<HandlerFrame> {
        self.records.pop()
    }

    pub fn last(&self) -> Option<&HandlerFrame> {
        self.records.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut HandlerFrame> {
        self.records.last_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.records.truncate(len);
    }

    /// Index of the innermost region owned by call frame `frame_floor` or a
    /// deeper frame. Regions of shallower frames belong to an outer `run`.
    pub fn innermost_from(&self, frame_floor: usize) -> Option<usize> {
        match self.records.last() {
            Some(record) if record.frame >= frame_floor => Some(self.records.len() - 1),
            _ => None,
        }
    }

    /// Drop records belonging to frames at or above `frame`.
    pub fn discard_frames_from(&mut self, frame: usize) {
        while self.records.last().is_some_and(|r| r.frame >= frame) {
            self.records.pop();
        }
    }

    pub fn get(&self, index: usize) -> Option<&HandlerFrame> {
        self.records.get(index)
    }

    pub fn pending_values(&self) -> impl Iterator<Item = Value> + '_ {
        self.records.iter().filter_map(|r| match r.pending {
            Some(Pending::Raise(v)) | Some(Pending::Return(v)) => Some(v),
            None => None,
        })
    }
}
