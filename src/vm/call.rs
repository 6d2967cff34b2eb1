//! The call protocol: argument normalisation, parameter binding and frame
//! entry for every kind of callable.

use std::rc::Rc;

use super::{CallFrame, Vm};
use crate::exception::{ExceptionKind, Raised};
use crate::heap::ObjRef;
use crate::object::{Dunder, Function, Instance, Native, Object, Payload};
use crate::object::class::PayloadKind;
use crate::value::{KWARGS_DICT, KWARGS_LIST, KWARGS_SINGLE, KWARGS_UNSET, Value};

/// What a call left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallOutcome {
    /// A bytecode frame was entered; its result arrives when it returns.
    Frame,
    /// The call completed and its result replaced the callee on the stack.
    Done,
}

type Keywords = Vec<(ObjRef, Value)>;

impl Vm {
    /// Call the value `argc` slots below the top with everything above it as
    /// arguments. Handles the `KWARGS` calling form.
    pub(crate) fn call_value(&mut self, argc: usize) -> Result<CallOutcome, Raised> {
        if argc >= self.stack.len() {
            return Err(self.error(ExceptionKind::SystemError, "call arguments exceed the stack"));
        }
        let slot = self.stack.len() - argc - 1;
        let keywords = match self.peek(0) {
            Value::KwArgs(pairs) if argc > 0 => self.collect_keywords(slot, pairs)?,
            _ => Vec::new(),
        };
        self.call_with(slot, keywords, None)
    }

    /// Call `callee` with positional `args` and run it to completion.
    pub fn call_sync(&mut self, callee: Value, args: &[Value]) -> Result<Value, Raised> {
        let floor = self.frames.len();
        let slot = self.stack.len();
        self.push(callee);
        self.stack.extend_from_slice(args);
        match self.call_with(slot, Vec::new(), None) {
            Ok(CallOutcome::Done) => Ok(self.pop()),
            Ok(CallOutcome::Frame) => self.run(floor),
            Err(raised) => {
                self.stack.truncate(slot);
                Err(raised)
            }
        }
    }

    /// Turn `(name, value)` and expansion pairs into plain positionals on the
    /// stack plus a keyword list.
    fn collect_keywords(&mut self, slot: usize, pairs: i64) -> Result<Keywords, Raised> {
        let available = self.stack.len() - slot - 2;
        let pairs = usize::try_from(pairs).unwrap_or(usize::MAX);
        if pairs.saturating_mul(2) > available {
            return Err(self.error(ExceptionKind::SystemError, "malformed keyword argument list"));
        }
        self.stack.pop();
        let start = self.stack.len() - pairs * 2;
        let items = self.stack.split_off(start);

        let mut keywords = Vec::new();
        for pair in items.chunks_exact(2) {
            let (key, value) = (pair[0], pair[1]);
            match key {
                Value::KwArgs(KWARGS_SINGLE) => self.push(value),
                Value::KwArgs(KWARGS_LIST) => {
                    let Some(items) = value.as_object().and_then(|r| self.heap.as_list(r)).cloned() else {
                        let name = self.type_name(value);
                        return Err(self.error(
                            ExceptionKind::TypeError,
                            format!("argument after * must be a list, not '{name}'"),
                        ));
                    };
                    self.stack.extend(items);
                }
                Value::KwArgs(KWARGS_DICT) => {
                    let Some(entries) = value
                        .as_object()
                        .and_then(|r| self.heap.as_dict(r))
                        .map(|d| d.iter().collect::<Vec<_>>())
                    else {
                        let name = self.type_name(value);
                        return Err(self.error(
                            ExceptionKind::TypeError,
                            format!("argument after ** must be a dict, not '{name}'"),
                        ));
                    };
                    for (key, value) in entries {
                        match key.as_object().filter(|&r| self.heap.as_str(r).is_some()) {
                            Some(name) => keywords.push((name, value)),
                            None => {
                                return Err(self.error(ExceptionKind::TypeError, "keywords must be strings"));
                            }
                        }
                    }
                }
                Value::Object(name) if self.heap.as_str(name).is_some() => keywords.push((name, value)),
                _ => {
                    return Err(self.error(ExceptionKind::SystemError, "malformed keyword argument pair"));
                }
            }
        }
        Ok(keywords)
    }

    /// Dispatch on the callee at `slot`; positionals are everything above it.
    pub(crate) fn call_with(
        &mut self,
        slot: usize,
        keywords: Keywords,
        returns: Option<Value>,
    ) -> Result<CallOutcome, Raised> {
        self.poll_interrupt()?;
        let callee = self.stack[slot];
        let Value::Object(r) = callee else {
            return Err(self.not_callable(callee));
        };
        match self.heap.get(r) {
            Object::Closure(closure) => {
                let function = closure.proto.clone();
                let globals = closure.globals;
                self.bind_arguments(&function, slot, keywords)?;
                self.push_frame(CallFrame { closure: r, function, ip: 0, base: slot + 1, globals, returns })?;
                Ok(CallOutcome::Frame)
            }
            Object::Native(native) => {
                let native = native.clone();
                self.call_native(&native, slot, keywords)
            }
            Object::BoundMethod(bound) => {
                let bound = *bound;
                self.stack[slot] = bound.method;
                self.stack.insert(slot + 1, bound.receiver);
                self.call_with(slot, keywords, returns)
            }
            Object::Class(_) => self.call_class(r, slot, keywords),
            Object::Instance(instance) => {
                let class = instance.class;
                let Some(method) = self.dunder(class, Dunder::Call) else {
                    return Err(self.not_callable(callee));
                };
                self.stack[slot] = method;
                self.stack.insert(slot + 1, callee);
                self.call_with(slot, keywords, returns)
            }
            _ => Err(self.not_callable(callee)),
        }
    }

    fn not_callable(&mut self, callee: Value) -> Raised {
        let name = self.type_name(callee);
        self.error(ExceptionKind::TypeError, format!("'{name}' object is not callable"))
    }

    fn push_frame(&mut self, frame: CallFrame) -> Result<(), Raised> {
        if self.frames.len() >= self.config.max_frames {
            return Err(self.error(ExceptionKind::RecursionError, "maximum recursion depth exceeded"));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Arrange the frame window of `function`: required and keyword
    /// parameters in declaration order, then the collectors.
    fn bind_arguments(&mut self, function: &Rc<Function>, slot: usize, keywords: Keywords) -> Result<(), Raised> {
        let positional = self.stack.len() - slot - 1;
        let required = function.required_args.len();
        let declared = required + function.keyword_args.len();
        if keywords.is_empty() && !function.collects_args && !function.collects_kwargs && positional == declared {
            return Ok(());
        }

        let fname = self.heap.name(function.name).to_string();
        let mut extra = Vec::new();
        if positional > declared {
            if !function.collects_args {
                let bound = if declared == required { "exactly" } else { "at most" };
                return Err(self.error(
                    ExceptionKind::ArgumentError,
                    format!("{fname}() takes {bound} {declared} positional arguments ({positional} given)"),
                ));
            }
            extra = self.stack.split_off(slot + 1 + declared);
        }
        self.stack.resize(slot + 1 + declared, Value::KwArgs(KWARGS_UNSET));

        let mut collected = Vec::new();
        for (name, value) in keywords {
            let position = function.required_args.iter().chain(&function.keyword_args).position(|&n| n == name);
            match position {
                Some(i) if !self.stack[slot + 1 + i].is_unset() => {
                    let name = self.heap.name(name).to_string();
                    return Err(self.error(
                        ExceptionKind::ArgumentError,
                        format!("{fname}() got multiple values for argument '{name}'"),
                    ));
                }
                Some(i) => self.stack[slot + 1 + i] = value,
                None if function.collects_kwargs => collected.push((name, value)),
                None => {
                    let name = self.heap.name(name).to_string();
                    return Err(self.error(
                        ExceptionKind::ArgumentError,
                        format!("{fname}() got an unexpected keyword argument '{name}'"),
                    ));
                }
            }
        }

        if let Some(missing) = (0..required).find(|&i| self.stack[slot + 1 + i].is_unset()) {
            let name = self.heap.name(function.required_args[missing]).to_string();
            return Err(self.error(
                ExceptionKind::ArgumentError,
                format!("{fname}() missing required argument '{name}'"),
            ));
        }

        if function.collects_args {
            let list = self.new_list(extra);
            self.push(list);
        }
        if function.collects_kwargs {
            let dict = self.new_dict();
            if let Some(entries) = self.heap.as_dict_mut(dict) {
                for (name, value) in collected {
                    entries.insert(Value::Object(name), value);
                }
            }
            self.push(Value::Object(dict));
        }
        Ok(())
    }

    fn call_native(&mut self, native: &Native, slot: usize, keywords: Keywords) -> Result<CallOutcome, Raised> {
        let argc = self.stack.len() - slot - 1;
        if !keywords.is_empty() && !native.accepts_kwargs {
            return Err(self.error(
                ExceptionKind::ArgumentError,
                format!("{}() takes no keyword arguments", native.name),
            ));
        }
        if !native.arity.accepts(argc) {
            let expected = match native.arity.max {
                Some(max) if max == native.arity.min => format!("exactly {max}"),
                Some(max) => format!("{} to {max}", native.arity.min),
                None => format!("at least {}", native.arity.min),
            };
            return Err(self.error(
                ExceptionKind::ArgumentError,
                format!("{}() expects {expected} arguments ({argc} given)", native.name),
            ));
        }
        let kwargs = if keywords.is_empty() {
            None
        } else {
            let dict = self.new_dict();
            if let Some(entries) = self.heap.as_dict_mut(dict) {
                for (name, value) in keywords {
                    entries.insert(Value::Object(name), value);
                }
            }
            Some(dict)
        };

        let args = self.stack[slot + 1..].to_vec();
        self.gc_paused += 1;
        let result = (native.function)(self, &args, kwargs);
        self.gc_paused -= 1;
        let value = result?;
        self.stack.truncate(slot);
        self.push(value);
        Ok(CallOutcome::Done)
    }

    /// Calling a class: allocate the instance and run its initializer with
    /// the instance prepended. A bytecode initializer always yields the
    /// instance; a native one yields whatever it returns.
    fn call_class(&mut self, class: ObjRef, slot: usize, keywords: Keywords) -> Result<CallOutcome, Raised> {
        let payload = match self.heap.as_class(class).map(|c| c.payload) {
            Some(PayloadKind::List) => Payload::List(Vec::new()),
            Some(PayloadKind::Dict) => Payload::Dict(Default::default()),
            _ => Payload::None,
        };
        let instance = Value::Object(self.heap.alloc(Object::Instance(Instance::new(class, payload))));

        match self.dunder(class, Dunder::Init) {
            Some(init) => {
                self.stack[slot] = init;
                self.stack.insert(slot + 1, instance);
                self.call_with(slot, keywords, Some(instance))
            }
            None if self.stack.len() > slot + 1 || !keywords.is_empty() => {
                let name = self.heap.as_class(class).map(|c| self.heap.name(c.name).to_string()).unwrap_or_default();
                Err(self.error(ExceptionKind::ArgumentError, format!("{name}() takes no arguments")))
            }
            None => {
                self.stack.truncate(slot);
                self.push(instance);
                Ok(CallOutcome::Done)
            }
        }
    }
}
