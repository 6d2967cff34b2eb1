//! Attribute access, `super` lookup and subscripting through dunder slots.

use super::Vm;
use crate::exception::{ExceptionKind, Raised};
use crate::heap::ObjRef;
use crate::object::class::find_method;
use crate::object::{BoundMethod, Dunder, NativeKind, Object};
use crate::value::Value;

impl Vm {
    /// Turn a value found on a class into what an attribute read of
    /// `receiver` yields: methods bind, native properties run.
    fn bind(&mut self, receiver: Value, found: Value) -> Result<Value, Raised> {
        let Value::Object(r) = found else { return Ok(found) };
        match self.heap.get(r) {
            Object::Closure(_) => {}
            Object::Native(native) if native.kind == NativeKind::Property => {
                return self.call_sync(found, &[receiver]);
            }
            Object::Native(_) => {}
            _ => return Ok(found),
        }
        let bound = BoundMethod { receiver, method: found };
        Ok(Value::Object(self.heap.alloc(Object::BoundMethod(bound))))
    }

    /// Attribute read without the error: fields, then the class chain.
    pub fn lookup_attribute(&mut self, target: Value, name: ObjRef) -> Result<Option<Value>, Raised> {
        if let Value::Object(r) = target {
            match self.heap.get(r) {
                Object::Instance(instance) => {
                    if let Some(&value) = instance.fields.get(&name) {
                        return Ok(Some(value));
                    }
                }
                Object::Class(_) => {
                    if let Some(value) = find_method(&self.heap, r, name) {
                        return Ok(Some(value));
                    }
                }
                _ => {}
            }
        }
        let class = self.type_of(target);
        match find_method(&self.heap, class, name) {
            Some(found) => self.bind(target, found).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_attribute(&mut self, target: Value, name: ObjRef) -> Result<Value, Raised> {
        match self.lookup_attribute(target, name)? {
            Some(value) => Ok(value),
            None => Err(self.no_attribute(target, name)),
        }
    }

    fn no_attribute(&mut self, target: Value, name: ObjRef) -> Raised {
        let type_name = self.type_name(target);
        let name = self.heap.name(name).to_string();
        self.error(
            ExceptionKind::AttributeError,
            format!("'{type_name}' object has no attribute '{name}'"),
        )
    }

    /// Attribute write. Instances go through a user `__setattr__` when the
    /// class overrides it; classes get a method-table entry.
    pub fn set_attribute(&mut self, target: Value, name: ObjRef, value: Value) -> Result<Value, Raised> {
        let Value::Object(r) = target else {
            return Err(self.no_attribute(target, name));
        };
        match self.heap.get(r) {
            Object::Instance(instance) => {
                let class = instance.class;
                match self.dunder(class, Dunder::SetAttr) {
                    Some(setter) if !setter.same(self.classes.object_setattr) => {
                        let key = Value::Object(name);
                        self.call_sync(setter, &[target, key, value])?;
                    }
                    _ => {
                        if let Some(instance) = self.heap.as_instance_mut(r) {
                            instance.fields.insert(name, value);
                        }
                    }
                }
                Ok(value)
            }
            Object::Class(_) => {
                self.define_method(r, name, value)?;
                Ok(value)
            }
            _ => Err(self.no_attribute(target, name)),
        }
    }

    /// Write `name` into the method table of `class`. Special names are
    /// cached at finalisation, so a finalised class refuses them.
    pub(crate) fn define_method(&mut self, class: ObjRef, name: ObjRef, method: Value) -> Result<(), Raised> {
        let finalized = self.heap.as_class(class).is_some_and(|c| c.finalized);
        if finalized && self.dunders.lookup(name).is_some() {
            let class_name = self.heap.as_class(class).map(|c| self.heap.name(c.name)).unwrap_or("?").to_string();
            let name = self.heap.name(name).to_string();
            return Err(self.error(
                ExceptionKind::TypeError,
                format!("cannot redefine special method '{name}' of finalized class '{class_name}'"),
            ));
        }
        if let Some(class) = self.heap.as_class_mut(class) {
            class.methods.insert(name, method);
        }
        Ok(())
    }

    /// `super().name` from a method of a class whose base is `base`.
    pub(crate) fn get_super(&mut self, receiver: Value, base: Value, name: ObjRef) -> Result<Value, Raised> {
        let Some(base) = base.as_object().filter(|&r| self.heap.as_class(r).is_some()) else {
            return Err(self.error(ExceptionKind::TypeError, "super() argument is not a class"));
        };
        match find_method(&self.heap, base, name) {
            Some(found) => self.bind(receiver, found),
            None => {
                let base_name = self.heap.as_class(base).map(|c| self.heap.name(c.name)).unwrap_or("?").to_string();
                let name = self.heap.name(name).to_string();
                Err(self.error(
                    ExceptionKind::AttributeError,
                    format!("'super({base_name})' object has no attribute '{name}'"),
                ))
            }
        }
    }

    // ── Subscripting ────────────────────────────────────────────────

    fn subscript(&mut self, dunder: Dunder, args: &[Value], failure: &str) -> Result<Value, Raised> {
        let target = args[0];
        match self.dunder(self.type_of(target), dunder) {
            Some(method) => self.call_sync(method, args),
            None => {
                let name = self.type_name(target);
                Err(self.error(ExceptionKind::TypeError, format!("'{name}' object {failure}")))
            }
        }
    }

    pub(crate) fn invoke_getter(&mut self, target: Value, key: Value) -> Result<Value, Raised> {
        self.subscript(Dunder::Get, &[target, key], "is not subscriptable")
    }

    pub(crate) fn invoke_setter(&mut self, target: Value, key: Value, value: Value) -> Result<Value, Raised> {
        self.subscript(Dunder::Set, &[target, key, value], "does not support item assignment")
    }

    pub(crate) fn invoke_delete(&mut self, target: Value, key: Value) -> Result<Value, Raised> {
        self.subscript(Dunder::DelItem, &[target, key], "does not support item deletion")
    }
}
