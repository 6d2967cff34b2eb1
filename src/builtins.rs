//! Builtin classes, their native methods, and the `builtins` module.

use crate::exception::{ExceptionKind, Raised};
use crate::heap::{Heap, ObjRef};
use crate::object::class::{self as class_model, DunderNames, PayloadKind, is_subclass};
use crate::object::{Arity, Class, Instance, Native, NativeFn, NativeKind, Object, Payload};
use crate::value::Value;
use crate::vm::Vm;

/// Handles to every class the VM itself needs to name.
#[derive(Debug, Clone)]
pub struct BuiltinClasses {
    pub object: ObjRef,
    pub type_: ObjRef,
    pub module: ObjRef,
    pub none_type: ObjRef,
    pub bool_: ObjRef,
    pub int: ObjRef,
    pub float: ObjRef,
    pub str_: ObjRef,
    pub function: ObjRef,
    pub method: ObjRef,
    pub builtin_function: ObjRef,
    pub list: ObjRef,
    pub dict: ObjRef,
    pub base_exception: ObjRef,
    exceptions: Vec<ObjRef>,
    /// `object.__setattr__`; instances whose class resolves to it take the
    /// direct field write.
    pub object_setattr: Value,
}

impl BuiltinClasses {
    pub fn exception(&self, kind: ExceptionKind) -> ObjRef {
        self.exceptions[kind as usize]
    }

    pub fn all(&self) -> Vec<ObjRef> {
        let mut all = vec![
            self.object,
            self.type_,
            self.module,
            self.none_type,
            self.bool_,
            self.int,
            self.float,
            self.str_,
            self.function,
            self.method,
            self.builtin_function,
            self.list,
            self.dict,
            self.base_exception,
        ];
        all.extend(&self.exceptions);
        all.extend(self.object_setattr.as_object());
        all
    }
}

/// Field names the VM reads and writes directly.
#[derive(Debug, Clone, Copy)]
pub struct CommonNames {
    pub arg: ObjRef,
    pub name: ObjRef,
    pub file: ObjRef,
}

impl CommonNames {
    pub fn intern(heap: &mut Heap) -> Self {
        CommonNames { arg: heap.intern("arg"), name: heap.intern("__name__"), file: heap.intern("__file__") }
    }

    pub fn all(&self) -> [ObjRef; 3] {
        [self.arg, self.name, self.file]
    }
}

// ── Bootstrap ───────────────────────────────────────────────────────

fn new_class(heap: &mut Heap, name: &str, base: Option<ObjRef>, payload: PayloadKind) -> ObjRef {
    let name = heap.intern(name);
    let mut class = Class::new(name, base);
    class.payload = payload;
    heap.alloc(Object::Class(class))
}

pub(crate) fn native(heap: &mut Heap, name: &'static str, arity: Arity, function: NativeFn) -> Value {
    let native = Native { name, function, arity, kind: NativeKind::Function, accepts_kwargs: false };
    Value::Object(heap.alloc(Object::Native(native)))
}

fn define(heap: &mut Heap, class: ObjRef, name: &'static str, arity: Arity, function: NativeFn) -> Value {
    let value = native(heap, name, arity, function);
    let key = heap.intern(name);
    if let Some(class) = heap.as_class_mut(class) {
        class.methods.insert(key, value);
    }
    value
}

fn define_with_kwargs(heap: &mut Heap, class: ObjRef, name: &'static str, arity: Arity, function: NativeFn) {
    let value = define(heap, class, name, arity, function);
    if let Some(Object::Native(native)) = value.as_object().map(|r| heap.get_mut(r)) {
        native.accepts_kwargs = true;
    }
}

fn define_property(heap: &mut Heap, class: ObjRef, name: &'static str, function: NativeFn) {
    let value = define(heap, class, name, Arity::exactly(1), function);
    if let Some(Object::Native(native)) = value.as_object().map(|r| heap.get_mut(r)) {
        native.kind = NativeKind::Property;
    }
}

/// Create the builtin class tree and the `builtins` module. Every class is
/// finalised before this returns.
pub(crate) fn bootstrap(heap: &mut Heap, dunders: &DunderNames, names: &CommonNames) -> (BuiltinClasses, ObjRef) {
    let object = new_class(heap, "object", None, PayloadKind::None);
    let base = Some(object);
    let type_ = new_class(heap, "type", base, PayloadKind::None);
    let module = new_class(heap, "module", base, PayloadKind::None);
    let none_type = new_class(heap, "NoneType", base, PayloadKind::None);
    let bool_ = new_class(heap, "bool", base, PayloadKind::None);
    let int = new_class(heap, "int", base, PayloadKind::None);
    let float = new_class(heap, "float", base, PayloadKind::None);
    let str_ = new_class(heap, "str", base, PayloadKind::None);
    let function = new_class(heap, "function", base, PayloadKind::None);
    let method = new_class(heap, "method", base, PayloadKind::None);
    let builtin_function = new_class(heap, "builtin_function", base, PayloadKind::None);
    let list = new_class(heap, "list", base, PayloadKind::List);
    let dict = new_class(heap, "dict", base, PayloadKind::Dict);
    let base_exception = new_class(heap, "Exception", base, PayloadKind::None);
    let exceptions: Vec<ObjRef> = ExceptionKind::ALL
        .iter()
        .map(|kind| new_class(heap, kind.name(), Some(base_exception), PayloadKind::None))
        .collect();

    let object_setattr = define(heap, object, "__setattr__", Arity::exactly(3), object_setattr);

    define(heap, type_, "__init__", Arity::exactly(2), type_init);
    define(heap, type_, "__str__", Arity::exactly(1), type_repr);
    define(heap, type_, "__repr__", Arity::exactly(1), type_repr);
    define_property(heap, type_, "__name__", type_name);
    define_property(heap, type_, "__base__", type_base);
    define_property(heap, type_, "__file__", type_file);
    define_property(heap, type_, "__doc__", type_doc);

    define(heap, none_type, "__init__", Arity::exactly(1), none_init);
    define(heap, bool_, "__init__", Arity::between(1, 2), bool_init);
    define(heap, int, "__init__", Arity::between(1, 2), int_init);
    define(heap, float, "__init__", Arity::between(1, 2), float_init);
    define(heap, str_, "__init__", Arity::between(1, 2), str_init);
    define(heap, str_, "__len__", Arity::exactly(1), str_len);
    define(heap, str_, "__get__", Arity::exactly(2), str_get);

    define(heap, list, "__init__", Arity::between(1, 2), list_init);
    define(heap, list, "__get__", Arity::exactly(2), list_get);
    define(heap, list, "__set__", Arity::exactly(3), list_set);
    define(heap, list, "__len__", Arity::exactly(1), list_len);
    define(heap, list, "append", Arity::exactly(2), list_append);

    define_with_kwargs(heap, dict, "__init__", Arity::between(1, 2), dict_init);
    define(heap, dict, "__get__", Arity::exactly(2), dict_get);
    define(heap, dict, "__set__", Arity::exactly(3), dict_set);
    define(heap, dict, "__delitem__", Arity::exactly(2), dict_delitem);
    define(heap, dict, "__len__", Arity::exactly(1), dict_len);
    define(heap, dict, "__contains__", Arity::exactly(2), dict_contains);
    define(heap, dict, "keys", Arity::exactly(1), dict_keys);

    define(heap, base_exception, "__init__", Arity::between(1, 2), exception_init);
    define(heap, base_exception, "__str__", Arity::exactly(1), exception_str);
    define(heap, base_exception, "__repr__", Arity::exactly(1), exception_repr);

    let classes = BuiltinClasses {
        object,
        type_,
        module,
        none_type,
        bool_,
        int,
        float,
        str_,
        function,
        method,
        builtin_function,
        list,
        dict,
        base_exception,
        exceptions,
        object_setattr,
    };
    for class in classes.all() {
        if heap.as_class(class).is_some() {
            class_model::finalize(heap, class, dunders);
        }
    }

    let mut builtins = Instance::new(module, Payload::None);
    let module_name = heap.intern("builtins");
    builtins.fields.insert(names.name, Value::Object(module_name));
    for class in classes.all() {
        if let Some(name) = heap.as_class(class).map(|c| c.name) {
            builtins.fields.insert(name, Value::Object(class));
        }
    }
    let functions: [(&'static str, Arity, NativeFn); 8] = [
        ("print", Arity::at_least(0), print),
        ("isinstance", Arity::exactly(2), isinstance),
        ("len", Arity::exactly(1), len),
        ("repr", Arity::exactly(1), repr),
        ("hasattr", Arity::exactly(2), hasattr),
        ("getattr", Arity::between(2, 3), getattr),
        ("setattr", Arity::exactly(3), setattr),
        ("dir", Arity::exactly(1), dir),
    ];
    for (name, arity, function) in functions {
        let value = native(heap, name, arity, function);
        if name == "print" {
            if let Some(Object::Native(native)) = value.as_object().map(|r| heap.get_mut(r)) {
                native.accepts_kwargs = true;
            }
        }
        let key = heap.intern(name);
        builtins.fields.insert(key, value);
    }
    let builtins = heap.alloc(Object::Instance(builtins));
    (classes, builtins)
}

// ── Argument helpers ────────────────────────────────────────────────

fn expect_name(vm: &mut Vm, value: Value, function: &str) -> Result<ObjRef, Raised> {
    match value.as_object().filter(|&r| vm.heap.as_str(r).is_some()) {
        Some(name) => Ok(name),
        None => {
            let type_name = vm.type_name(value);
            Err(vm.error(
                ExceptionKind::TypeError,
                format!("{function}(): attribute name must be string, not '{type_name}'"),
            ))
        }
    }
}

fn expect_class(vm: &mut Vm, value: Value, what: &str) -> Result<ObjRef, Raised> {
    match value.as_object().filter(|&r| vm.heap.as_class(r).is_some()) {
        Some(class) => Ok(class),
        None => {
            let type_name = vm.type_name(value);
            Err(vm.error(ExceptionKind::TypeError, format!("{what} must be a class, not '{type_name}'")))
        }
    }
}

fn expect_receiver(vm: &mut Vm, value: Value, class: ObjRef, method: &str) -> Result<ObjRef, Raised> {
    let ok = value.as_object().filter(|_| is_subclass(&vm.heap, vm.type_of(value), class));
    match ok {
        Some(r) => Ok(r),
        None => {
            let expected = vm.heap.as_class(class).map(|c| vm.heap.name(c.name)).unwrap_or("?").to_string();
            let type_name = vm.type_name(value);
            Err(vm.error(
                ExceptionKind::TypeError,
                format!("{method}() expects a '{expected}' receiver, not '{type_name}'"),
            ))
        }
    }
}

/// Resolve a possibly negative index against `len`.
fn index(vm: &mut Vm, key: Value, len: usize, what: &str) -> Result<usize, Raised> {
    let Value::Integer(i) = key else {
        let type_name = vm.type_name(key);
        return Err(vm.error(ExceptionKind::TypeError, format!("{what} indices must be integers, not '{type_name}'")));
    };
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(vm.error(ExceptionKind::IndexError, format!("{what} index out of range")));
    }
    Ok(resolved as usize)
}

fn list_items(vm: &mut Vm, receiver: Value, method: &str) -> Result<ObjRef, Raised> {
    let list = vm.classes.list;
    expect_receiver(vm, receiver, list, method)
}

fn dict_target(vm: &mut Vm, receiver: Value, method: &str) -> Result<ObjRef, Raised> {
    let dict = vm.classes.dict;
    expect_receiver(vm, receiver, dict, method)
}

// ── object and type ─────────────────────────────────────────────────

fn object_setattr(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let name = expect_name(vm, args[1], "__setattr__")?;
    match args[0].as_object().and_then(|r| vm.heap.as_instance_mut(r)) {
        Some(instance) => {
            instance.fields.insert(name, args[2]);
            Ok(Value::None)
        }
        None => {
            let type_name = vm.type_name(args[0]);
            Err(vm.error(ExceptionKind::AttributeError, format!("'{type_name}' object attributes are read-only")))
        }
    }
}

fn type_init(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    Ok(Value::Object(vm.type_of(args[1])))
}

fn type_repr(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let class = expect_class(vm, args[0], "receiver")?;
    let name = vm.heap.as_class(class).map(|c| vm.heap.name(c.name)).unwrap_or("?").to_string();
    Ok(vm.intern(&format!("<type '{name}'>")))
}

fn type_name(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let class = expect_class(vm, args[0], "receiver")?;
    Ok(vm.heap.as_class(class).map(|c| Value::Object(c.name)).unwrap_or_default())
}

fn type_base(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let class = expect_class(vm, args[0], "receiver")?;
    Ok(vm.heap.as_class(class).and_then(|c| c.base).map(Value::Object).unwrap_or_default())
}

fn type_file(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let class = expect_class(vm, args[0], "receiver")?;
    Ok(vm.heap.as_class(class).and_then(|c| c.filename).map(Value::Object).unwrap_or_default())
}

fn type_doc(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let class = expect_class(vm, args[0], "receiver")?;
    Ok(vm.heap.as_class(class).and_then(|c| c.doc).map(Value::Object).unwrap_or_default())
}

// ── Primitive conversions ───────────────────────────────────────────

fn none_init(_: &mut Vm, _: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    Ok(Value::None)
}

fn bool_init(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    match args.get(1) {
        Some(&value) => Ok(Value::Boolean(vm.truthy(value)?)),
        None => Ok(Value::Boolean(false)),
    }
}

fn int_init(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let value = args.get(1).copied().unwrap_or(Value::Integer(0));
    match value {
        Value::Integer(_) => Ok(value),
        Value::Boolean(b) => Ok(Value::Integer(i64::from(b))),
        Value::Floating(f) if f.is_finite() => Ok(Value::Integer(f.trunc() as i64)),
        Value::Floating(f) => {
            Err(vm.error(ExceptionKind::ValueError, format!("cannot convert float {f} to integer")))
        }
        _ => {
            let parsed = vm.heap.value_str(value).map(|s| s.trim().parse::<i64>());
            match parsed {
                Some(Ok(i)) => Ok(Value::Integer(i)),
                Some(Err(_)) => {
                    let text = vm.repr(value)?;
                    Err(vm.error(ExceptionKind::ValueError, format!("invalid literal for int() with base 10: {text}")))
                }
                None => {
                    let type_name = vm.type_name(value);
                    Err(vm.error(ExceptionKind::TypeError, format!("int() argument must be a string or a number, not '{type_name}'")))
                }
            }
        }
    }
}

fn float_init(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let value = args.get(1).copied().unwrap_or(Value::Floating(0.0));
    if let Some(number) = value.as_number() {
        return Ok(Value::Floating(number));
    }
    if let Value::Boolean(b) = value {
        return Ok(Value::Floating(if b { 1.0 } else { 0.0 }));
    }
    let parsed = vm.heap.value_str(value).map(|s| s.trim().parse::<f64>());
    match parsed {
        Some(Ok(f)) => Ok(Value::Floating(f)),
        Some(Err(_)) => {
            let text = vm.repr(value)?;
            Err(vm.error(ExceptionKind::ValueError, format!("could not convert string to float: {text}")))
        }
        None => {
            let type_name = vm.type_name(value);
            Err(vm.error(ExceptionKind::TypeError, format!("float() argument must be a string or a number, not '{type_name}'")))
        }
    }
}

// ── str ─────────────────────────────────────────────────────────────

fn str_init(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let text = match args.get(1) {
        Some(&value) => vm.to_str(value)?,
        None => String::new(),
    };
    Ok(vm.intern(&text))
}

fn receiver_str(vm: &mut Vm, value: Value) -> Result<String, Raised> {
    match vm.heap.value_str(value) {
        Some(text) => Ok(text.to_string()),
        None => {
            let type_name = vm.type_name(value);
            Err(vm.error(ExceptionKind::TypeError, format!("expected a 'str' receiver, not '{type_name}'")))
        }
    }
}

fn str_len(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let text = receiver_str(vm, args[0])?;
    Ok(Value::Integer(text.chars().count() as i64))
}

fn str_get(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let text = receiver_str(vm, args[0])?;
    let chars: Vec<char> = text.chars().collect();
    let at = index(vm, args[1], chars.len(), "string")?;
    Ok(vm.intern(&chars[at].to_string()))
}

// ── list ────────────────────────────────────────────────────────────

fn list_init(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let target = list_items(vm, args[0], "list.__init__")?;
    if let Some(&source) = args.get(1) {
        let items = match source.as_object() {
            Some(r) => match (vm.heap.as_list(r), vm.heap.as_dict(r)) {
                (Some(items), _) => Some(items.clone()),
                (None, Some(dict)) => Some(dict.keys().collect()),
                (None, None) => None,
            },
            None => None,
        };
        let Some(items) = items else {
            let type_name = vm.type_name(source);
            return Err(vm.error(ExceptionKind::TypeError, format!("'{type_name}' object is not iterable")));
        };
        if let Some(list) = vm.heap.as_list_mut(target) {
            *list = items;
        }
    }
    Ok(args[0])
}

fn list_get(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let target = list_items(vm, args[0], "list.__get__")?;
    let len = vm.heap.as_list(target).map_or(0, Vec::len);
    let at = index(vm, args[1], len, "list")?;
    Ok(vm.heap.as_list(target).and_then(|items| items.get(at).copied()).unwrap_or_default())
}

fn list_set(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let target = list_items(vm, args[0], "list.__set__")?;
    let len = vm.heap.as_list(target).map_or(0, Vec::len);
    let at = index(vm, args[1], len, "list")?;
    if let Some(items) = vm.heap.as_list_mut(target) {
        items[at] = args[2];
    }
    Ok(args[2])
}

fn list_len(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let target = list_items(vm, args[0], "list.__len__")?;
    Ok(Value::Integer(vm.heap.as_list(target).map_or(0, Vec::len) as i64))
}

fn list_append(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let target = list_items(vm, args[0], "list.append")?;
    if let Some(items) = vm.heap.as_list_mut(target) {
        items.push(args[1]);
    }
    Ok(Value::None)
}

// ── dict ────────────────────────────────────────────────────────────

fn dict_init(vm: &mut Vm, args: &[Value], kwargs: Option<ObjRef>) -> Result<Value, Raised> {
    let target = dict_target(vm, args[0], "dict.__init__")?;
    let mut entries = Vec::new();
    if let Some(&source) = args.get(1) {
        match source.as_object().and_then(|r| vm.heap.as_dict(r)) {
            Some(dict) => entries.extend(dict.iter()),
            None => {
                let type_name = vm.type_name(source);
                return Err(vm.error(ExceptionKind::TypeError, format!("'{type_name}' object is not a mapping")));
            }
        }
    }
    if let Some(dict) = kwargs.and_then(|r| vm.heap.as_dict(r)) {
        entries.extend(dict.iter());
    }
    if let Some(dict) = vm.heap.as_dict_mut(target) {
        for (key, value) in entries {
            dict.insert(key, value);
        }
    }
    Ok(args[0])
}

fn missing_key(vm: &mut Vm, key: Value) -> Raised {
    match vm.repr(key) {
        Ok(text) => vm.error(ExceptionKind::KeyError, text),
        Err(raised) => raised,
    }
}

fn dict_get(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let target = dict_target(vm, args[0], "dict.__get__")?;
    match vm.heap.as_dict(target).and_then(|d| d.get(args[1])) {
        Some(value) => Ok(value),
        None => Err(missing_key(vm, args[1])),
    }
}

fn dict_set(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let target = dict_target(vm, args[0], "dict.__set__")?;
    if let Some(dict) = vm.heap.as_dict_mut(target) {
        dict.insert(args[1], args[2]);
    }
    Ok(args[2])
}

fn dict_delitem(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let target = dict_target(vm, args[0], "dict.__delitem__")?;
    match vm.heap.as_dict_mut(target).and_then(|d| d.remove(args[1])) {
        Some(_) => Ok(Value::None),
        None => Err(missing_key(vm, args[1])),
    }
}

fn dict_len(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let target = dict_target(vm, args[0], "dict.__len__")?;
    Ok(Value::Integer(vm.heap.as_dict(target).map_or(0, |d| d.len()) as i64))
}

fn dict_contains(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let target = dict_target(vm, args[0], "dict.__contains__")?;
    Ok(Value::Boolean(vm.heap.as_dict(target).is_some_and(|d| d.get(args[1]).is_some())))
}

fn dict_keys(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let target = dict_target(vm, args[0], "dict.keys")?;
    let keys = vm.heap.as_dict(target).map(|d| d.keys().collect()).unwrap_or_default();
    Ok(vm.new_list(keys))
}

// ── Exception ───────────────────────────────────────────────────────

fn exception_init(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let arg = args.get(1).copied().filter(|v| !v.is_unset()).unwrap_or(Value::None);
    let name = vm.names.arg;
    match args[0].as_object().and_then(|r| vm.heap.as_instance_mut(r)) {
        Some(instance) => {
            instance.fields.insert(name, arg);
            Ok(args[0])
        }
        None => {
            let type_name = vm.type_name(args[0]);
            Err(vm.error(ExceptionKind::TypeError, format!("Exception.__init__() expects an instance, not '{type_name}'")))
        }
    }
}

fn exception_arg(vm: &Vm, receiver: Value) -> Value {
    receiver.as_object().and_then(|r| vm.get_field(r, vm.names.arg)).unwrap_or_default()
}

fn exception_str(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let text = match exception_arg(vm, args[0]) {
        Value::None => String::new(),
        arg => vm.to_str(arg)?,
    };
    Ok(vm.intern(&text))
}

fn exception_repr(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let type_name = vm.type_name(args[0]);
    let text = match exception_arg(vm, args[0]) {
        Value::None => format!("{type_name}()"),
        arg => format!("{type_name}({})", vm.repr(arg)?),
    };
    Ok(vm.intern(&text))
}

// ── Builtin functions ───────────────────────────────────────────────

fn print(vm: &mut Vm, args: &[Value], kwargs: Option<ObjRef>) -> Result<Value, Raised> {
    let mut sep = " ".to_string();
    let mut end = "\n".to_string();
    if let Some(dict) = kwargs {
        let entries: Vec<_> = vm.heap.as_dict(dict).map(|d| d.iter().collect()).unwrap_or_default();
        for (key, value) in entries {
            let text = vm.to_str(value)?;
            match vm.heap.value_str(key) {
                Some("sep") => sep = text,
                Some("end") => end = text,
                Some(other) => {
                    let other = other.to_string();
                    return Err(vm.error(
                        ExceptionKind::ArgumentError,
                        format!("print() got an unexpected keyword argument '{other}'"),
                    ));
                }
                None => {}
            }
        }
    }
    let mut line = String::new();
    for (i, &arg) in args.iter().enumerate() {
        if i > 0 {
            line.push_str(&sep);
        }
        line.push_str(&vm.to_str(arg)?);
    }
    line.push_str(&end);
    vm.write_out(&line)?;
    Ok(Value::None)
}

fn isinstance(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let class = expect_class(vm, args[1], "isinstance() arg 2")?;
    let actual = vm.type_of(args[0]);
    Ok(Value::Boolean(is_subclass(&vm.heap, actual, class)))
}

fn len(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let value = args[0];
    if let Some(text) = vm.heap.value_str(value) {
        return Ok(Value::Integer(text.chars().count() as i64));
    }
    match vm.dunder(vm.type_of(value), crate::object::Dunder::Len) {
        Some(method) => vm.call_sync(method, &[value]),
        None => {
            let type_name = vm.type_name(value);
            Err(vm.error(ExceptionKind::TypeError, format!("object of type '{type_name}' has no len()")))
        }
    }
}

fn repr(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let text = vm.repr(args[0])?;
    Ok(vm.intern(&text))
}

fn hasattr(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let name = expect_name(vm, args[1], "hasattr")?;
    Ok(Value::Boolean(vm.lookup_attribute(args[0], name)?.is_some()))
}

fn getattr(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let name = expect_name(vm, args[1], "getattr")?;
    match (vm.lookup_attribute(args[0], name)?, args.get(2)) {
        (Some(value), _) => Ok(value),
        (None, Some(&default)) => Ok(default),
        (None, None) => vm.get_attribute(args[0], name),
    }
}

fn setattr(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let name = expect_name(vm, args[1], "setattr")?;
    vm.set_attribute(args[0], name, args[2])?;
    Ok(Value::None)
}

fn dir(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let value = args[0];
    let mut names: Vec<ObjRef> = Vec::new();
    if let Some(instance) = value.as_object().and_then(|r| vm.heap.as_instance(r)) {
        names.extend(instance.fields.keys());
    }
    let mut class = match value.as_object().filter(|&r| vm.heap.as_class(r).is_some()) {
        Some(class) => Some(class),
        None => Some(vm.type_of(value)),
    };
    while let Some(r) = class {
        let Some(current) = vm.heap.as_class(r) else { break };
        names.extend(current.methods.keys());
        class = current.base;
    }
    let mut texts: Vec<String> = names.iter().map(|&n| vm.heap.name(n).to_string()).collect();
    texts.sort();
    texts.dedup();
    let items = texts.iter().map(|t| vm.intern(t)).collect();
    Ok(vm.new_list(items))
}
