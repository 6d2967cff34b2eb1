//! Host modules the binary registers: `time` and `kuroko`.

use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::builtins::native;
use crate::exception::{ExceptionKind, Raised};
use crate::heap::ObjRef;
use crate::object::{Arity, NativeFn};
use crate::value::Value;
use crate::vm::Vm;

fn install(vm: &mut Vm, module: ObjRef, functions: &[(&'static str, Arity, NativeFn)]) {
    for &(name, arity, function) in functions {
        let value = native(&mut vm.heap, name, arity, function);
        vm.set_field(module, name, value);
    }
}

/// Register `time` and `kuroko`; `argv` becomes `kuroko.argv`.
pub fn register_host_modules(vm: &mut Vm, argv: Vec<String>) {
    vm.register_module(
        "time",
        Rc::new(|vm: &mut Vm, module: ObjRef| {
            install(vm, module, &[("sleep", Arity::exactly(1), time_sleep), ("time", Arity::exactly(0), time_time)]);
            Ok(())
        }),
    );
    vm.register_module("kuroko", Rc::new(move |vm: &mut Vm, module: ObjRef| load_kuroko(vm, module, &argv)));
}

// ── time ────────────────────────────────────────────────────────────

fn time_sleep(vm: &mut Vm, args: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    let seconds = match args[0].as_number() {
        Some(seconds) if seconds >= 0.0 && seconds.is_finite() => seconds,
        Some(_) => return Err(vm.error(ExceptionKind::ValueError, "sleep length must be non-negative")),
        None => {
            let type_name = vm.type_name(args[0]);
            return Err(vm.error(ExceptionKind::TypeError, format!("sleep() argument must be a number, not '{type_name}'")));
        }
    };
    std::thread::sleep(Duration::from_secs_f64(seconds));
    Ok(Value::None)
}

fn time_time(vm: &mut Vm, _: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => Ok(Value::Floating(elapsed.as_secs_f64())),
        Err(err) => Err(vm.error(ExceptionKind::OSError, err.to_string())),
    }
}

// ── kuroko ──────────────────────────────────────────────────────────

fn load_kuroko(vm: &mut Vm, module: ObjRef, argv: &[String]) -> Result<(), Raised> {
    let items = argv.iter().map(|arg| vm.intern(arg)).collect();
    let argv = vm.new_list(items);
    vm.set_field(module, "argv", argv);

    let version = vm.intern(env!("CARGO_PKG_VERSION"));
    vm.set_field(module, "version", version);

    let paths: Vec<String> = vm.module_paths().iter().map(|p| p.display().to_string()).collect();
    let items = paths.iter().map(|p| vm.intern(p)).collect();
    let paths = vm.new_list(items);
    vm.set_field(module, "module_paths", paths);
    Ok(())
}
