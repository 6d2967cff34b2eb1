use std::rc::Rc;

use super::*;
use crate::builtins::native;
use crate::chunk::{Chunk, OpCode};
use crate::exception::Raised;
use crate::loader::{CodeFile, ConstantRepr, FunctionRepr};
use crate::object::{Arity, Function};
use crate::value::KWARGS_UNSET;

/// Hand assembler over the `Chunk` emit helpers.
struct Asm<'a> {
    vm: &'a mut Vm,
    chunk: Chunk,
    line: usize,
    collects_args: bool,
    upvalues: usize,
}

impl<'a> Asm<'a> {
    fn new(vm: &'a mut Vm) -> Self {
        Asm { vm, chunk: Chunk::new(Some(Rc::from("test.krk"))), line: 1, collects_args: false, upvalues: 0 }
    }

    fn line(&mut self, line: usize) -> &mut Self {
        self.line = line;
        self
    }

    fn op(&mut self, op: OpCode) -> &mut Self {
        self.chunk.write_op(op, self.line);
        self
    }

    fn arg(&mut self, op: OpCode, n: usize) -> &mut Self {
        self.chunk.emit_operand(op, n, self.line).unwrap();
        self
    }

    fn byte(&mut self, op: OpCode, n: u8) -> &mut Self {
        self.chunk.emit_byte_op(op, n, self.line);
        self
    }

    fn value(&mut self, value: Value) -> &mut Self {
        self.chunk.write_constant(value, self.line).unwrap();
        self
    }

    fn int(&mut self, i: i64) -> &mut Self {
        self.value(Value::Integer(i))
    }

    fn str(&mut self, text: &str) -> &mut Self {
        let value = self.vm.intern(text);
        self.value(value)
    }

    fn named(&mut self, op: OpCode, name: &str) -> &mut Self {
        let value = self.vm.intern(name);
        let index = self.chunk.add_constant(value);
        self.arg(op, index)
    }

    fn closure(&mut self, function: ObjRef, captures: &[(bool, usize)]) -> &mut Self {
        let index = self.chunk.add_constant(Value::Object(function));
        self.arg(OpCode::Closure, index);
        for &(is_local, at) in captures {
            self.chunk.emit_capture(is_local, at, self.line).unwrap();
        }
        self
    }

    fn jump(&mut self, op: OpCode) -> usize {
        self.chunk.emit_jump(op, self.line)
    }

    fn patch(&mut self, operand: usize) -> &mut Self {
        self.chunk.patch_jump(operand).unwrap();
        self
    }

    fn mark(&self) -> usize {
        self.chunk.len()
    }

    fn loop_to(&mut self, start: usize) -> &mut Self {
        self.chunk.emit_loop(start, self.line).unwrap();
        self
    }

    fn build(self, name: &str, required: &[&str], keyword: &[&str]) -> ObjRef {
        let heap = &mut self.vm.heap;
        let mut function = Function::new(heap.intern(name), self.chunk);
        function.required_args = required.iter().map(|a| heap.intern(a)).collect();
        function.keyword_args = keyword.iter().map(|a| heap.intern(a)).collect();
        function.collects_args = self.collects_args;
        function.upvalue_count = self.upvalues;
        heap.alloc(Object::Function(Rc::new(function)))
    }
}

fn vm() -> Vm {
    Vm::new(VmConfig::default())
}

fn run(vm: &mut Vm, function: ObjRef) -> VmResult<Value> {
    vm.execute(function, "__main__", None)
}

fn text(vm: &Vm, value: Value) -> String {
    vm.heap.value_str(value).expect("a string").to_string()
}

fn uncaught(result: VmResult<Value>) -> UncaughtException {
    match result {
        Err(VmError::Uncaught(exception)) => exception,
        other => panic!("expected an uncaught exception, got {other:?}"),
    }
}

fn stack_depth_native(vm: &mut Vm, _: &[Value], _: Option<ObjRef>) -> Result<Value, Raised> {
    Ok(Value::Integer(vm.stack_depth() as i64))
}

fn install_depth(vm: &mut Vm) {
    let depth = native(&mut vm.heap, "depth", Arity::exactly(0), stack_depth_native);
    vm.set_field(vm.builtins, "depth", depth);
}

/// Method returning a constant string.
fn returns_str(vm: &mut Vm, name: &str, result: &str) -> ObjRef {
    let mut asm = Asm::new(vm);
    asm.str(result).op(OpCode::Return);
    asm.build(name, &["self"], &[])
}

// ── Expressions and globals ─────────────────────────────────────────

#[test]
fn adds_integers() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.int(1).int(2).op(OpCode::Add).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(&mut vm, main).unwrap(), Value::Integer(3));
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn concatenates_strings() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.str("a").str("b").op(OpCode::Add).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let result = run(&mut vm, main).unwrap();
    assert_eq!(text(&vm, result), "ab");
}

#[test]
fn string_plus_number_converts_the_right_operand() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.str("n=").value(Value::Floating(1.5)).op(OpCode::Add).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let result = run(&mut vm, main).unwrap();
    assert_eq!(text(&vm, result), "n=1.5");
}

#[test]
fn integer_division_and_modulo() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.int(7).int(2).op(OpCode::Divide).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(&mut vm, main).unwrap(), Value::Floating(3.5));

    let mut asm = Asm::new(&mut vm);
    asm.int(-7).int(3).op(OpCode::Modulo).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(&mut vm, main).unwrap(), Value::Integer(2));
}

#[test]
fn division_by_zero_raises() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.int(1).int(0).op(OpCode::Divide).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.type_name, "ZeroDivisionError");
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn mismatched_operands_raise_type_error() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.int(1).str("a").op(OpCode::Add).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.to_string(), "TypeError: unsupported operand types for +: 'int' and 'str'");
}

#[test]
fn string_repetition() {
    let mut vm = vm();
    for (count, expected) in [(3, "ababab"), (-2, "")] {
        let mut asm = Asm::new(&mut vm);
        asm.str("ab").int(count).op(OpCode::Multiply).op(OpCode::Return);
        let main = asm.build("<module>", &[], &[]);
        let result = run(&mut vm, main).unwrap();
        assert_eq!(text(&vm, result), expected);
    }
}

#[test]
fn oversized_repetition_raises_instead_of_aborting() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.str("ab").int(i64::MAX).op(OpCode::Multiply).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.type_name, "MemoryError");
    assert_eq!(vm.stack_depth(), 0);

    let mut asm = Asm::new(&mut vm);
    asm.str("x").int(1 << 31).op(OpCode::Multiply).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(uncaught(run(&mut vm, main)).type_name, "MemoryError");
}

#[test]
fn numbers_compare_across_int_and_float() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.int(2).value(Value::Floating(2.0)).op(OpCode::Equal).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(&mut vm, main).unwrap(), Value::Boolean(true));
}

#[test]
fn undefined_global_raises_name_error() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::GetGlobal, "missing").op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.to_string(), "NameError: name 'missing' is not defined");
}

#[test]
fn globals_define_set_and_delete() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.int(1).named(OpCode::DefineGlobal, "x");
    asm.int(5).named(OpCode::SetGlobal, "x").op(OpCode::Pop);
    asm.named(OpCode::GetGlobal, "x").op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(&mut vm, main).unwrap(), Value::Integer(5));
    assert_eq!(vm.module_global("__main__", "x"), Some(Value::Integer(5)));

    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::DelGlobal, "nothing").op(OpCode::None).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(uncaught(run(&mut vm, main)).type_name, "NameError");
}

// ── Closures ────────────────────────────────────────────────────────

#[test]
fn closure_counter_keeps_its_cell() {
    let mut vm = vm();

    let mut asm = Asm::new(&mut vm);
    asm.arg(OpCode::GetUpvalue, 0).int(1).op(OpCode::Add).arg(OpCode::SetUpvalue, 0).op(OpCode::Return);
    asm.upvalues = 1;
    let increment = asm.build("increment", &[], &[]);

    let mut asm = Asm::new(&mut vm);
    asm.int(0).closure(increment, &[(true, 0)]).op(OpCode::Return);
    let make_counter = asm.build("make_counter", &[], &[]);

    let mut asm = Asm::new(&mut vm);
    asm.closure(make_counter, &[]).arg(OpCode::Call, 0).named(OpCode::DefineGlobal, "counter");
    asm.named(OpCode::GetGlobal, "counter").arg(OpCode::Call, 0).op(OpCode::Pop);
    asm.named(OpCode::GetGlobal, "counter").arg(OpCode::Call, 0).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);

    assert_eq!(run(&mut vm, main).unwrap(), Value::Integer(2));
    assert!(vm.open_upvalues.is_empty());
}

#[test]
fn open_upvalue_sees_later_writes_then_closes() {
    let mut vm = vm();

    let mut asm = Asm::new(&mut vm);
    asm.arg(OpCode::GetUpvalue, 0).op(OpCode::Return);
    asm.upvalues = 1;
    let getter = asm.build("getter", &[], &[]);

    // x = 1; g = closure; x = 2; return g
    let mut asm = Asm::new(&mut vm);
    asm.int(1).closure(getter, &[(true, 0)]);
    asm.int(2).arg(OpCode::SetLocal, 0).op(OpCode::Pop);
    asm.arg(OpCode::GetLocal, 1).op(OpCode::Return);
    let outer = asm.build("outer", &[], &[]);

    let mut asm = Asm::new(&mut vm);
    asm.closure(outer, &[]).arg(OpCode::Call, 0).arg(OpCode::Call, 0).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(&mut vm, main).unwrap(), Value::Integer(2));
}

#[test]
fn close_upvalue_detaches_the_cell() {
    let mut vm = vm();

    let mut asm = Asm::new(&mut vm);
    asm.arg(OpCode::GetUpvalue, 0).op(OpCode::Return);
    asm.upvalues = 1;
    let getter = asm.build("getter", &[], &[]);

    // local 0 = 10; g = closure over it; close it; then reuse the slot
    let mut asm = Asm::new(&mut vm);
    asm.closure(getter, &[(true, 1)]).int(10);
    asm.op(OpCode::CloseUpvalue).int(99);
    asm.arg(OpCode::GetLocal, 0).arg(OpCode::Call, 0).op(OpCode::Return);
    let outer = asm.build("outer", &[], &[]);

    let mut asm = Asm::new(&mut vm);
    asm.closure(outer, &[]).arg(OpCode::Call, 0).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(&mut vm, main).unwrap(), Value::Integer(10));
}

// ── Exceptions ──────────────────────────────────────────────────────

#[test]
fn innermost_try_catches() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    let outer = asm.jump(OpCode::PushTry);
    let inner = asm.jump(OpCode::PushTry);
    asm.named(OpCode::GetGlobal, "ValueError").op(OpCode::Raise);
    asm.patch(inner);
    asm.op(OpCode::Return);
    asm.patch(outer);
    asm.str("outer").op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);

    let result = run(&mut vm, main).unwrap();
    assert_eq!(vm.type_name(result), "ValueError");
    assert!(vm.handlers.is_empty());
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn leaving_a_try_body_restores_the_outer_handler() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    let outer = asm.jump(OpCode::PushTry);
    let inner = asm.jump(OpCode::PushTry);
    asm.op(OpCode::PopHandler);
    asm.named(OpCode::GetGlobal, "KeyError").op(OpCode::Raise);
    asm.patch(inner);
    asm.str("inner").op(OpCode::Return);
    asm.patch(outer);
    asm.str("outer").op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);

    let result = run(&mut vm, main).unwrap();
    assert_eq!(text(&vm, result), "outer");
}

#[test]
fn exceptions_cross_frames_and_keep_a_traceback() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.line(2).named(OpCode::GetGlobal, "ValueError").str("bad").arg(OpCode::Call, 1).op(OpCode::Raise);
    let fail = asm.build("fail", &[], &[]);

    let mut asm = Asm::new(&mut vm);
    asm.line(5).closure(fail, &[]).arg(OpCode::Call, 0).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);

    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.to_string(), "ValueError: bad");
    let frames: Vec<_> = exception.traceback.iter().map(|f| (f.function.as_str(), f.line)).collect();
    assert_eq!(frames, vec![("<module>", 5), ("fail", 2)]);
    assert_eq!(exception.traceback[0].filename, "test.krk");
    assert!(vm.frames.is_empty());
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn caught_exception_in_callee_frame_resumes_there() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    let handler = asm.jump(OpCode::PushTry);
    asm.int(1).int(0).op(OpCode::Modulo).op(OpCode::Return);
    asm.patch(handler);
    asm.str("recovered").op(OpCode::Return);
    let safe = asm.build("safe", &[], &[]);

    let mut asm = Asm::new(&mut vm);
    asm.closure(safe, &[]).arg(OpCode::Call, 0).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let result = run(&mut vm, main).unwrap();
    assert_eq!(text(&vm, result), "recovered");
}

// ── With blocks ─────────────────────────────────────────────────────

/// Defines global `Manager` whose `__exit__` counts calls in global `exits`.
fn define_manager(vm: &mut Vm) {
    let mut asm = Asm::new(vm);
    asm.arg(OpCode::GetLocal, 0).op(OpCode::Return);
    let enter = asm.build("__enter__", &["self"], &[]);

    let mut asm = Asm::new(vm);
    asm.named(OpCode::GetGlobal, "exits").int(1).op(OpCode::Add).named(OpCode::SetGlobal, "exits");
    asm.op(OpCode::Pop).op(OpCode::None).op(OpCode::Return);
    let exit = asm.build("__exit__", &["self"], &[]);

    let mut asm = Asm::new(vm);
    asm.int(0).named(OpCode::DefineGlobal, "exits");
    asm.named(OpCode::Class, "Manager");
    asm.closure(enter, &[]).named(OpCode::Method, "__enter__");
    asm.closure(exit, &[]).named(OpCode::Method, "__exit__");
    asm.op(OpCode::Finalize).named(OpCode::DefineGlobal, "Manager");
    asm.op(OpCode::None).op(OpCode::Return);
    let setup = asm.build("<module>", &[], &[]);
    run(vm, setup).unwrap();
}

fn exits(vm: &mut Vm) -> Value {
    vm.module_global("__main__", "exits").unwrap()
}

#[test]
fn with_cleanup_runs_once_on_normal_exit() {
    let mut vm = vm();
    install_depth(&mut vm);
    define_manager(&mut vm);

    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::GetGlobal, "depth").arg(OpCode::Call, 0).named(OpCode::DefineGlobal, "before");
    asm.named(OpCode::GetGlobal, "Manager").arg(OpCode::Call, 0);
    let cleanup = asm.jump(OpCode::PushWith);
    asm.op(OpCode::Pop);
    asm.patch(cleanup);
    asm.op(OpCode::CleanupWith);
    asm.named(OpCode::GetGlobal, "depth").arg(OpCode::Call, 0);
    asm.named(OpCode::GetGlobal, "before").op(OpCode::Equal).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);

    assert_eq!(run(&mut vm, main).unwrap(), Value::Boolean(true));
    assert_eq!(exits(&mut vm), Value::Integer(1));
}

#[test]
fn with_cleanup_runs_once_on_early_return() {
    let mut vm = vm();
    define_manager(&mut vm);

    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::GetGlobal, "Manager").arg(OpCode::Call, 0);
    let cleanup = asm.jump(OpCode::PushWith);
    asm.op(OpCode::Pop).str("early").op(OpCode::Return);
    asm.patch(cleanup);
    asm.op(OpCode::CleanupWith);
    asm.str("late").op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);

    let result = run(&mut vm, main).unwrap();
    assert_eq!(text(&vm, result), "early");
    assert_eq!(exits(&mut vm), Value::Integer(1));
    assert!(vm.handlers.is_empty());
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn with_cleanup_runs_once_when_body_raises() {
    let mut vm = vm();
    define_manager(&mut vm);

    let mut asm = Asm::new(&mut vm);
    let handler = asm.jump(OpCode::PushTry);
    asm.named(OpCode::GetGlobal, "Manager").arg(OpCode::Call, 0);
    let cleanup = asm.jump(OpCode::PushWith);
    asm.op(OpCode::Pop).named(OpCode::GetGlobal, "IndexError").op(OpCode::Raise);
    asm.patch(cleanup);
    asm.op(OpCode::CleanupWith);
    asm.str("not reached").op(OpCode::Return);
    asm.patch(handler);
    asm.op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);

    let result = run(&mut vm, main).unwrap();
    assert_eq!(vm.type_name(result), "IndexError");
    assert_eq!(exits(&mut vm), Value::Integer(1));
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn with_requires_enter_and_exit() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.int(3);
    let cleanup = asm.jump(OpCode::PushWith);
    asm.patch(cleanup);
    asm.op(OpCode::CleanupWith).op(OpCode::None).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.to_string(), "TypeError: can not use 'int' as context manager");
}

#[test]
fn exception_handled_inside_exit_keeps_the_body_traceback() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.arg(OpCode::GetLocal, 0).op(OpCode::Return);
    let enter = asm.build("__enter__", &["self"], &[]);

    // __exit__(self): try: raise KeyError  except: pass
    let mut asm = Asm::new(&mut vm);
    let handler = asm.jump(OpCode::PushTry);
    asm.line(9).named(OpCode::GetGlobal, "KeyError").op(OpCode::Raise);
    asm.patch(handler);
    asm.op(OpCode::Pop).op(OpCode::None).op(OpCode::Return);
    let exit = asm.build("__exit__", &["self"], &[]);

    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::Class, "Quiet");
    asm.closure(enter, &[]).named(OpCode::Method, "__enter__");
    asm.closure(exit, &[]).named(OpCode::Method, "__exit__");
    asm.op(OpCode::Finalize).arg(OpCode::Call, 0);
    let cleanup = asm.jump(OpCode::PushWith);
    asm.op(OpCode::Pop);
    asm.line(3).named(OpCode::GetGlobal, "ValueError").str("inside").arg(OpCode::Call, 1).op(OpCode::Raise);
    asm.patch(cleanup);
    asm.line(4).op(OpCode::CleanupWith).op(OpCode::None).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);

    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.to_string(), "ValueError: inside");
    let frames: Vec<_> = exception.traceback.iter().map(|f| (f.function.as_str(), f.line)).collect();
    assert_eq!(frames, vec![("<module>", 3)]);
    assert_eq!(vm.stack_depth(), 0);
}

// ── Classes ─────────────────────────────────────────────────────────

fn define_hierarchy(vm: &mut Vm) {
    let base_who = returns_str(vm, "who", "base");
    let greet = returns_str(vm, "greet", "hello");
    let derived_who = returns_str(vm, "who", "derived");

    let mut asm = Asm::new(vm);
    asm.arg(OpCode::GetLocal, 0).named(OpCode::GetGlobal, "Base").named(OpCode::GetSuper, "who");
    asm.arg(OpCode::Call, 0).op(OpCode::Return);
    let super_who = asm.build("super_who", &["self"], &[]);

    let mut asm = Asm::new(vm);
    asm.named(OpCode::Class, "Base");
    asm.closure(base_who, &[]).named(OpCode::Method, "who");
    asm.closure(greet, &[]).named(OpCode::Method, "greet");
    asm.op(OpCode::Finalize).named(OpCode::DefineGlobal, "Base");

    asm.named(OpCode::Class, "Derived").named(OpCode::DefineGlobal, "Derived");
    asm.named(OpCode::GetGlobal, "Base").named(OpCode::GetGlobal, "Derived").op(OpCode::Inherit);
    asm.op(OpCode::Pop);
    asm.named(OpCode::GetGlobal, "Derived");
    asm.closure(derived_who, &[]).named(OpCode::Method, "who");
    asm.closure(super_who, &[]).named(OpCode::Method, "super_who");
    asm.op(OpCode::Finalize).op(OpCode::Pop);
    asm.op(OpCode::None).op(OpCode::Return);
    let setup = asm.build("<module>", &[], &[]);
    run(vm, setup).unwrap();
}

fn call_on_derived(vm: &mut Vm, method: &str) -> String {
    let mut asm = Asm::new(vm);
    asm.named(OpCode::GetGlobal, "Derived").arg(OpCode::Call, 0);
    asm.named(OpCode::GetProperty, method).arg(OpCode::Call, 0).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let result = run(vm, main).unwrap();
    text(vm, result)
}

#[test]
fn methods_resolve_through_the_base_chain() {
    let mut vm = vm();
    define_hierarchy(&mut vm);
    assert_eq!(call_on_derived(&mut vm, "who"), "derived");
    assert_eq!(call_on_derived(&mut vm, "greet"), "hello");
}

#[test]
fn super_lookup_starts_at_the_base() {
    let mut vm = vm();
    define_hierarchy(&mut vm);
    assert_eq!(call_on_derived(&mut vm, "super_who"), "base");
}

#[test]
fn init_runs_with_the_instance_and_yields_it() {
    let mut vm = vm();
    // __init__(self, v): self.v = v; return None
    let mut asm = Asm::new(&mut vm);
    asm.arg(OpCode::GetLocal, 0).arg(OpCode::GetLocal, 1).named(OpCode::SetProperty, "v").op(OpCode::Pop);
    asm.op(OpCode::None).op(OpCode::Return);
    let init = asm.build("__init__", &["self", "v"], &[]);

    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::Class, "Box").closure(init, &[]).named(OpCode::Method, "__init__");
    asm.op(OpCode::Finalize).named(OpCode::DefineGlobal, "Box");
    asm.named(OpCode::GetGlobal, "Box").int(41).arg(OpCode::Call, 1);
    asm.named(OpCode::GetProperty, "v").op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(&mut vm, main).unwrap(), Value::Integer(41));
}

#[test]
fn class_without_init_rejects_arguments() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::Class, "Empty").op(OpCode::Finalize).int(1).arg(OpCode::Call, 1).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.to_string(), "ArgumentError: Empty() takes no arguments");
}

#[test]
fn finalized_class_refuses_new_special_methods() {
    let mut vm = vm();
    let method = returns_str(&mut vm, "__str__", "x");
    let plain = returns_str(&mut vm, "label", "x");

    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::Class, "Sealed").op(OpCode::Finalize).named(OpCode::DefineGlobal, "Sealed");
    asm.named(OpCode::GetGlobal, "Sealed").closure(plain, &[]).named(OpCode::SetProperty, "label").op(OpCode::Pop);
    asm.named(OpCode::GetGlobal, "Sealed").closure(method, &[]).named(OpCode::SetProperty, "__str__");
    asm.op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.type_name, "TypeError");
    assert!(exception.message.contains("__str__"), "{}", exception.message);

    let sealed = vm.module_global("__main__", "Sealed").unwrap();
    let label = vm.heap.intern("label");
    assert!(vm.lookup_attribute(sealed, label).unwrap().is_some());
}

#[test]
fn callable_instances_use_call() {
    let mut vm = vm();
    let call = returns_str(&mut vm, "__call__", "called");
    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::Class, "Fn").closure(call, &[]).named(OpCode::Method, "__call__").op(OpCode::Finalize);
    asm.arg(OpCode::Call, 0).arg(OpCode::Call, 0).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let result = run(&mut vm, main).unwrap();
    assert_eq!(text(&vm, result), "called");
}

#[test]
fn missing_attribute_raises() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.int(1).named(OpCode::GetProperty, "nope").op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.to_string(), "AttributeError: 'int' object has no attribute 'nope'");
}

#[test]
fn dict_subclass_setter_validates_then_delegates() {
    let mut vm = vm();
    // __set__(self, key, value): if not isinstance(value, str): raise TypeError
    //                            return super().__set__(key, value)
    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::GetGlobal, "isinstance").arg(OpCode::GetLocal, 2).named(OpCode::GetGlobal, "str");
    asm.arg(OpCode::Call, 2);
    let ok = asm.jump(OpCode::JumpIfTrue);
    asm.op(OpCode::Pop).named(OpCode::GetGlobal, "TypeError").op(OpCode::Raise);
    asm.patch(ok);
    asm.op(OpCode::Pop);
    asm.arg(OpCode::GetLocal, 0).named(OpCode::GetGlobal, "dict").named(OpCode::GetSuper, "__set__");
    asm.arg(OpCode::GetLocal, 1).arg(OpCode::GetLocal, 2).arg(OpCode::Call, 2).op(OpCode::Return);
    let setter = asm.build("__set__", &["self", "key", "value"], &[]);

    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::Class, "_Environ").named(OpCode::DefineGlobal, "_Environ");
    asm.named(OpCode::GetGlobal, "dict").named(OpCode::GetGlobal, "_Environ").op(OpCode::Inherit).op(OpCode::Pop);
    asm.named(OpCode::GetGlobal, "_Environ").closure(setter, &[]).named(OpCode::Method, "__set__");
    asm.op(OpCode::Finalize).op(OpCode::Pop);
    asm.named(OpCode::GetGlobal, "_Environ").arg(OpCode::Call, 0).named(OpCode::DefineGlobal, "env");
    asm.named(OpCode::GetGlobal, "env").str("HOME").str("/root").op(OpCode::InvokeSetter).op(OpCode::Pop);
    asm.named(OpCode::GetGlobal, "env").str("HOME").op(OpCode::InvokeGetter).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let result = run(&mut vm, main).unwrap();
    assert_eq!(text(&vm, result), "/root");

    let env = vm.module_global("__main__", "env").unwrap();
    assert_eq!(vm.repr(env).unwrap(), "{'HOME': '/root'}");
    let key = vm.intern("PATH");
    let err = vm.invoke_setter(env, key, Value::Integer(1)).unwrap_err();
    assert_eq!(vm.type_name(err.0), "TypeError");
    assert_eq!(vm.heap.as_dict(env.as_object().unwrap()).unwrap().len(), 1);
}

#[test]
fn signed_zero_float_keys_address_one_entry() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::GetGlobal, "dict").arg(OpCode::Call, 0).named(OpCode::DefineGlobal, "d");
    asm.named(OpCode::GetGlobal, "d").value(Value::Floating(0.0)).int(1).op(OpCode::InvokeSetter).op(OpCode::Pop);
    asm.named(OpCode::GetGlobal, "d").value(Value::Floating(-0.0)).op(OpCode::InvokeGetter).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(&mut vm, main).unwrap(), Value::Integer(1));

    let d = vm.module_global("__main__", "d").unwrap();
    vm.invoke_setter(d, Value::Floating(-0.0), Value::Integer(2)).unwrap();
    assert_eq!(vm.heap.as_dict(d.as_object().unwrap()).unwrap().len(), 1);
}

// ── Calls ───────────────────────────────────────────────────────────

/// Global `f(a, b)` returning `a - b`.
fn define_subtract(vm: &mut Vm) {
    let mut asm = Asm::new(vm);
    asm.arg(OpCode::GetLocal, 0).arg(OpCode::GetLocal, 1).op(OpCode::Subtract).op(OpCode::Return);
    let f = asm.build("f", &["a", "b"], &[]);
    let mut asm = Asm::new(vm);
    asm.closure(f, &[]).named(OpCode::DefineGlobal, "f").op(OpCode::None).op(OpCode::Return);
    let setup = asm.build("<module>", &[], &[]);
    run(vm, setup).unwrap();
}

fn call_subtract(vm: &mut Vm, build: impl FnOnce(&mut Asm<'_>) -> usize) -> VmResult<Value> {
    let mut asm = Asm::new(vm);
    asm.named(OpCode::GetGlobal, "f");
    let argc = build(&mut asm);
    asm.arg(OpCode::Call, argc).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    run(vm, main)
}

#[test]
fn keywords_bind_by_name() {
    let mut vm = vm();
    define_subtract(&mut vm);
    let result = call_subtract(&mut vm, |asm| {
        asm.str("b").int(1).str("a").int(10).arg(OpCode::Kwargs, 2);
        5
    });
    assert_eq!(result.unwrap(), Value::Integer(9));
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn list_expansion_spreads_positionals() {
    let mut vm = vm();
    define_subtract(&mut vm);
    let result = call_subtract(&mut vm, |asm| {
        asm.byte(OpCode::ExpandArgs, 1);
        asm.named(OpCode::GetGlobal, "list").arg(OpCode::Call, 0);
        for value in [10, 4] {
            asm.byte(OpCode::Dup, 0).named(OpCode::GetProperty, "append").int(value).arg(OpCode::Call, 1);
            asm.op(OpCode::Pop);
        }
        asm.arg(OpCode::Kwargs, 1);
        3
    });
    assert_eq!(result.unwrap(), Value::Integer(6));
}

fn expect_argument_error(vm: &mut Vm, build: impl FnOnce(&mut Asm<'_>) -> usize, expected: &str) {
    let exception = uncaught(call_subtract(vm, build));
    assert_eq!(exception.to_string(), expected);
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn argument_errors() {
    let mut vm = vm();
    define_subtract(&mut vm);
    expect_argument_error(
        &mut vm,
        |asm| {
            asm.int(1).int(2).int(3);
            3
        },
        "ArgumentError: f() takes exactly 2 positional arguments (3 given)",
    );
    expect_argument_error(
        &mut vm,
        |asm| {
            asm.int(1);
            1
        },
        "ArgumentError: f() missing required argument 'b'",
    );
    expect_argument_error(
        &mut vm,
        |asm| {
            asm.int(1).str("c").int(2).arg(OpCode::Kwargs, 1);
            4
        },
        "ArgumentError: f() got an unexpected keyword argument 'c'",
    );
    expect_argument_error(
        &mut vm,
        |asm| {
            asm.int(1).str("a").int(2).arg(OpCode::Kwargs, 1);
            4
        },
        "ArgumentError: f() got multiple values for argument 'a'",
    );
}

#[test]
fn optional_parameter_defaults_through_the_unset_sentinel() {
    let mut vm = vm();
    // g(a, b=5): if b is unset: b = 5; return a + b
    let mut asm = Asm::new(&mut vm);
    asm.arg(OpCode::GetLocal, 1).value(Value::KwArgs(KWARGS_UNSET)).op(OpCode::Is);
    let supplied = asm.jump(OpCode::JumpIfFalse);
    asm.op(OpCode::Pop).int(5).arg(OpCode::SetLocal, 1).op(OpCode::Pop);
    let done = asm.jump(OpCode::Jump);
    asm.patch(supplied);
    asm.op(OpCode::Pop);
    asm.patch(done);
    asm.arg(OpCode::GetLocal, 0).arg(OpCode::GetLocal, 1).op(OpCode::Add).op(OpCode::Return);
    let g = asm.build("g", &["a"], &["b"]);

    let mut asm = Asm::new(&mut vm);
    asm.closure(g, &[]).named(OpCode::DefineGlobal, "g");
    asm.named(OpCode::GetGlobal, "g").int(1).arg(OpCode::Call, 1);
    asm.named(OpCode::GetGlobal, "g").int(1).int(2).arg(OpCode::Call, 2);
    asm.op(OpCode::Multiply).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(&mut vm, main).unwrap(), Value::Integer(6 * 3));
}

#[test]
fn star_args_collect_extra_positionals() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.arg(OpCode::GetLocal, 1).op(OpCode::Return);
    asm.collects_args = true;
    let rest = asm.build("rest", &["first"], &[]);

    let mut asm = Asm::new(&mut vm);
    asm.closure(rest, &[]).int(1).int(2).int(3).arg(OpCode::Call, 3).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let result = run(&mut vm, main).unwrap();
    assert_eq!(vm.repr(result).unwrap(), "[2, 3]");
}

#[test]
fn natives_check_their_arity() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::GetGlobal, "len").arg(OpCode::Call, 0).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.to_string(), "ArgumentError: len() expects exactly 1 arguments (0 given)");
}

#[test]
fn print_writes_to_the_configured_output() {
    #[derive(Clone, Default)]
    struct Sink(Rc<std::cell::RefCell<Vec<u8>>>);
    impl std::io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let mut vm = vm();
    let sink = Sink::default();
    vm.set_output(Box::new(sink.clone()));
    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::GetGlobal, "print").str("a").int(1).str("sep").str("-").arg(OpCode::Kwargs, 1);
    asm.arg(OpCode::Call, 5).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(&mut vm, main).unwrap(), Value::None);
    assert_eq!(String::from_utf8(sink.0.borrow().clone()).unwrap(), "a-1\n");
}

#[test]
fn recursion_is_bounded() {
    let mut vm = Vm::new(VmConfig { max_frames: 64, ..VmConfig::default() });
    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::GetGlobal, "r").arg(OpCode::Call, 0).op(OpCode::Return);
    let r = asm.build("r", &[], &[]);

    let mut asm = Asm::new(&mut vm);
    asm.closure(r, &[]).named(OpCode::DefineGlobal, "r");
    asm.named(OpCode::GetGlobal, "r").arg(OpCode::Call, 0).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.to_string(), "RecursionError: maximum recursion depth exceeded");
    assert_eq!(exception.traceback.len(), 64);
    assert!(vm.frames.is_empty());
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn interrupt_flag_raises_keyboard_interrupt() {
    let mut vm = vm();
    let mut asm = Asm::new(&mut vm);
    let start = asm.mark();
    asm.loop_to(start);
    let main = asm.build("<module>", &[], &[]);
    let flag = vm.interrupt_handle();
    flag.store(true, Ordering::Relaxed);
    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.type_name, "KeyboardInterrupt");
    assert!(!flag.load(Ordering::Relaxed));
}

// ── Garbage collection ──────────────────────────────────────────────

#[test]
fn stress_collection_keeps_live_values() {
    let mut vm = Vm::new(VmConfig { stress_gc: true, ..VmConfig::default() });
    define_hierarchy(&mut vm);
    assert_eq!(call_on_derived(&mut vm, "super_who"), "base");

    // i = 0; while i < 100: list(); i = i + 1
    let mut asm = Asm::new(&mut vm);
    asm.int(0);
    let start = asm.mark();
    asm.arg(OpCode::GetLocal, 0).int(100).op(OpCode::Less);
    let exit = asm.jump(OpCode::JumpIfFalse);
    asm.op(OpCode::Pop);
    asm.named(OpCode::GetGlobal, "list").arg(OpCode::Call, 0).op(OpCode::Pop);
    asm.arg(OpCode::GetLocal, 0).int(1).op(OpCode::Add).arg(OpCode::SetLocal, 0).op(OpCode::Pop);
    asm.loop_to(start);
    asm.patch(exit);
    asm.op(OpCode::Pop).arg(OpCode::GetLocal, 0).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);

    let before = vm.heap_stats().collections;
    assert_eq!(run(&mut vm, main).unwrap(), Value::Integer(100));
    let stats = vm.heap_stats();
    assert!(stats.collections > before + 100);
    assert!(stats.objects_by_kind.get("instance").copied().unwrap_or(0) < 20, "{stats:?}");
}

#[test]
fn paused_collection_skips_safe_points() {
    let mut vm = Vm::new(VmConfig { stress_gc: true, ..VmConfig::default() });
    vm.gc_paused = 1;
    let mut asm = Asm::new(&mut vm);
    asm.int(1).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    run(&mut vm, main).unwrap();
    assert_eq!(vm.heap_stats().collections, 0);
}

#[test]
fn held_roots_survive_collection_until_released() {
    let mut vm = vm();
    let list = vm.new_list(Vec::new());
    let handle = list.as_object().unwrap();
    vm.with_roots(&[list], |vm| {
        vm.collect_garbage();
        Ok(())
    })
    .unwrap();
    assert!(vm.heap.try_get(handle).is_some());
    assert!(vm.temp_roots.is_empty());
    vm.collect_garbage();
    assert!(vm.heap.try_get(handle).is_none());
}

#[test]
fn list_equality_survives_eq_that_empties_the_list() {
    let mut vm = Vm::new(VmConfig { stress_gc: true, ..VmConfig::default() });
    // Mutator.__eq__(self, other): xs[1] = None; return True
    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::GetGlobal, "xs").int(1).op(OpCode::None).op(OpCode::InvokeSetter).op(OpCode::Pop);
    asm.op(OpCode::True).op(OpCode::Return);
    let eq = asm.build("__eq__", &["self", "other"], &[]);

    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::Class, "Mutator").closure(eq, &[]).named(OpCode::Method, "__eq__");
    asm.op(OpCode::Finalize).named(OpCode::DefineGlobal, "Mutator");
    asm.named(OpCode::Class, "Box").op(OpCode::Finalize).named(OpCode::DefineGlobal, "Box");
    for name in ["xs", "ys"] {
        asm.named(OpCode::GetGlobal, "list").arg(OpCode::Call, 0).named(OpCode::DefineGlobal, name);
        for class in ["Mutator", "Box"] {
            asm.named(OpCode::GetGlobal, name).named(OpCode::GetProperty, "append");
            asm.named(OpCode::GetGlobal, class).arg(OpCode::Call, 0).arg(OpCode::Call, 1).op(OpCode::Pop);
        }
    }
    asm.named(OpCode::GetGlobal, "xs").named(OpCode::GetGlobal, "ys").op(OpCode::Equal).op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);

    assert_eq!(run(&mut vm, main).unwrap(), Value::Boolean(false));
    assert!(vm.temp_roots.is_empty());
}

// ── Stack effects ───────────────────────────────────────────────────

/// Sum of `stack_effect` over the straight-line instructions in `range`, and
/// how many of them use a long operand.
fn predicted_effect(chunk: &Chunk, range: std::ops::Range<usize>) -> (isize, usize) {
    let mut offset = range.start;
    let (mut total, mut long_forms) = (0, 0);
    while offset < range.end {
        let (op, operand) = chunk.decode(offset).expect("an instruction");
        total += op.stack_effect(operand).expect("no control transfer");
        long_forms += usize::from(op.is_long());
        offset += 1 + op.operand().width();
    }
    assert_eq!(offset, range.end);
    (total, long_forms)
}

/// Runs `block` between two `depth()` readings. Asserts the observed change
/// in stack depth equals the predicted one and returns the long-form count.
fn check_block_effect(vm: &mut Vm, block: impl FnOnce(&mut Asm<'_>)) -> usize {
    let mut asm = Asm::new(vm);
    asm.named(OpCode::GetGlobal, "depth").arg(OpCode::Call, 0).named(OpCode::DefineGlobal, "before");
    let start = asm.mark();
    block(&mut asm);
    let end = asm.mark();
    asm.named(OpCode::GetGlobal, "depth").arg(OpCode::Call, 0);
    asm.named(OpCode::GetGlobal, "before").op(OpCode::Subtract).op(OpCode::Return);
    let (predicted, long_forms) = predicted_effect(&asm.chunk, start..end);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(vm, main).unwrap(), Value::Integer(predicted as i64));
    long_forms
}

#[test]
fn stack_effects_match_execution() {
    let mut vm = vm();
    install_depth(&mut vm);
    define_subtract(&mut vm);

    check_block_effect(&mut vm, |asm| {
        asm.int(1).int(2).byte(OpCode::Dup, 1).op(OpCode::Add).op(OpCode::Swap).op(OpCode::Pop);
        asm.op(OpCode::True).op(OpCode::Not).op(OpCode::Pop).int(5).op(OpCode::Negate);
    });

    // f(b=1, a=10)
    check_block_effect(&mut vm, |asm| {
        asm.named(OpCode::GetGlobal, "f").str("b").int(1).str("a").int(10);
        asm.arg(OpCode::Kwargs, 2).arg(OpCode::Call, 5);
    });

    // f(*[10, 4])
    check_block_effect(&mut vm, |asm| {
        asm.named(OpCode::GetGlobal, "f").byte(OpCode::ExpandArgs, 1);
        asm.named(OpCode::GetGlobal, "list").arg(OpCode::Call, 0);
        for value in [10, 4] {
            asm.byte(OpCode::Dup, 0).named(OpCode::GetProperty, "append").int(value).arg(OpCode::Call, 1);
            asm.op(OpCode::Pop);
        }
        asm.arg(OpCode::Kwargs, 1).arg(OpCode::Call, 3);
    });

    check_block_effect(&mut vm, |asm| {
        asm.named(OpCode::Class, "Point").op(OpCode::Finalize).named(OpCode::DefineGlobal, "Point");
        asm.named(OpCode::GetGlobal, "Point").arg(OpCode::Call, 0).byte(OpCode::Dup, 0);
        asm.int(3).named(OpCode::SetProperty, "x").op(OpCode::Pop).named(OpCode::GetProperty, "x");
        asm.named(OpCode::DelGlobal, "Point");
    });

    let long_forms = check_block_effect(&mut vm, |asm| {
        // Fill the pool past one byte so every index operand takes the long form.
        for i in 0..300 {
            asm.chunk.add_constant(Value::Integer(i));
        }
        asm.int(7).named(OpCode::GetGlobal, "f").int(5).int(2);
        asm.chunk.write_op(OpCode::CallLong, asm.line);
        for byte in [0, 0, 2] {
            asm.chunk.write(byte, asm.line);
        }
        asm.int(9).named(OpCode::DefineGlobal, "spare");
    });
    assert_eq!(long_forms, 7);
}

// ── Imports ─────────────────────────────────────────────────────────

fn module_file(dir: &std::path::Path) {
    // log.append("loaded"); value = 42
    let mut chunk = Chunk::default();
    chunk.emit_operand(OpCode::GetGlobal, 0, 1).unwrap();
    chunk.emit_operand(OpCode::GetProperty, 1, 1).unwrap();
    chunk.emit_operand(OpCode::Constant, 2, 1).unwrap();
    chunk.emit_operand(OpCode::Call, 1, 1).unwrap();
    chunk.write_op(OpCode::Pop, 1);
    chunk.emit_operand(OpCode::Constant, 3, 2).unwrap();
    chunk.emit_operand(OpCode::DefineGlobal, 4, 2).unwrap();
    chunk.write_op(OpCode::None, 2);
    chunk.write_op(OpCode::Return, 2);
    let file = CodeFile {
        function: FunctionRepr {
            code: chunk.code,
            lines: chunk.lines.iter().map(|r| (r.start_offset, r.line)).collect(),
            constants: vec![
                ConstantRepr::Str("log".into()),
                ConstantRepr::Str("append".into()),
                ConstantRepr::Str("loaded".into()),
                ConstantRepr::Int(42),
                ConstantRepr::Str("value".into()),
            ],
            ..FunctionRepr::default()
        },
    };
    std::fs::write(dir.join("helper.kbc.json"), serde_json::to_string(&file).unwrap()).unwrap();
}

#[test]
fn imports_load_once_and_cache() {
    let dir = tempfile::tempdir().unwrap();
    module_file(dir.path());
    let mut vm = Vm::new(VmConfig { module_paths: vec![dir.path().to_path_buf()], ..VmConfig::default() });
    let log = vm.new_list(Vec::new());
    vm.set_field(vm.builtins, "log", log);

    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::Import, "helper").named(OpCode::Import, "helper").op(OpCode::Is);
    asm.named(OpCode::Import, "helper").named(OpCode::GetProperty, "value").op(OpCode::Add);
    asm.op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    assert_eq!(run(&mut vm, main).unwrap(), Value::Integer(43));
    assert_eq!(vm.repr(log).unwrap(), "['loaded']");
    assert_eq!(vm.module_global("helper", "value"), Some(Value::Integer(42)));
}

#[test]
fn missing_module_raises_import_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut vm = Vm::new(VmConfig { module_paths: vec![dir.path().to_path_buf()], ..VmConfig::default() });
    let mut asm = Asm::new(&mut vm);
    asm.named(OpCode::Import, "nowhere").op(OpCode::Return);
    let main = asm.build("<module>", &[], &[]);
    let exception = uncaught(run(&mut vm, main));
    assert_eq!(exception.to_string(), "ImportError: No module named 'nowhere'");
}

#[test]
fn host_calls_into_bytecode() {
    let mut vm = vm();
    define_subtract(&mut vm);
    let f = vm.module_global("__main__", "f").unwrap();
    assert_eq!(vm.call(f, &[Value::Integer(5), Value::Integer(3)]).unwrap(), Value::Integer(2));
    assert_eq!(vm.stack_depth(), 0);
}
