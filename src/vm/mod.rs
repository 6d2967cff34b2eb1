use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::builtins::{self, BuiltinClasses, CommonNames};
use crate::debug::TraceFrame;
use crate::exception::{ExceptionKind, HandlerStack, Raised};
use crate::heap::{Heap, HeapStats, ObjRef};
use crate::loader::{self, LoadError};
use crate::object::class::DunderNames;
use crate::object::{Closure, Function, Instance, Object, Payload, Upvalue};
use crate::value::Value;

pub mod call;
mod dispatch;
pub mod ops;
pub mod property;
#[cfg(test)]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("{0}")]
    Uncaught(UncaughtException),
    #[error(transparent)]
    Load(#[from] LoadError),
}

pub type VmResult<T> = Result<T, VmError>;

/// An exception that reached the top of a host call.
#[derive(Debug, Clone)]
pub struct UncaughtException {
    pub type_name: String,
    pub message: String,
    /// Outermost call first.
    pub traceback: Vec<TraceFrame>,
    pub value: Value,
}

impl std::fmt::Display for UncaughtException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.type_name)
        } else {
            write!(f, "{}: {}", self.type_name, self.message)
        }
    }
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_frames: usize,
    pub module_paths: Vec<PathBuf>,
    pub trace: bool,
    pub stress_gc: bool,
    pub gc_initial_threshold: usize,
    pub gc_growth_factor: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_frames: 256,
            module_paths: vec![PathBuf::from(".")],
            trace: false,
            stress_gc: false,
            gc_initial_threshold: 1024,
            gc_growth_factor: 2,
        }
    }
}

/// Populates a freshly created native module's fields.
pub type ModuleLoader = Rc<dyn Fn(&mut Vm, ObjRef) -> Result<(), Raised>>;

// ── Call frames ─────────────────────────────────────────────────────

pub(crate) struct CallFrame {
    pub closure: ObjRef,
    pub function: Rc<Function>,
    pub ip: usize,
    /// Stack index of slot 0; the callee sits at `base - 1`.
    pub base: usize,
    pub globals: ObjRef,
    /// Result substituted for the frame's return value (initializers).
    pub returns: Option<Value>,
}

// ── VM ──────────────────────────────────────────────────────────────

pub struct Vm {
    pub heap: Heap,
    pub config: VmConfig,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) handlers: HandlerStack,
    /// Open upvalues ordered by stack slot.
    pub(crate) open_upvalues: Vec<(usize, ObjRef)>,
    pub(crate) modules: HashMap<ObjRef, ObjRef>,
    native_modules: HashMap<String, ModuleLoader>,
    pub builtins: ObjRef,
    pub classes: BuiltinClasses,
    pub(crate) dunders: DunderNames,
    pub(crate) names: CommonNames,
    /// Values held by host code across calls back into the VM; see `with_roots`.
    pub(crate) temp_roots: Vec<Value>,
    pub(crate) last_traceback: Option<(Value, Vec<TraceFrame>)>,
    pub(crate) gc_paused: usize,
    interrupt: Arc<AtomicBool>,
    output: Box<dyn Write>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let mut heap = Heap::new(config.gc_initial_threshold, config.gc_growth_factor);
        let dunders = DunderNames::intern(&mut heap);
        let names = CommonNames::intern(&mut heap);
        let (classes, builtins) = builtins::bootstrap(&mut heap, &dunders, &names);
        Vm {
            heap,
            config,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            handlers: HandlerStack::default(),
            open_upvalues: Vec::new(),
            modules: HashMap::new(),
            native_modules: HashMap::new(),
            builtins,
            classes,
            dunders,
            names,
            temp_roots: Vec::new(),
            last_traceback: None,
            gc_paused: 0,
            interrupt: Arc::new(AtomicBool::new(false)),
            output: Box::new(std::io::stdout()),
        }
    }

    /// Flag polled at loop back-edges and calls; setting it raises
    /// `KeyboardInterrupt` at the next poll.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Redirect `print` output.
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    pub(crate) fn write_out(&mut self, text: &str) -> Result<(), Raised> {
        match self.output.write_all(text.as_bytes()).and_then(|_| self.output.flush()) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.error(ExceptionKind::OSError, err.to_string())),
        }
    }

    pub fn register_module(&mut self, name: &str, loader: ModuleLoader) {
        self.native_modules.insert(name.to_string(), loader);
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    // ── Strings and values ──────────────────────────────────────────

    pub fn intern(&mut self, text: &str) -> Value {
        Value::Object(self.heap.intern(text))
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> Value {
        let class = self.classes.list;
        Value::Object(self.heap.alloc(Object::Instance(Instance::new(class, Payload::List(items)))))
    }

    pub fn new_dict(&mut self) -> ObjRef {
        let class = self.classes.dict;
        self.heap.alloc(Object::Instance(Instance::new(class, Payload::Dict(Default::default()))))
    }

    /// A module object named `name`; not registered in the module table.
    pub fn new_module(&mut self, name: &str, file: Option<&str>) -> ObjRef {
        let module = self.heap.alloc(Object::Instance(Instance::new(self.classes.module, Payload::None)));
        let name = self.intern(name);
        let file = match file {
            Some(file) => self.intern(file),
            None => Value::None,
        };
        if let Some(instance) = self.heap.as_instance_mut(module) {
            instance.fields.insert(self.names.name, name);
            instance.fields.insert(self.names.file, file);
        }
        module
    }

    /// Set `name` in the fields of `target` (a module or any instance).
    pub fn set_field(&mut self, target: ObjRef, name: &str, value: Value) {
        let name = self.heap.intern(name);
        if let Some(instance) = self.heap.as_instance_mut(target) {
            instance.fields.insert(name, value);
        }
    }

    pub fn get_field(&self, target: ObjRef, name: ObjRef) -> Option<Value> {
        self.heap.as_instance(target)?.fields.get(&name).copied()
    }

    // ── Stack ───────────────────────────────────────────────────────

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or_default()
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    pub(crate) fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    pub(crate) fn frame_mut(&mut self) -> &mut CallFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    // ── Exceptions ──────────────────────────────────────────────────

    /// Instantiate builtin exception `kind` with `message` as its argument.
    pub fn new_exception(&mut self, kind: ExceptionKind, message: impl AsRef<str>) -> Value {
        let class = self.classes.exception(kind);
        let arg = self.intern(message.as_ref());
        let mut instance = Instance::new(class, Payload::None);
        instance.fields.insert(self.names.arg, arg);
        Value::Object(self.heap.alloc(Object::Instance(instance)))
    }

    /// Start raising `exception`, recording the traceback at this point.
    pub fn throw(&mut self, exception: Value) -> Raised {
        let traceback = self.capture_traceback();
        self.last_traceback = Some((exception, traceback));
        Raised(exception)
    }

    pub fn error(&mut self, kind: ExceptionKind, message: impl AsRef<str>) -> Raised {
        let exception = self.new_exception(kind, message);
        self.throw(exception)
    }

    pub(crate) fn capture_traceback(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .map(|frame| {
                let chunk = &frame.function.chunk;
                TraceFrame {
                    function: self.heap.name(frame.function.name).to_string(),
                    filename: chunk.filename.as_deref().unwrap_or("<unknown>").to_string(),
                    line: chunk.line_number(frame.ip.saturating_sub(1)),
                }
            })
            .collect()
    }

    pub(crate) fn uncaught(&mut self, raised: Raised) -> VmError {
        let Raised(value) = raised;
        let class = self.type_of(value);
        let type_name = self
            .heap
            .as_class(class)
            .map(|c| self.heap.name(c.name).to_string())
            .unwrap_or_default();
        let arg = value.as_object().and_then(|r| self.get_field(r, self.names.arg));
        let message = match arg {
            Some(Value::None) | None => String::new(),
            Some(arg) => self.to_str(arg).unwrap_or_else(|_| "<unprintable>".to_string()),
        };
        let traceback = match self.last_traceback.take() {
            Some((raised_value, traceback)) if raised_value.same(value) => traceback,
            _ => Vec::new(),
        };
        VmError::Uncaught(UncaughtException { type_name, message, traceback, value })
    }

    fn poll_interrupt(&mut self) -> Result<(), Raised> {
        if self.interrupt.swap(false, Ordering::Relaxed) {
            return Err(self.error(ExceptionKind::KeyboardInterrupt, ""));
        }
        Ok(())
    }

    // ── Upvalues ────────────────────────────────────────────────────

    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        match self.open_upvalues.binary_search_by_key(&slot, |&(s, _)| s) {
            Ok(i) => self.open_upvalues[i].1,
            Err(i) => {
                let upvalue = self.heap.alloc(Object::Upvalue(Upvalue::Open(slot)));
                self.open_upvalues.insert(i, (slot, upvalue));
                upvalue
            }
        }
    }

    /// Migrate every open upvalue at or above `from` off the stack.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        while let Some(&(slot, upvalue)) = self.open_upvalues.last() {
            if slot < from {
                break;
            }
            let value = self.stack.get(slot).copied().unwrap_or_default();
            if let Object::Upvalue(cell) = self.heap.get_mut(upvalue) {
                *cell = Upvalue::Closed(value);
            }
            self.open_upvalues.pop();
        }
    }

    pub(crate) fn read_upvalue(&self, upvalue: ObjRef) -> Value {
        match self.heap.get(upvalue) {
            Object::Upvalue(Upvalue::Open(slot)) => self.stack[*slot],
            Object::Upvalue(Upvalue::Closed(value)) => *value,
            _ => Value::None,
        }
    }

    pub(crate) fn write_upvalue(&mut self, upvalue: ObjRef, value: Value) {
        match self.heap.get_mut(upvalue) {
            Object::Upvalue(Upvalue::Open(slot)) => {
                let slot = *slot;
                self.stack[slot] = value;
            }
            Object::Upvalue(cell) => *cell = Upvalue::Closed(value),
            _ => {}
        }
    }

    // ── Garbage collection ──────────────────────────────────────────

    /// Run `body` with `values` treated as roots. Host code that copies a
    /// container's contents and then calls back into bytecode holds the
    /// copies this way.
    pub(crate) fn with_roots<T>(
        &mut self,
        values: &[Value],
        body: impl FnOnce(&mut Self) -> Result<T, Raised>,
    ) -> Result<T, Raised> {
        let mark = self.temp_roots.len();
        self.temp_roots.extend_from_slice(values);
        let result = body(self);
        self.temp_roots.truncate(mark);
        result
    }

    pub(crate) fn maybe_collect(&mut self) {
        if self.gc_paused == 0 && (self.config.stress_gc || self.heap.should_collect()) {
            self.collect_garbage();
        }
    }

    pub fn collect_garbage(&mut self) -> usize {
        let before = self.heap.live_objects();
        let mut roots: Vec<ObjRef> = Vec::new();
        let values = self
            .stack
            .iter()
            .chain(&self.temp_roots)
            .copied()
            .chain(self.handlers.pending_values())
            .chain(self.frames.iter().filter_map(|f| f.returns))
            .chain(self.last_traceback.as_ref().map(|(v, _)| *v));
        roots.extend(values.filter_map(Value::as_object));
        roots.extend(self.frames.iter().flat_map(|f| [f.closure, f.globals]));
        roots.extend(self.open_upvalues.iter().map(|&(_, r)| r));
        roots.extend(self.modules.iter().flat_map(|(&k, &v)| [k, v]));
        roots.push(self.builtins);
        roots.extend(self.classes.all());
        roots.extend(self.dunders.iter());
        roots.extend(self.names.all());

        let freed = self.heap.collect(roots);
        log::debug!(
            "gc: {before} -> {} objects, next collection at {}",
            self.heap.live_objects(),
            self.heap.next_threshold()
        );
        freed
    }

    // ── Modules ─────────────────────────────────────────────────────

    pub fn module_paths(&self) -> &[PathBuf] {
        &self.config.module_paths
    }

    /// The module named `name`, loading it on first import.
    pub(crate) fn import_module(&mut self, name: ObjRef) -> Result<ObjRef, Raised> {
        if let Some(&module) = self.modules.get(&name) {
            return Ok(module);
        }
        let text = self.heap.name(name).to_string();

        if let Some(loader) = self.native_modules.get(&text).cloned() {
            log::debug!("import: native module {text}");
            let module = self.new_module(&text, None);
            self.modules.insert(name, module);
            if let Err(raised) = loader(self, module) {
                self.modules.remove(&name);
                return Err(raised);
            }
            return Ok(module);
        }

        let file_name = format!("{text}.kbc.json");
        let mut found = None;
        for dir in &self.config.module_paths {
            if !dir.is_dir() {
                log::warn!("module path {} is not a readable directory", dir.display());
                continue;
            }
            let path = dir.join(&file_name);
            if path.is_file() {
                found = Some(path);
                break;
            }
        }
        let Some(path) = found else {
            return Err(self.error(ExceptionKind::ImportError, format!("No module named '{text}'")));
        };

        log::debug!("import: {text} from {}", path.display());
        let function = match loader::load_file(&mut self.heap, &path) {
            Ok(function) => function,
            Err(err) => return Err(self.error(ExceptionKind::ImportError, format!("{text}: {err}"))),
        };
        let module = self.new_module(&text, Some(&path.display().to_string()));
        self.modules.insert(name, module);
        if let Err(raised) = self.run_in_module(function, module) {
            self.modules.remove(&name);
            return Err(raised);
        }
        Ok(module)
    }

    fn run_in_module(&mut self, function: ObjRef, module: ObjRef) -> Result<Value, Raised> {
        let Some(proto) = self.heap.as_function(function).cloned() else {
            return Err(self.error(ExceptionKind::TypeError, "code object is not a function"));
        };
        let closure = self.heap.alloc(Object::Closure(Closure {
            function,
            proto,
            upvalues: Vec::new(),
            globals: module,
        }));
        self.call_sync(Value::Object(closure), &[])
    }

    // ── Host entry points ───────────────────────────────────────────

    /// Execute a loaded top-level function as the body of module `name`.
    /// A module already registered under `name` keeps its globals, so
    /// successive calls behave like lines typed into a REPL.
    pub fn execute(&mut self, function: ObjRef, name: &str, file: Option<&str>) -> VmResult<Value> {
        let key = self.heap.intern(name);
        let module = match self.modules.get(&key) {
            Some(&module) => module,
            None => {
                let module = self.new_module(name, file);
                self.modules.insert(key, module);
                module
            }
        };
        self.run_in_module(function, module).map_err(|raised| self.uncaught(raised))
    }

    /// Load and run a compiled code file as `__main__`.
    pub fn run_file(&mut self, path: &Path) -> VmResult<Value> {
        let function = loader::load_file(&mut self.heap, path)?;
        let file = path.display().to_string();
        self.execute(function, "__main__", Some(&file))
    }

    /// Call any callable value from the host.
    pub fn call(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        self.call_sync(callee, args).map_err(|raised| self.uncaught(raised))
    }

    /// `str(value)` from the host.
    pub fn stringify(&mut self, value: Value) -> VmResult<String> {
        self.to_str(value).map_err(|raised| self.uncaught(raised))
    }

    /// Look up a global of a loaded module.
    pub fn module_global(&mut self, module: &str, name: &str) -> Option<Value> {
        let module_name = self.heap.intern(module);
        let module = *self.modules.get(&module_name)?;
        let name = self.heap.intern(name);
        self.get_field(module, name)
    }
}
