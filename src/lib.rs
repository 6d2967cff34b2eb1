pub mod builtins;
pub mod chunk;
pub mod debug;
pub mod diagnostic;
pub mod exception;
pub mod heap;
pub mod loader;
pub mod modules;
pub mod object;
pub mod value;
pub mod vm;

pub use vm::{Vm, VmConfig, VmError, VmResult};
