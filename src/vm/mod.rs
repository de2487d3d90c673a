mod value;
pub mod bytecode;
pub mod code_block;
pub mod debug_info;
pub mod runtime;
pub mod runtime_module;

pub use bytecode::{BytecodeModule, BytecodeProvider, OpCode, RuntimeFunctionHeader};
pub use code_block::{CodeBlock, PropertyCacheEntry};
pub use runtime::{ExecutionStatus, Runtime, WeakRootAcceptor};
pub use runtime_module::RuntimeModule;
pub use value::{JsValue, DOUBLE_LIM};
