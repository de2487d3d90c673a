//! jade - a JavaScript bytecode virtual machine core
//!
//! The execution engine compiles JS functions to a compact bytecode and
//! runs them through an external interpreter or a template-style AArch64
//! JIT. This crate holds the per-function code blocks with their inline
//! property caches, the call-graph analysis over the IR, and the JIT.

pub mod config;
#[cfg(feature = "debugger")]
pub mod debugger;
pub mod ir;
#[cfg(feature = "jit")]
pub mod jit;
pub mod vm;

pub use config::{JitMode, RuntimeConfig};
pub use vm::{CodeBlock, ExecutionStatus, JsValue, Runtime};

/// Abort on use of an API excluded from this build.
#[allow(dead_code)]
pub(crate) fn fatal(msg: &str) -> ! {
    panic!("jade fatal error: {}", msg);
}
