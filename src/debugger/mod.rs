//! Debugger support: breakpoint records.
//!
//! Breakpoints patch the opcode stream of a code block. The registry keeps
//! the original opcode so `uninstall` can restore it; a breakpoint must be
//! registered before `CodeBlock::install_breakpoint_at_offset` runs.

use crate::vm::code_block::CodeBlock;

/// One registered breakpoint.
#[derive(Debug, Clone, Copy)]
pub struct Breakpoint {
    pub module_index: u32,
    pub function_id: u32,
    pub offset: u32,
    /// The opcode byte replaced by `Debugger`.
    pub original_opcode: u8,
    pub enabled: bool,
}

/// All breakpoints of one runtime.
#[derive(Default)]
pub struct BreakpointRegistry {
    breakpoints: Vec<Breakpoint>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and install a breakpoint at `offset` in `block`.
    pub fn set_breakpoint(&mut self, block: &CodeBlock, offset: u32) {
        let original_opcode = unsafe { *block.get_offset_ptr(offset) };
        let module = unsafe { &*block.get_runtime_module() };
        self.breakpoints.push(Breakpoint {
            module_index: module.module_index(),
            function_id: block.get_function_id(),
            offset,
            original_opcode,
            enabled: true,
        });
        block.install_breakpoint_at_offset(offset);
    }

    /// Uninstall and forget the breakpoint at `offset` in `block`.
    pub fn clear_breakpoint(&mut self, block: &CodeBlock, offset: u32) {
        let module = unsafe { &*block.get_runtime_module() };
        let module_index = module.module_index();
        let function_id = block.get_function_id();
        if let Some(pos) = self.breakpoints.iter().position(|bp| {
            bp.module_index == module_index && bp.function_id == function_id && bp.offset == offset
        }) {
            let bp = self.breakpoints.remove(pos);
            block.uninstall_breakpoint_at_offset(offset, bp.original_opcode);
        }
    }

    /// The breakpoint installed at `offset`, if any.
    pub fn breakpoint_at(
        &self,
        module_index: u32,
        function_id: u32,
        offset: u32,
    ) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|bp| {
            bp.module_index == module_index && bp.function_id == function_id && bp.offset == offset
        })
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }
}
