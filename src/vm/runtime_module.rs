//! A loaded bytecode module at runtime.
//!
//! Owns the bytecode provider, the domain handle, and the code blocks
//! materialised so far. Code blocks are boxed so their addresses stay
//! stable for the lifetime of the module.

use super::bytecode::{BytecodeError, BytecodeProvider};
use super::code_block::CodeBlock;
use super::runtime::{Domain, StringArena};
use super::value::JsValue;
use std::cell::Cell;

pub struct RuntimeModule {
    /// Index of this module in the runtime's module list.
    module_index: u32,
    domain: Domain,
    provider: Box<dyn BytecodeProvider>,
    /// Lazily materialised code blocks, indexed by function ID.
    code_blocks: Vec<Option<Box<CodeBlock>>>,
    /// Number of external users (installed breakpoints) keeping the module
    /// alive.
    user_count: Cell<u32>,
}

impl RuntimeModule {
    pub fn new(
        module_index: u32,
        domain: Domain,
        provider: Box<dyn BytecodeProvider>,
    ) -> Box<RuntimeModule> {
        let count = provider.function_count() as usize;
        let mut code_blocks = Vec::with_capacity(count);
        code_blocks.resize_with(count, || None);
        Box::new(RuntimeModule {
            module_index,
            domain,
            provider,
            code_blocks,
            user_count: Cell::new(0),
        })
    }

    pub fn module_index(&self) -> u32 {
        self.module_index
    }

    /// The owning domain, used by closure construction.
    pub fn get_domain(&self) -> Domain {
        self.domain
    }

    pub fn provider(&self) -> &dyn BytecodeProvider {
        &*self.provider
    }

    pub fn provider_mut(&mut self) -> &mut dyn BytecodeProvider {
        &mut *self.provider
    }

    /// Code block for `function_id`, constructing it on first use. The
    /// returned pointer stays valid for the lifetime of the module.
    pub fn get_code_block_may_allocate(
        &mut self,
        function_id: u32,
    ) -> Result<*mut CodeBlock, BytecodeError> {
        let slot = function_id as usize;
        if self.code_blocks[slot].is_none() {
            let header = self.provider.function_header(function_id);
            let exception_table = self.provider.exception_table(function_id).to_vec();
            let module_ptr = self as *mut RuntimeModule;
            let block = CodeBlock::create(
                module_ptr,
                header,
                self.provider.bytecode(function_id),
                function_id,
                exception_table,
            )?;
            self.code_blocks[slot] = Some(block);
        }
        Ok(self.code_blocks[slot].as_mut().map(|b| &mut **b as *mut CodeBlock).unwrap())
    }

    /// The code block for `function_id` if it was already materialised.
    pub fn code_block(&self, function_id: u32) -> Option<&CodeBlock> {
        self.code_blocks
            .get(function_id as usize)
            .and_then(|slot| slot.as_deref())
    }

    /// Iterate the materialised code blocks, e.g. for GC root marking.
    pub fn code_blocks(&self) -> impl Iterator<Item = &CodeBlock> {
        self.code_blocks.iter().filter_map(|slot| slot.as_deref())
    }

    /// Interned-string access: copy the module string into the runtime
    /// arena and return it as a string value.
    pub fn get_string_prim_from_string_id_may_allocate(
        &self,
        strings: &mut StringArena,
        string_id: u32,
    ) -> JsValue {
        let id = strings.intern(self.provider.string(string_id));
        JsValue::encode_string(id)
    }

    pub fn add_user(&self) {
        self.user_count.set(self.user_count.get() + 1);
    }

    pub fn remove_user(&self) {
        debug_assert!(self.user_count.get() > 0, "user count underflow");
        self.user_count.set(self.user_count.get() - 1);
    }

    pub fn user_count(&self) -> u32 {
        self.user_count.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::{
        BytecodeBuilder, BytecodeModule, OpCode, RuntimeFunctionHeader,
    };
    use crate::vm::runtime::Domain;

    fn simple_module() -> Box<RuntimeModule> {
        let mut builder = BytecodeModule::builder();
        let name = builder.add_string("f");
        let mut b = BytecodeBuilder::new();
        b.op(OpCode::LoadConstUndefined).u8(0);
        b.op(OpCode::Ret).u8(0);
        builder.add_function(
            RuntimeFunctionHeader {
                name_string_id: name,
                ..Default::default()
            },
            b.finish(),
            Vec::new(),
        );
        RuntimeModule::new(0, Domain(0), Box::new(builder.build()))
    }

    #[test]
    fn test_code_block_pointers_are_stable() {
        let mut module = simple_module();
        let first = module.get_code_block_may_allocate(0).unwrap();
        let second = module.get_code_block_may_allocate(0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_user_count() {
        let module = simple_module();
        module.add_user();
        module.add_user();
        module.remove_user();
        assert_eq!(module.user_count(), 1);
    }
}
