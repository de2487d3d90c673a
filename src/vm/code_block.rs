//! Per-function executable unit.
//!
//! A `CodeBlock` owns the opcode bytes of one function (through the
//! provider), the inline property caches, and the lazy-compilation state.
//! It is created through a single factory, lives at a stable address inside
//! its `RuntimeModule`, and is never copied or moved: the JIT and the
//! interpreter retain raw pointers into it.

use super::bytecode::{verify_bytecode, BytecodeError, ExceptionHandler, RuntimeFunctionHeader};
use super::runtime::{ExecutionStatus, HiddenClassId, Runtime, SymbolId, WeakRootAcceptor};
use super::runtime_module::RuntimeModule;
use std::cell::{Cell, RefCell, UnsafeCell};

#[cfg(feature = "debugger")]
use super::bytecode::OpCode;

/// One monomorphic inline cache entry: a hidden class paired with a
/// property slot. `class == 0` means empty. The hidden class is a weak
/// reference; GC root marking traverses it through `WeakRootAcceptor`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PropertyCacheEntry {
    pub class: HiddenClassId,
    pub slot: u32,
}

/// Size of an encoded cache entry; the JIT addresses entries as
/// `base + index * PROPERTY_CACHE_ENTRY_SIZE`.
pub const PROPERTY_CACHE_ENTRY_SIZE: u32 = 8;

/// A sequence of instructions representing the body of a function.
pub struct CodeBlock {
    /// Owning runtime module. The module outlives its code blocks and both
    /// live at stable heap addresses.
    module: *mut RuntimeModule,

    /// Function header; replaced in place when a lazy function compiles.
    header: Cell<RuntimeFunctionHeader>,

    /// First opcode byte. Null iff the function is lazy.
    bytecode: Cell<*const u8>,

    /// ID of this function in the module's function list. Stable across
    /// lazy compilation.
    function_id: u32,

    /// Inline cache slab, layout [read segment | write segment].
    cache: UnsafeCell<Box<[PropertyCacheEntry]>>,
    property_cache_size: u32,
    write_prop_cache_offset: u32,

    /// Copy of the provider's exception table; refreshed by lazy compile.
    exception_table: RefCell<Vec<ExceptionHandler>>,

    /// Native entry point once the function has been JIT compiled.
    #[cfg(feature = "jit")]
    jit_entry: Cell<*const u8>,
    /// Set when JIT compilation failed; the function stays on the
    /// interpreter without poisoning others.
    #[cfg(feature = "jit")]
    jit_blocked: Cell<bool>,
    /// Invocation count, drives the JIT threshold.
    #[cfg(feature = "jit")]
    exec_count: Cell<u32>,

    /// ID written/read by the JS function profiler on function events.
    #[cfg(feature = "profiler")]
    pub profiler_id: Cell<u32>,
}

impl CodeBlock {
    /// Create a code block for `function_id` of `module`. The single
    /// factory: computes the cache layout from the header and
    /// value-initialises every entry to empty.
    ///
    /// Verifies that non-lazy bytecode decodes cleanly and ends with a
    /// return-class terminator.
    pub fn create(
        module: *mut RuntimeModule,
        header: RuntimeFunctionHeader,
        bytecode: Option<&[u8]>,
        function_id: u32,
        exception_table: Vec<ExceptionHandler>,
    ) -> Result<Box<CodeBlock>, BytecodeError> {
        if let Some(bytes) = bytecode {
            verify_bytecode(bytes)?;
        }
        let cache_size = header.read_cache_size as u32 + header.write_cache_size as u32;
        let cache = vec![PropertyCacheEntry::default(); cache_size as usize].into_boxed_slice();
        Ok(Box::new(CodeBlock {
            module,
            header: Cell::new(header),
            bytecode: Cell::new(bytecode.map_or(std::ptr::null(), |b| b.as_ptr())),
            function_id,
            cache: UnsafeCell::new(cache),
            property_cache_size: cache_size,
            write_prop_cache_offset: header.read_cache_size as u32,
            exception_table: RefCell::new(exception_table),
            #[cfg(feature = "jit")]
            jit_entry: Cell::new(std::ptr::null()),
            #[cfg(feature = "jit")]
            jit_blocked: Cell::new(false),
            #[cfg(feature = "jit")]
            exec_count: Cell::new(0),
            #[cfg(feature = "profiler")]
            profiler_id: Cell::new(u32::MAX),
        }))
    }

    pub fn get_runtime_module(&self) -> *mut RuntimeModule {
        self.module
    }

    fn module(&self) -> &RuntimeModule {
        unsafe { &*self.module }
    }

    pub fn get_param_count(&self) -> u32 {
        self.header.get().param_count
    }

    pub fn get_frame_size(&self) -> u32 {
        self.header.get().frame_size
    }

    pub fn get_function_id(&self) -> u32 {
        self.function_id
    }

    pub fn get_header(&self) -> RuntimeFunctionHeader {
        self.header.get()
    }

    pub fn is_strict_mode(&self) -> bool {
        self.header.get().flags.strict_mode
    }

    /// Offset of the function in a virtual bytecode stream in which every
    /// function emits its bytecode in order. Used for backtraces when
    /// debug info is absent.
    pub fn get_virtual_offset(&self) -> u32 {
        self.header.get().virtual_offset
    }

    /// Name of this function as an interned identifier. May allocate in
    /// the runtime identifier table.
    pub fn get_name_may_allocate(&self, runtime: &mut Runtime) -> SymbolId {
        let name_id = self.header.get().name_string_id;
        runtime.intern_symbol(self.module().provider().string(name_id))
    }

    /// Function name, resolved through the module string table.
    pub fn get_name_string(&self) -> String {
        self.module()
            .provider()
            .string(self.header.get().name_string_id)
            .to_string()
    }

    /// Extra memory attributed to this code block, for GC accounting.
    pub fn additional_memory_size(&self) -> usize {
        self.property_cache_size as usize * std::mem::size_of::<PropertyCacheEntry>()
    }

    // ---- opcode range ----

    pub fn begin(&self) -> *const u8 {
        debug_assert!(!self.is_lazy(), "lazy function has no bytecode");
        self.bytecode.get()
    }

    pub fn end(&self) -> *const u8 {
        unsafe { self.begin().add(self.header.get().bytecode_size as usize) }
    }

    pub fn get_opcode_array(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.begin(), self.header.get().bytecode_size as usize) }
    }

    /// Whether `inst` points into this code block.
    pub fn contains(&self, inst: *const u8) -> bool {
        self.begin() <= inst && inst < self.end()
    }

    pub fn get_offset_ptr(&self, offset: u32) -> *const u8 {
        debug_assert!(offset < self.header.get().bytecode_size, "offset out of bounds");
        unsafe { self.begin().add(offset as usize) }
    }

    pub fn get_offset_of(&self, inst: *const u8) -> u32 {
        debug_assert!(self.contains(inst), "inst not in this code block");
        (inst as usize - self.begin() as usize) as u32
    }

    // ---- exception handling ----

    /// Given the offset of the instruction where an exception happened,
    /// return the offset of the handler to jump to, or -1 if none covers
    /// it. The narrowest enclosing range wins; on equal width, the
    /// later-registered range wins.
    pub fn find_catch_target_offset(&self, exception_offset: u32) -> i32 {
        let table = self.exception_table.borrow();
        let mut best: Option<(u32, i32)> = None;
        for handler in table.iter() {
            if handler.start <= exception_offset && exception_offset < handler.end {
                let width = handler.end - handler.start;
                match best {
                    Some((best_width, _)) if width > best_width => {}
                    _ => best = Some((width, handler.target as i32)),
                }
            }
        }
        best.map_or(-1, |(_, target)| target)
    }

    // ---- debug info ----

    pub fn get_debug_source_locations_offset(&self) -> Option<u32> {
        self.header.get().debug_source_locs_offset
    }

    /// Source location of the instruction at `offset`, or `None` when the
    /// module carries no debug info.
    pub fn get_source_location(&self, offset: u32) -> Option<super::debug_info::SourceLocation> {
        let stream = self.header.get().debug_source_locs_offset?;
        self.module()
            .provider()
            .debug_info()?
            .source_location_at(stream, offset)
    }

    /// Source location of the function itself.
    pub fn get_source_location_for_function(
        &self,
    ) -> Option<super::debug_info::SourceLocation> {
        let stream = self.header.get().debug_source_locs_offset?;
        self.module().provider().debug_info()?.function_location(stream)
    }

    pub fn get_function_source_id(&self) -> Option<u32> {
        self.module()
            .provider()
            .debug_info()?
            .function_source_id(self.function_id)
    }

    pub fn get_debug_lexical_data_offset(&self) -> Option<u32> {
        self.header.get().debug_lexical_data_offset
    }

    // ---- lazy compilation ----

    #[cfg(not(feature = "lean"))]
    pub fn is_lazy(&self) -> bool {
        self.bytecode.get().is_null()
    }

    #[cfg(feature = "lean")]
    pub fn is_lazy(&self) -> bool {
        false
    }

    /// Compile the function body if it is still lazy. Returns
    /// `ExecutionStatus::Exception` with the compile error thrown into the
    /// runtime on failure.
    #[cfg(not(feature = "lean"))]
    pub fn lazy_compile(&self, runtime: &mut Runtime) -> ExecutionStatus {
        if !self.is_lazy() {
            return ExecutionStatus::Returned;
        }
        self.lazy_compile_impl(runtime)
    }

    #[cfg(feature = "lean")]
    pub fn lazy_compile(&self, _runtime: &mut Runtime) -> ExecutionStatus {
        ExecutionStatus::Returned
    }

    /// Hand the source span to the front end and replace the bytecode in
    /// place. The function ID stays stable.
    #[cfg(not(feature = "lean"))]
    fn lazy_compile_impl(&self, runtime: &mut Runtime) -> ExecutionStatus {
        let module = unsafe { &mut *self.module };
        match module.provider_mut().compile_lazy_function(self.function_id) {
            Ok(()) => {}
            Err(e) => {
                runtime.throw_type_error(&e.to_string());
                return ExecutionStatus::Exception;
            }
        }
        let header = module.provider().function_header(self.function_id);
        let bytes = match module.provider().bytecode(self.function_id) {
            Some(bytes) => bytes,
            None => {
                runtime.throw_type_error("lazy compilation produced no bytecode");
                return ExecutionStatus::Exception;
            }
        };
        if let Err(e) = verify_bytecode(bytes) {
            runtime.throw_type_error(&e.to_string());
            return ExecutionStatus::Exception;
        }
        self.header.set(header);
        self.bytecode.set(bytes.as_ptr());
        *self.exception_table.borrow_mut() =
            module.provider().exception_table(self.function_id).to_vec();
        ExecutionStatus::Returned
    }

    /// Whether the 1-based coordinates fall inside the lazy function's
    /// source span. Only meaningful before compilation.
    #[cfg(not(feature = "lean"))]
    pub fn coords_in_lazy_function(&self, line: u32, col: u32) -> bool {
        debug_assert!(self.is_lazy(), "function is not lazy");
        self.module()
            .provider()
            .lazy_source_span(self.function_id)
            .map_or(false, |span| span.contains(line, col))
    }

    // ---- variable reflection ----

    /// Number of variables for each enclosing variable scope, innermost
    /// first.
    #[cfg(not(feature = "lean"))]
    pub fn get_variable_counts(&self) -> Vec<u32> {
        let stream = match self.header.get().debug_lexical_data_offset {
            Some(stream) => stream,
            None => return Vec::new(),
        };
        self.module()
            .provider()
            .debug_info()
            .and_then(|info| info.lexical_variable_counts(stream))
            .unwrap_or_default()
    }

    #[cfg(feature = "lean")]
    pub fn get_variable_counts(&self) -> Vec<u32> {
        crate::fatal("unavailable in lean VM");
    }

    /// Name of the variable at `index` in the scope at `depth` (0 = this
    /// code block's own scope).
    #[cfg(not(feature = "lean"))]
    pub fn get_variable_name_at_depth(&self, depth: u32, index: u32) -> Option<String> {
        let stream = self.header.get().debug_lexical_data_offset?;
        self.module()
            .provider()
            .debug_info()?
            .lexical_variable_name(stream, depth, index)
    }

    #[cfg(feature = "lean")]
    pub fn get_variable_name_at_depth(&self, _depth: u32, _index: u32) -> Option<String> {
        crate::fatal("unavailable in lean VM");
    }

    // ---- inline property cache ----

    pub fn property_cache_size(&self) -> u32 {
        self.property_cache_size
    }

    pub fn write_prop_cache_offset(&self) -> u32 {
        self.write_prop_cache_offset
    }

    /// Entry `idx` of the read cache segment.
    pub fn get_read_cache_entry(&self, idx: u8) -> *mut PropertyCacheEntry {
        assert!((idx as u32) < self.write_prop_cache_offset, "idx out of read cache bound");
        unsafe { (*self.cache.get()).as_mut_ptr().add(idx as usize) }
    }

    /// Entry `idx` of the write cache segment, which follows the read
    /// segment in the same slab.
    pub fn get_write_cache_entry(&self, idx: u8) -> *mut PropertyCacheEntry {
        assert!(
            self.write_prop_cache_offset + (idx as u32) < self.property_cache_size,
            "idx out of write cache bound"
        );
        unsafe {
            (*self.cache.get())
                .as_mut_ptr()
                .add((self.write_prop_cache_offset + idx as u32) as usize)
        }
    }

    /// Base of the read cache segment, for the JIT's RO data pool.
    pub fn read_cache_base(&self) -> *mut PropertyCacheEntry {
        unsafe { (*self.cache.get()).as_mut_ptr() }
    }

    /// Base of the write cache segment.
    pub fn write_cache_base(&self) -> *mut PropertyCacheEntry {
        unsafe {
            (*self.cache.get())
                .as_mut_ptr()
                .add(self.write_prop_cache_offset as usize)
        }
    }

    /// Pass the hidden-class field of every non-empty cache entry to the
    /// weak-root acceptor. Each entry is visited at most once per cycle.
    pub fn mark_cached_hidden_classes(
        &self,
        _runtime: &Runtime,
        acceptor: &mut dyn WeakRootAcceptor,
    ) {
        let cache = unsafe { &mut *self.cache.get() };
        for entry in cache.iter_mut() {
            if entry.class != 0 {
                acceptor.accept_weak_hidden_class(&mut entry.class);
            }
        }
    }

    // ---- JIT state ----

    #[cfg(feature = "jit")]
    pub fn jit_entry(&self) -> Option<*const u8> {
        let entry = self.jit_entry.get();
        if entry.is_null() {
            None
        } else {
            Some(entry)
        }
    }

    #[cfg(feature = "jit")]
    pub fn set_jit_entry(&self, entry: *const u8) {
        self.jit_entry.set(entry);
    }

    /// Whether a previous JIT attempt failed for this function.
    #[cfg(feature = "jit")]
    pub fn jit_blocked(&self) -> bool {
        self.jit_blocked.get()
    }

    #[cfg(feature = "jit")]
    pub fn set_jit_blocked(&self) {
        self.jit_blocked.set(true);
    }

    /// Count one invocation; returns the new count.
    #[cfg(feature = "jit")]
    pub fn bump_exec_count(&self) -> u32 {
        let count = self.exec_count.get().saturating_add(1);
        self.exec_count.set(count);
        count
    }

    // ---- debugger ----

    /// Replace the opcode at `offset` with `Debugger` and bump the module
    /// user count. The caller must have registered a breakpoint record so
    /// the original opcode is recoverable.
    #[cfg(feature = "debugger")]
    pub fn install_breakpoint_at_offset(&self, offset: u32) {
        debug_assert!(offset < self.header.get().bytecode_size, "offset out of bounds");
        unsafe {
            let ptr = self.begin().add(offset as usize) as *mut u8;
            *ptr = OpCode::Debugger as u8;
        }
        self.module().add_user();
    }

    /// Restore `op_code` at `offset` and decrement the module user count.
    /// Requires the opcode at `offset` to currently be `Debugger`.
    #[cfg(feature = "debugger")]
    pub fn uninstall_breakpoint_at_offset(&self, offset: u32, op_code: u8) {
        unsafe {
            let ptr = self.begin().add(offset as usize) as *mut u8;
            debug_assert!(*ptr == OpCode::Debugger as u8, "no breakpoint installed");
            *ptr = op_code;
        }
        self.module().remove_user();
    }

    /// Offset of the instruction following the one at `offset`.
    #[cfg(feature = "debugger")]
    pub fn get_next_offset(&self, offset: u32) -> u32 {
        let op = OpCode::from_u8(unsafe { *self.get_offset_ptr(offset) })
            .unwrap_or(OpCode::Debugger);
        offset + op.inst_length() as u32
    }
}
