//! The runtime context: heap cells, hidden classes, interned strings and
//! the thrown-exception slot.
//!
//! One `Runtime` is single-threaded; several may coexist in a process with
//! independent heaps. Helper functions called from JIT code receive a
//! `*mut Runtime` as their first argument and report exceptions by storing
//! the thrown value here and returning `JsValue::EMPTY`.

use super::bytecode::BytecodeProvider;
use super::runtime_module::RuntimeModule;
use super::value::JsValue;
use crate::config::RuntimeConfig;
use std::collections::HashMap;

/// Result of executing or compiling a function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Returned,
    Exception,
}

/// Hook into the external interpreter: executes `CodeBlock` on `frame`
/// and returns the result, or EMPTY with the exception thrown into the
/// runtime.
pub type InterpreterFn =
    fn(&mut Runtime, *mut super::code_block::CodeBlock, *mut JsValue) -> JsValue;

/// Identifier of an object shape. Zero is reserved for "empty" in the
/// inline property caches.
pub type HiddenClassId = u32;

/// Identifier of an interned property name.
pub type SymbolId = u32;

/// Owning domain of a runtime module, used by closure construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Domain(pub u32);

/// Discriminates heap cells. Stored in the common cell header.
pub const CELL_PLAIN: u32 = 0;
pub const CELL_CLOSURE: u32 = 1;
pub const CELL_ENVIRONMENT: u32 = 2;

/// A heap cell. The leading fields form the fixed header the JIT fast
/// paths address directly: the hidden class at offset 0 and the property
/// slot base pointer at offset 8.
#[repr(C)]
pub struct JsObject {
    /// Shape of the object; compared by the inline-cache fast path.
    pub hidden_class: HiddenClassId,
    kind: u32,
    /// Raw pointer into `storage`, kept in sync on every reallocation.
    slots_ptr: *mut JsValue,
    storage: Box<[JsValue]>,
    /// Closure: the function within its module. Unused for other kinds.
    pub module_index: u32,
    pub function_id: u32,
    /// Closure: captured environment. Environment: parent environment.
    pub linked_env: JsValue,
}

/// Offset of `hidden_class` within a cell, used by the JIT.
pub const OBJECT_CLASS_OFFSET: u32 = 0;
/// Offset of the slot base pointer within a cell, used by the JIT.
pub const OBJECT_SLOTS_OFFSET: u32 = 8;

impl JsObject {
    fn new(kind: u32, hidden_class: HiddenClassId, slot_count: usize) -> Box<JsObject> {
        let storage = vec![JsValue::UNDEFINED; slot_count].into_boxed_slice();
        let mut cell = Box::new(JsObject {
            hidden_class,
            kind,
            slots_ptr: std::ptr::null_mut(),
            storage,
            module_index: 0,
            function_id: 0,
            linked_env: JsValue::UNDEFINED,
        });
        cell.slots_ptr = cell.storage.as_mut_ptr();
        cell
    }

    pub fn kind(&self) -> u32 {
        self.kind
    }

    pub fn slot(&self, index: u32) -> JsValue {
        self.storage[index as usize]
    }

    pub fn set_slot(&mut self, index: u32, value: JsValue) {
        self.storage[index as usize] = value;
    }

    pub fn slot_count(&self) -> u32 {
        self.storage.len() as u32
    }

    /// Grow the slot storage to hold at least `count` slots.
    pub fn ensure_slots(&mut self, count: usize) {
        if self.storage.len() >= count {
            return;
        }
        let mut grown = vec![JsValue::UNDEFINED; count].into_boxed_slice();
        grown[..self.storage.len()].copy_from_slice(&self.storage);
        self.storage = grown;
        self.slots_ptr = self.storage.as_mut_ptr();
    }
}

/// One shape in the hidden-class table.
struct HiddenClass {
    /// Property name to slot index.
    properties: HashMap<SymbolId, u32>,
    /// Shape reached by adding one property.
    transitions: HashMap<SymbolId, HiddenClassId>,
    /// Cleared when the GC reclaims the shape; weak cache entries pointing
    /// here are wiped on the next root marking.
    alive: bool,
}

/// Table of object shapes. Class 0 is reserved (the empty cache marker).
pub struct HiddenClassTable {
    classes: Vec<HiddenClass>,
}

impl HiddenClassTable {
    fn new() -> Self {
        let mut table = HiddenClassTable { classes: Vec::new() };
        // Slot 0: reserved. Slot 1: the root class of empty objects.
        table.classes.push(HiddenClass {
            properties: HashMap::new(),
            transitions: HashMap::new(),
            alive: false,
        });
        table.classes.push(HiddenClass {
            properties: HashMap::new(),
            transitions: HashMap::new(),
            alive: true,
        });
        table
    }

    pub fn root_class(&self) -> HiddenClassId {
        1
    }

    pub fn lookup_property(&self, class: HiddenClassId, sym: SymbolId) -> Option<u32> {
        self.classes[class as usize].properties.get(&sym).copied()
    }

    /// Shape transition for adding `sym`. Returns the new class and the
    /// slot index of the property.
    pub fn add_property(&mut self, class: HiddenClassId, sym: SymbolId) -> (HiddenClassId, u32) {
        if let Some(next) = self.classes[class as usize].transitions.get(&sym) {
            let next = *next;
            let slot = self.classes[next as usize].properties[&sym];
            return (next, slot);
        }
        let slot = self.classes[class as usize].properties.len() as u32;
        let mut properties = self.classes[class as usize].properties.clone();
        properties.insert(sym, slot);
        let next = self.classes.len() as HiddenClassId;
        self.classes.push(HiddenClass {
            properties,
            transitions: HashMap::new(),
            alive: true,
        });
        self.classes[class as usize].transitions.insert(sym, next);
        (next, slot)
    }

    pub fn is_alive(&self, class: HiddenClassId) -> bool {
        self.classes
            .get(class as usize)
            .map(|c| c.alive)
            .unwrap_or(false)
    }

    /// Testing/GC hook: mark a shape as reclaimed.
    pub fn reclaim(&mut self, class: HiddenClassId) {
        self.classes[class as usize].alive = false;
    }
}

/// Visitor for weak references held by the property caches. The GC passes
/// an implementation to `CodeBlock::mark_cached_hidden_classes`; a class
/// that was reclaimed is cleared to the empty marker.
pub trait WeakRootAcceptor {
    fn accept_weak_hidden_class(&mut self, class: &mut HiddenClassId);
}

/// The standard acceptor: wipes entries whose hidden class is gone.
pub struct WeakRootClearer<'a> {
    pub table: &'a HiddenClassTable,
    /// Number of weak slots visited, for GC accounting.
    pub visited: usize,
}

impl<'a> WeakRootClearer<'a> {
    pub fn new(table: &'a HiddenClassTable) -> Self {
        WeakRootClearer { table, visited: 0 }
    }
}

impl WeakRootAcceptor for WeakRootClearer<'_> {
    fn accept_weak_hidden_class(&mut self, class: &mut HiddenClassId) {
        self.visited += 1;
        if !self.table.is_alive(*class) {
            *class = 0;
        }
    }
}

/// Interned runtime strings. Module string tables are copied in here on
/// first use so every string value references one arena.
#[derive(Default)]
pub struct StringArena {
    strings: Vec<String>,
    interned: HashMap<String, u32>,
}

impl StringArena {
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(id) = self.interned.get(s) {
            return *id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.interned.insert(s.to_string(), id);
        id
    }

    pub fn get(&self, id: u32) -> &str {
        &self.strings[id as usize]
    }
}

/// The runtime context threaded through every engine operation.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub strings: StringArena,
    pub hidden_classes: HiddenClassTable,
    /// Interned property names.
    symbols: StringArena,
    heap: Vec<Box<JsObject>>,
    /// Loaded bytecode modules. Boxed so module addresses stay stable.
    modules: Vec<Box<RuntimeModule>>,
    /// The external interpreter, when one is attached.
    pub interpreter: Option<InterpreterFn>,
    domains: u32,
    global_object: JsValue,
    /// The pending exception; EMPTY when none.
    thrown: JsValue,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Box<Runtime> {
        let mut runtime = Box::new(Runtime {
            config,
            strings: StringArena::default(),
            hidden_classes: HiddenClassTable::new(),
            symbols: StringArena::default(),
            heap: Vec::new(),
            modules: Vec::new(),
            interpreter: None,
            domains: 0,
            global_object: JsValue::UNDEFINED,
            thrown: JsValue::EMPTY,
        });
        let root = runtime.hidden_classes.root_class();
        runtime.global_object = runtime.alloc_cell(CELL_PLAIN, root, 0);
        runtime
    }

    pub fn create_domain(&mut self) -> Domain {
        self.domains += 1;
        Domain(self.domains - 1)
    }

    /// Load a bytecode module into a fresh domain. Returns its index.
    pub fn add_module(&mut self, provider: Box<dyn BytecodeProvider>) -> u32 {
        let domain = self.create_domain();
        let index = self.modules.len() as u32;
        self.modules.push(RuntimeModule::new(index, domain, provider));
        index
    }

    pub fn module(&self, index: u32) -> &RuntimeModule {
        &self.modules[index as usize]
    }

    pub fn module_mut(&mut self, index: u32) -> &mut RuntimeModule {
        &mut self.modules[index as usize]
    }

    /// Stable pointer to a module, for helpers called from JIT code.
    pub fn module_ptr(&mut self, index: u32) -> *mut RuntimeModule {
        &mut *self.modules[index as usize] as *mut RuntimeModule
    }

    /// GC root marking: traverse the property caches of every reachable
    /// code block as weak roots.
    pub fn mark_weak_roots(&self, acceptor: &mut dyn WeakRootAcceptor) {
        for module in &self.modules {
            for block in module.code_blocks() {
                block.mark_cached_hidden_classes(self, acceptor);
            }
        }
    }

    pub fn global_object(&self) -> JsValue {
        self.global_object
    }

    fn alloc_cell(&mut self, kind: u32, class: HiddenClassId, slots: usize) -> JsValue {
        let mut cell = JsObject::new(kind, class, slots);
        let ptr = &mut *cell as *mut JsObject;
        self.heap.push(cell);
        debug_assert!((ptr as u64) < (1 << 48), "heap pointer exceeds payload");
        JsValue::encode_object(0).with_pointer(ptr)
    }

    pub fn alloc_object(&mut self) -> JsValue {
        let root = self.hidden_classes.root_class();
        self.alloc_cell(CELL_PLAIN, root, 0)
    }

    pub fn alloc_closure(&mut self, module_index: u32, function_id: u32, env: JsValue) -> JsValue {
        let root = self.hidden_classes.root_class();
        let value = self.alloc_cell(CELL_CLOSURE, root, 0);
        let cell = unsafe { &mut *value.object_pointer() };
        cell.module_index = module_index;
        cell.function_id = function_id;
        cell.linked_env = env;
        value
    }

    pub fn alloc_environment(&mut self, parent: JsValue, size: u32) -> JsValue {
        let root = self.hidden_classes.root_class();
        let value = self.alloc_cell(CELL_ENVIRONMENT, root, size as usize);
        let cell = unsafe { &mut *value.object_pointer() };
        cell.linked_env = parent;
        value
    }

    pub fn intern_symbol(&mut self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }

    pub fn symbol_name(&self, sym: SymbolId) -> &str {
        self.symbols.get(sym)
    }

    /// Record a thrown value. Execution unwinds through the exception
    /// tables of the live code blocks.
    pub fn throw(&mut self, value: JsValue) {
        self.thrown = value;
    }

    /// Raise a TypeError carrying `message` and return the helper error
    /// sentinel.
    pub fn throw_type_error(&mut self, message: &str) -> JsValue {
        let id = self.strings.intern(message);
        self.thrown = JsValue::encode_string(id);
        JsValue::EMPTY
    }

    pub fn has_thrown(&self) -> bool {
        !self.thrown.is_empty()
    }

    pub fn thrown_value(&self) -> JsValue {
        self.thrown
    }

    pub fn clear_thrown(&mut self) -> JsValue {
        std::mem::replace(&mut self.thrown, JsValue::EMPTY)
    }
}

impl JsValue {
    /// Box a raw heap cell pointer. The pointer must stay valid for the
    /// lifetime of the owning runtime.
    fn with_pointer(self, ptr: *mut JsObject) -> JsValue {
        debug_assert!(self.is_object());
        JsValue::from_raw((self.raw() & !((1u64 << 48) - 1)) | ptr as u64)
    }

    /// The heap cell behind an object reference.
    pub fn object_pointer(self) -> *mut JsObject {
        debug_assert!(self.is_object());
        (self.raw() & ((1u64 << 48) - 1)) as *mut JsObject
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Box<Runtime> {
        Runtime::new(RuntimeConfig::default())
    }

    #[test]
    fn test_cell_header_offsets() {
        // The JIT addresses these two fields directly.
        let mut cell = JsObject::new(CELL_PLAIN, 1, 2);
        let base = &*cell as *const JsObject as usize;
        let class_addr = &cell.hidden_class as *const _ as usize;
        let slots_addr = &cell.slots_ptr as *const _ as usize;
        assert_eq!(class_addr - base, OBJECT_CLASS_OFFSET as usize);
        assert_eq!(slots_addr - base, OBJECT_SLOTS_OFFSET as usize);
        cell.ensure_slots(4);
        assert_eq!(cell.slots_ptr, cell.storage.as_mut_ptr());
    }

    #[test]
    fn test_hidden_class_transitions_are_shared() {
        let mut rt = runtime();
        let x = rt.intern_symbol("x");
        let root = rt.hidden_classes.root_class();
        let (c1, s1) = rt.hidden_classes.add_property(root, x);
        let (c2, s2) = rt.hidden_classes.add_property(root, x);
        assert_eq!(c1, c2);
        assert_eq!(s1, s2);
        assert_eq!(s1, 0);
    }

    #[test]
    fn test_weak_root_clearer() {
        let mut rt = runtime();
        let x = rt.intern_symbol("x");
        let root = rt.hidden_classes.root_class();
        let (class, _) = rt.hidden_classes.add_property(root, x);

        let mut live = class;
        let mut clearer = WeakRootClearer::new(&rt.hidden_classes);
        clearer.accept_weak_hidden_class(&mut live);
        assert_eq!(live, class);

        rt.hidden_classes.reclaim(class);
        let mut clearer = WeakRootClearer::new(&rt.hidden_classes);
        clearer.accept_weak_hidden_class(&mut live);
        assert_eq!(live, 0);
        assert_eq!(clearer.visited, 1);
    }

    #[test]
    fn test_closure_cell() {
        let mut rt = runtime();
        let env = rt.alloc_environment(JsValue::UNDEFINED, 2);
        let closure = rt.alloc_closure(0, 3, env);
        let cell = unsafe { &*closure.object_pointer() };
        assert_eq!(cell.kind(), CELL_CLOSURE);
        assert_eq!(cell.function_id, 3);
        assert_eq!(cell.linked_env, env);
    }

    #[test]
    fn test_thrown_slot() {
        let mut rt = runtime();
        assert!(!rt.has_thrown());
        let sentinel = rt.throw_type_error("not a function");
        assert!(sentinel.is_empty());
        assert!(rt.has_thrown());
        let value = rt.clear_thrown();
        assert!(value.is_string());
        assert!(!rt.has_thrown());
    }
}
