//! Template JIT for bytecode functions.
//!
//! The driver walks the opcode bytes of one code block and feeds the
//! emitter, which produces AArch64 machine code: fast paths inline, slow
//! paths at the function tail, thunks and RO data after that. Emission is
//! target-independent; executing the result requires aarch64.

pub mod aarch64;
pub mod codebuf;
pub mod emitter;
pub mod frame;
pub mod helpers;
pub mod memory;
pub mod regalloc;

use crate::vm::bytecode::OpCode;
use crate::vm::code_block::CodeBlock;
use crate::vm::{JsValue, Runtime};
use emitter::Emitter;
use frame::{FRType, FR};
use memory::{ExecutableMemory, MemoryError};
use std::collections::HashMap;

/// Error type for JIT compilation. A failure affects only the function
/// being compiled; it falls back to the interpreter.
#[derive(Debug)]
pub enum JitError {
    /// A branch could not be encoded or a label never got bound.
    Assembler(String),
    Memory(MemoryError),
    /// The function uses an opcode the JIT does not support.
    UnsupportedInstruction(u8),
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::Assembler(msg) => write!(f, "assembler error: {}", msg),
            JitError::Memory(e) => write!(f, "memory error: {}", e),
            JitError::UnsupportedInstruction(op) => {
                write!(f, "unsupported instruction for JIT: {}", op)
            }
        }
    }
}

impl std::error::Error for JitError {}

/// A function compiled to native code. Owns its executable memory; the
/// entry pointer stays valid until this is dropped.
pub struct JitCompiledFunction {
    pub(crate) memory: ExecutableMemory,
    pub(crate) entry_offset: usize,
}

impl JitCompiledFunction {
    pub fn entry_ptr(&self) -> *const u8 {
        self.memory.entry_ptr(self.entry_offset)
    }

    /// The emitted bytes (code, slow paths, thunks and RO data).
    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.memory.as_ptr(), self.memory.code_len()) }
    }

    /// Run the compiled function.
    ///
    /// # Safety
    /// `runtime` and `frame` must be valid, with the frame header slots
    /// populated by the caller.
    #[cfg(target_arch = "aarch64")]
    pub unsafe fn invoke(&self, runtime: *mut Runtime, frame: *mut JsValue) -> JsValue {
        let f: helpers::JitFn = unsafe { std::mem::transmute(self.entry_ptr()) };
        unsafe { f(runtime, frame) }
    }
}

/// What the pre-pass learned about a frame register's writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegKind {
    Unused,
    Number,
    NonPointer,
    Other,
}

/// Decoded operands, little-endian.
fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn f64_at(bytes: &[u8], at: usize) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    f64::from_bits(u64::from_le_bytes(buf))
}

/// Pre-pass over the bytecode: collect branch targets and classify each
/// frame register by the values written to it. The leading run of
/// number-only registers gets the VecD callee-saved window, the following
/// run of non-pointer registers the GP one.
fn prepass(bytes: &[u8], frame_size: u32) -> Result<(Vec<u32>, u32, u32), JitError> {
    let mut targets = Vec::new();
    let mut kinds = vec![RegKind::Unused; frame_size as usize];
    let mut merge = |kinds: &mut Vec<RegKind>, reg: u8, kind: RegKind| {
        let slot = &mut kinds[reg as usize];
        *slot = match (*slot, kind) {
            (RegKind::Unused, k) => k,
            (k, n) if k == n => k,
            _ => RegKind::Other,
        };
    };
    let mut off = 0usize;
    while off < bytes.len() {
        let op = OpCode::from_u8(bytes[off]).ok_or(JitError::UnsupportedInstruction(bytes[off]))?;
        use OpCode::*;
        match op {
            Jmp | JGreater | JGreaterEqual | JNotGreater | JNotGreaterEqual | JGreaterN
            | JGreaterEqualN | JNotGreaterN | JNotGreaterEqualN => {
                let rel = i16::from_le_bytes([bytes[off + 1], bytes[off + 2]]) as i64;
                targets.push((off as i64 + rel) as u32);
            }
            LoadConstDouble | Add | Sub | Mul | AddN | SubN | MulN | Inc | Dec | ToNumber => {
                merge(&mut kinds, bytes[off + 1], RegKind::Number);
            }
            LoadConstUndefined | LoadConstTrue | LoadConstFalse | LoadConstNull => {
                merge(&mut kinds, bytes[off + 1], RegKind::NonPointer);
            }
            Mov | LoadParam | LoadConstString | GetById | TryGetById | GetByVal | GetByIndex
            | Call | GetGlobalObject | CreateTopLevelEnvironment | GetParentEnvironment
            | LoadFromEnvironment | CreateClosure => {
                merge(&mut kinds, bytes[off + 1], RegKind::Other);
            }
            Ret | PutByIdLoose | PutByIdStrict | TryPutByIdLoose | TryPutByIdStrict
            | PutByValLoose | PutByValStrict | DeclareGlobalVar | StoreToEnvironment
            | StoreNPToEnvironment | Debugger => {}
        }
        off += op.inst_length();
    }
    let num_count = kinds
        .iter()
        .take_while(|k| **k == RegKind::Number)
        .count() as u32;
    let np_count = kinds
        .iter()
        .skip(num_count as usize)
        .take_while(|k| **k == RegKind::NonPointer)
        .count() as u32;
    Ok((targets, num_count, np_count))
}

/// Compile one (non-lazy) code block to native code.
pub fn compile_code_block(
    block: &CodeBlock,
    module_index: u32,
    config: &crate::config::RuntimeConfig,
) -> Result<JitCompiledFunction, JitError> {
    debug_assert!(!block.is_lazy(), "cannot JIT a lazy function");
    let bytes = block.get_opcode_array();
    let frame_size = block.get_frame_size();
    let (targets, num_count, np_count) = prepass(bytes, frame_size)?;

    let mut em = Emitter::new(
        config.dump_jit_code,
        block.read_cache_base(),
        block.write_cache_base(),
        frame_size,
        num_count,
        np_count,
        module_index,
    );
    if config.trace_calls {
        em.trace_function_entry_exit(&block.get_name_string());
    }

    let mut labels: HashMap<u32, codebuf::Label> = HashMap::new();
    for target in targets {
        labels.entry(target).or_insert_with(|| em.new_label());
    }

    let fr = FR::new;
    let strict = block.is_strict_mode();
    let mut off = 0usize;
    while off < bytes.len() {
        if let Some(label) = labels.get(&(off as u32)) {
            em.new_basic_block(*label);
        }
        let op = OpCode::from_u8(bytes[off]).ok_or(JitError::UnsupportedInstruction(bytes[off]))?;
        let branch_target = |labels: &HashMap<u32, codebuf::Label>| {
            let rel = i16::from_le_bytes([bytes[off + 1], bytes[off + 2]]) as i64;
            labels[&((off as i64 + rel) as u32)]
        };
        use OpCode::*;
        match op {
            Ret => em.ret(fr(bytes[off + 1] as u32)),
            Mov => em.mov(fr(bytes[off + 1] as u32), fr(bytes[off + 2] as u32)),
            LoadParam => em.load_param(fr(bytes[off + 1] as u32), bytes[off + 2] as u32),
            LoadConstDouble => em.load_const_double(
                fr(bytes[off + 1] as u32),
                f64_at(bytes, off + 2),
                "loadConstDouble",
            ),
            LoadConstUndefined => em.load_const_bits64(
                fr(bytes[off + 1] as u32),
                JsValue::UNDEFINED.raw(),
                FRType::UNKNOWN,
                "loadConstUndefined",
            ),
            LoadConstTrue => em.load_const_bits64(
                fr(bytes[off + 1] as u32),
                JsValue::TRUE.raw(),
                FRType::BOOL,
                "loadConstTrue",
            ),
            LoadConstFalse => em.load_const_bits64(
                fr(bytes[off + 1] as u32),
                JsValue::FALSE.raw(),
                FRType::BOOL,
                "loadConstFalse",
            ),
            LoadConstNull => em.load_const_bits64(
                fr(bytes[off + 1] as u32),
                JsValue::NULL.raw(),
                FRType::UNKNOWN,
                "loadConstNull",
            ),
            LoadConstString => {
                em.load_const_string(fr(bytes[off + 1] as u32), u32_at(bytes, off + 2))
            }

            Add => em.add(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                fr(bytes[off + 3] as u32),
            ),
            Sub => em.sub(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                fr(bytes[off + 3] as u32),
            ),
            Mul => em.mul(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                fr(bytes[off + 3] as u32),
            ),
            AddN => em.add_n(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                fr(bytes[off + 3] as u32),
            ),
            SubN => em.sub_n(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                fr(bytes[off + 3] as u32),
            ),
            MulN => em.mul_n(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                fr(bytes[off + 3] as u32),
            ),
            Inc => em.inc(fr(bytes[off + 1] as u32), fr(bytes[off + 2] as u32)),
            Dec => em.dec(fr(bytes[off + 1] as u32), fr(bytes[off + 2] as u32)),
            ToNumber => em.to_number(fr(bytes[off + 1] as u32), fr(bytes[off + 2] as u32)),

            Jmp => {
                let target = branch_target(&labels);
                em.jmp(target);
            }
            JGreater | JNotGreater | JGreaterN | JNotGreaterN => {
                let target = branch_target(&labels);
                let invert = matches!(op, JNotGreater | JNotGreaterN);
                let left = fr(bytes[off + 3] as u32);
                let right = fr(bytes[off + 4] as u32);
                if matches!(op, JGreaterN | JNotGreaterN) {
                    em.jgreater_n(invert, target, left, right);
                } else {
                    em.jgreater(invert, target, left, right);
                }
            }
            JGreaterEqual | JNotGreaterEqual | JGreaterEqualN | JNotGreaterEqualN => {
                let target = branch_target(&labels);
                let invert = matches!(op, JNotGreaterEqual | JNotGreaterEqualN);
                let left = fr(bytes[off + 3] as u32);
                let right = fr(bytes[off + 4] as u32);
                if matches!(op, JGreaterEqualN | JNotGreaterEqualN) {
                    em.jgreater_equal_n(invert, target, left, right);
                } else {
                    em.jgreater_equal(invert, target, left, right);
                }
            }

            GetById => em.get_by_id(
                fr(bytes[off + 1] as u32),
                u32_at(bytes, off + 3),
                fr(bytes[off + 2] as u32),
                bytes[off + 7],
            ),
            TryGetById => em.try_get_by_id(
                fr(bytes[off + 1] as u32),
                u32_at(bytes, off + 3),
                fr(bytes[off + 2] as u32),
                bytes[off + 7],
            ),
            PutByIdLoose | PutByIdStrict => {
                let target_fr = fr(bytes[off + 1] as u32);
                let sym = u32_at(bytes, off + 2);
                let value = fr(bytes[off + 6] as u32);
                let cache = bytes[off + 7];
                if matches!(op, PutByIdStrict) || strict {
                    em.put_by_id_strict(target_fr, sym, value, cache);
                } else {
                    em.put_by_id_loose(target_fr, sym, value, cache);
                }
            }
            TryPutByIdLoose | TryPutByIdStrict => {
                let target_fr = fr(bytes[off + 1] as u32);
                let sym = u32_at(bytes, off + 2);
                let value = fr(bytes[off + 6] as u32);
                let cache = bytes[off + 7];
                if matches!(op, TryPutByIdStrict) || strict {
                    em.try_put_by_id_strict(target_fr, sym, value, cache);
                } else {
                    em.try_put_by_id_loose(target_fr, sym, value, cache);
                }
            }
            GetByVal => em.get_by_val(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                fr(bytes[off + 3] as u32),
            ),
            PutByValLoose => em.put_by_val_loose(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                fr(bytes[off + 3] as u32),
            ),
            PutByValStrict => em.put_by_val_strict(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                fr(bytes[off + 3] as u32),
            ),
            GetByIndex => em.get_by_index(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                bytes[off + 3],
            ),

            Call => em.call(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                bytes[off + 3] as u32,
            ),

            GetGlobalObject => em.get_global_object(fr(bytes[off + 1] as u32)),
            DeclareGlobalVar => em.declare_global_var(u32_at(bytes, off + 1)),
            CreateTopLevelEnvironment => {
                em.create_top_level_environment(fr(bytes[off + 1] as u32), u32_at(bytes, off + 2))
            }
            GetParentEnvironment => {
                em.get_parent_environment(fr(bytes[off + 1] as u32), bytes[off + 2] as u32)
            }
            LoadFromEnvironment => em.load_from_environment(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                bytes[off + 3] as u32,
            ),
            StoreToEnvironment => em.store_to_environment(
                false,
                fr(bytes[off + 1] as u32),
                bytes[off + 2] as u32,
                fr(bytes[off + 3] as u32),
            ),
            StoreNPToEnvironment => em.store_to_environment(
                true,
                fr(bytes[off + 1] as u32),
                bytes[off + 2] as u32,
                fr(bytes[off + 3] as u32),
            ),
            CreateClosure => em.create_closure(
                fr(bytes[off + 1] as u32),
                fr(bytes[off + 2] as u32),
                u32_at(bytes, off + 3),
            ),

            // Functions with installed breakpoints stay on the
            // interpreter.
            Debugger => return Err(JitError::UnsupportedInstruction(op as u8)),
        }
        off += op.inst_length();
    }

    em.add_to_runtime()
}

/// Owns the native code of one runtime's JIT-compiled functions and the
/// per-function compile/fallback policy.
#[derive(Default)]
pub struct JitContext {
    compiled: Vec<JitCompiledFunction>,
}

impl JitContext {
    pub fn new() -> JitContext {
        JitContext::default()
    }

    /// Compile `function_id` of `module_index` and install the entry on
    /// its code block. On failure the function is marked as
    /// not-JIT-compiled and stays on the interpreter; other functions are
    /// unaffected.
    pub fn compile_function(
        &mut self,
        runtime: &mut Runtime,
        module_index: u32,
        function_id: u32,
    ) -> Result<*const u8, JitError> {
        let trace_jit = runtime.config.trace_jit;
        let config = runtime.config.clone();
        let block = match runtime
            .module_mut(module_index)
            .get_code_block_may_allocate(function_id)
        {
            Ok(block) => block,
            Err(e) => return Err(JitError::Assembler(e.to_string())),
        };
        let block = unsafe { &*block };
        match compile_code_block(block, module_index, &config) {
            Ok(compiled) => {
                let entry = compiled.entry_ptr();
                block.set_jit_entry(entry);
                self.compiled.push(compiled);
                if trace_jit {
                    eprintln!(
                        "[JIT] compiled '{}' ({} bytes)",
                        block.get_name_string(),
                        self.compiled.last().map(|c| c.code().len()).unwrap_or(0)
                    );
                }
                Ok(entry)
            }
            Err(e) => {
                block.set_jit_blocked();
                if trace_jit {
                    eprintln!("[JIT] failed to compile '{}': {}", block.get_name_string(), e);
                }
                Err(e)
            }
        }
    }

    pub fn compiled_count(&self) -> usize {
        self.compiled.len()
    }
}
