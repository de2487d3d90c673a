//! Runtime helpers called from JIT code.
//!
//! Every helper is `extern "C"`, takes the runtime first and frame-slot
//! pointers for JS operands, and reports a raised exception by storing the
//! thrown value into the runtime and returning `JsValue::EMPTY` (helpers
//! that produce no value return EMPTY on error and UNDEFINED otherwise).
//! The emitter polls for the sentinel after every fallible call.

use crate::vm::code_block::PropertyCacheEntry;
use crate::vm::runtime::{Runtime, CELL_CLOSURE};
use crate::vm::JsValue;

/// Header slots below a frame base: [... args | callee | newTarget | argc].
pub const FRAME_HEADER_SLOTS: u32 = 3;
/// Byte offsets relative to the frame base.
pub const FRAME_OFS_ARGC: i32 = -8;
pub const FRAME_OFS_NEW_TARGET: i32 = -16;
pub const FRAME_OFS_CALLEE: i32 = -24;

/// Signature of a JIT-compiled function: runtime, frame base.
pub type JitFn = unsafe extern "C" fn(*mut Runtime, *mut JsValue) -> JsValue;

// ---- conversions ----

/// JS ToNumber, restricted to the primitive types the engine models.
fn to_number(rt: &Runtime, v: JsValue) -> f64 {
    if v.is_double() {
        v.as_f64()
    } else if v.is_bool() {
        if v.as_bool() {
            1.0
        } else {
            0.0
        }
    } else if v.is_null() {
        0.0
    } else if v.is_string() {
        let s = rt.strings.get(v.string_index()).trim();
        if s.is_empty() {
            0.0
        } else {
            s.parse::<f64>().unwrap_or(f64::NAN)
        }
    } else {
        // undefined and objects (no valueOf here)
        f64::NAN
    }
}

/// JS ToString for primitives.
fn to_string(rt: &Runtime, v: JsValue) -> String {
    if v.is_double() {
        format_number(v.as_f64())
    } else if v.is_bool() {
        if v.as_bool() { "true" } else { "false" }.to_string()
    } else if v.is_undefined() {
        "undefined".to_string()
    } else if v.is_null() {
        "null".to_string()
    } else if v.is_string() {
        rt.strings.get(v.string_index()).to_string()
    } else {
        "[object Object]".to_string()
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

// ---- arithmetic ----

/// JS addition: string concatenation when either side is a string,
/// numeric addition otherwise.
///
/// # Safety
/// All pointers must be valid; `rt` must be the owning runtime.
pub unsafe extern "C" fn sh_ljs_add_rjs(
    rt: *mut Runtime,
    a: *mut JsValue,
    b: *mut JsValue,
) -> JsValue {
    let rt = unsafe { &mut *rt };
    let (a, b) = unsafe { (*a, *b) };
    if a.is_string() || b.is_string() {
        let s = format!("{}{}", to_string(rt, a), to_string(rt, b));
        let id = rt.strings.intern(&s);
        return JsValue::encode_string(id);
    }
    JsValue::encode_f64(to_number(rt, a) + to_number(rt, b))
}

/// # Safety
/// All pointers must be valid; `rt` must be the owning runtime.
pub unsafe extern "C" fn sh_ljs_sub_rjs(
    rt: *mut Runtime,
    a: *mut JsValue,
    b: *mut JsValue,
) -> JsValue {
    let rt = unsafe { &mut *rt };
    let (a, b) = unsafe { (*a, *b) };
    JsValue::encode_f64(to_number(rt, a) - to_number(rt, b))
}

/// # Safety
/// All pointers must be valid; `rt` must be the owning runtime.
pub unsafe extern "C" fn sh_ljs_mul_rjs(
    rt: *mut Runtime,
    a: *mut JsValue,
    b: *mut JsValue,
) -> JsValue {
    let rt = unsafe { &mut *rt };
    let (a, b) = unsafe { (*a, *b) };
    JsValue::encode_f64(to_number(rt, a) * to_number(rt, b))
}

/// # Safety
/// All pointers must be valid; `rt` must be the owning runtime.
pub unsafe extern "C" fn sh_ljs_inc_rjs(rt: *mut Runtime, a: *mut JsValue) -> JsValue {
    let rt = unsafe { &mut *rt };
    let a = unsafe { *a };
    JsValue::encode_f64(to_number(rt, a) + 1.0)
}

/// # Safety
/// All pointers must be valid; `rt` must be the owning runtime.
pub unsafe extern "C" fn sh_ljs_dec_rjs(rt: *mut Runtime, a: *mut JsValue) -> JsValue {
    let rt = unsafe { &mut *rt };
    let a = unsafe { *a };
    JsValue::encode_f64(to_number(rt, a) - 1.0)
}

/// # Safety
/// All pointers must be valid; `rt` must be the owning runtime.
pub unsafe extern "C" fn sh_ljs_to_numeric_rjs(rt: *mut Runtime, a: *mut JsValue) -> JsValue {
    let rt = unsafe { &mut *rt };
    let a = unsafe { *a };
    JsValue::encode_f64(to_number(rt, a))
}

// ---- comparisons ----

fn js_greater(rt: &Runtime, a: JsValue, b: JsValue, or_equal: bool) -> bool {
    if a.is_string() && b.is_string() {
        let (sa, sb) = (rt.strings.get(a.string_index()), rt.strings.get(b.string_index()));
        return if or_equal { sa >= sb } else { sa > sb };
    }
    let (na, nb) = (to_number(rt, a), to_number(rt, b));
    if or_equal {
        na >= nb
    } else {
        na > nb
    }
}

/// # Safety
/// All pointers must be valid; `rt` must be the owning runtime.
pub unsafe extern "C" fn sh_ljs_greater_rjs(
    rt: *mut Runtime,
    a: *mut JsValue,
    b: *mut JsValue,
) -> JsValue {
    let rt = unsafe { &mut *rt };
    JsValue::encode_bool(js_greater(rt, unsafe { *a }, unsafe { *b }, false))
}

/// # Safety
/// All pointers must be valid; `rt` must be the owning runtime.
pub unsafe extern "C" fn sh_ljs_greater_equal_rjs(
    rt: *mut Runtime,
    a: *mut JsValue,
    b: *mut JsValue,
) -> JsValue {
    let rt = unsafe { &mut *rt };
    JsValue::encode_bool(js_greater(rt, unsafe { *a }, unsafe { *b }, true))
}

// ---- property access ----

fn get_by_id_impl(
    rt: &mut Runtime,
    source: JsValue,
    sym: u32,
    cache: *mut PropertyCacheEntry,
) -> JsValue {
    if !source.is_object() {
        return rt.throw_type_error("cannot read property of non-object");
    }
    let cell = unsafe { &*source.object_pointer() };
    match rt.hidden_classes.lookup_property(cell.hidden_class, sym) {
        Some(slot) => {
            // Update the monomorphic inline cache so the JIT fast path
            // hits next time.
            if !cache.is_null() {
                unsafe {
                    (*cache).class = cell.hidden_class;
                    (*cache).slot = slot;
                }
            }
            cell.slot(slot)
        }
        None => JsValue::UNDEFINED,
    }
}

/// # Safety
/// All pointers must be valid; `cache` may be null.
pub unsafe extern "C" fn sh_ljs_get_by_id_rjs(
    rt: *mut Runtime,
    source: *const JsValue,
    sym: u32,
    cache: *mut PropertyCacheEntry,
) -> JsValue {
    unsafe { get_by_id_impl(&mut *rt, *source, sym, cache) }
}

/// # Safety
/// All pointers must be valid; `cache` may be null.
pub unsafe extern "C" fn sh_ljs_try_get_by_id_rjs(
    rt: *mut Runtime,
    source: *const JsValue,
    sym: u32,
    cache: *mut PropertyCacheEntry,
) -> JsValue {
    unsafe { get_by_id_impl(&mut *rt, *source, sym, cache) }
}

fn put_by_id_impl(
    rt: &mut Runtime,
    target: JsValue,
    sym: u32,
    value: JsValue,
    cache: *mut PropertyCacheEntry,
) -> JsValue {
    if !target.is_object() {
        return rt.throw_type_error("cannot set property of non-object");
    }
    let cell = unsafe { &mut *target.object_pointer() };
    let slot = match rt.hidden_classes.lookup_property(cell.hidden_class, sym) {
        Some(slot) => slot,
        None => {
            let (next, slot) = rt.hidden_classes.add_property(cell.hidden_class, sym);
            cell.hidden_class = next;
            cell.ensure_slots(slot as usize + 1);
            slot
        }
    };
    cell.set_slot(slot, value);
    if !cache.is_null() {
        unsafe {
            (*cache).class = cell.hidden_class;
            (*cache).slot = slot;
        }
    }
    JsValue::UNDEFINED
}

/// # Safety
/// All pointers must be valid; `cache` may be null.
pub unsafe extern "C" fn sh_ljs_put_by_id_loose_rjs(
    rt: *mut Runtime,
    target: *mut JsValue,
    sym: u32,
    value: *mut JsValue,
    cache: *mut PropertyCacheEntry,
) -> JsValue {
    unsafe { put_by_id_impl(&mut *rt, *target, sym, *value, cache) }
}

/// # Safety
/// All pointers must be valid; `cache` may be null.
pub unsafe extern "C" fn sh_ljs_put_by_id_strict_rjs(
    rt: *mut Runtime,
    target: *mut JsValue,
    sym: u32,
    value: *mut JsValue,
    cache: *mut PropertyCacheEntry,
) -> JsValue {
    unsafe { put_by_id_impl(&mut *rt, *target, sym, *value, cache) }
}

/// # Safety
/// All pointers must be valid; `cache` may be null.
pub unsafe extern "C" fn sh_ljs_try_put_by_id_loose_rjs(
    rt: *mut Runtime,
    target: *mut JsValue,
    sym: u32,
    value: *mut JsValue,
    cache: *mut PropertyCacheEntry,
) -> JsValue {
    unsafe { put_by_id_impl(&mut *rt, *target, sym, *value, cache) }
}

/// # Safety
/// All pointers must be valid; `cache` may be null.
pub unsafe extern "C" fn sh_ljs_try_put_by_id_strict_rjs(
    rt: *mut Runtime,
    target: *mut JsValue,
    sym: u32,
    value: *mut JsValue,
    cache: *mut PropertyCacheEntry,
) -> JsValue {
    unsafe { put_by_id_impl(&mut *rt, *target, sym, *value, cache) }
}

fn key_to_symbol(rt: &mut Runtime, key: JsValue) -> u32 {
    let name = to_string(rt, key);
    rt.intern_symbol(&name)
}

/// # Safety
/// All pointers must be valid.
pub unsafe extern "C" fn sh_ljs_get_by_val_rjs(
    rt: *mut Runtime,
    source: *mut JsValue,
    key: *mut JsValue,
) -> JsValue {
    let rt = unsafe { &mut *rt };
    let sym = key_to_symbol(rt, unsafe { *key });
    get_by_id_impl(rt, unsafe { *source }, sym, std::ptr::null_mut())
}

/// # Safety
/// All pointers must be valid.
pub unsafe extern "C" fn sh_ljs_put_by_val_loose_rjs(
    rt: *mut Runtime,
    target: *mut JsValue,
    key: *mut JsValue,
    value: *mut JsValue,
) -> JsValue {
    let rt = unsafe { &mut *rt };
    let sym = key_to_symbol(rt, unsafe { *key });
    put_by_id_impl(rt, unsafe { *target }, sym, unsafe { *value }, std::ptr::null_mut())
}

/// # Safety
/// All pointers must be valid.
pub unsafe extern "C" fn sh_ljs_put_by_val_strict_rjs(
    rt: *mut Runtime,
    target: *mut JsValue,
    key: *mut JsValue,
    value: *mut JsValue,
) -> JsValue {
    unsafe { sh_ljs_put_by_val_loose_rjs(rt, target, key, value) }
}

/// # Safety
/// All pointers must be valid.
pub unsafe extern "C" fn sh_ljs_get_by_index_rjs(
    rt: *mut Runtime,
    source: *mut JsValue,
    index: u32,
) -> JsValue {
    let rt = unsafe { &mut *rt };
    let name = format!("{}", index);
    let sym = rt.intern_symbol(&name);
    get_by_id_impl(rt, unsafe { *source }, sym, std::ptr::null_mut())
}

// ---- globals and environments ----

/// # Safety
/// `rt` must be valid.
pub unsafe extern "C" fn sh_ljs_get_global_object_rjs(rt: *mut Runtime) -> JsValue {
    unsafe { (*rt).global_object() }
}

/// # Safety
/// `rt` must be valid.
pub unsafe extern "C" fn sh_ljs_declare_global_var_rjs(rt: *mut Runtime, sym: u32) -> JsValue {
    let rt = unsafe { &mut *rt };
    let global = rt.global_object();
    let cell = unsafe { &mut *global.object_pointer() };
    if rt.hidden_classes.lookup_property(cell.hidden_class, sym).is_none() {
        let (next, slot) = rt.hidden_classes.add_property(cell.hidden_class, sym);
        cell.hidden_class = next;
        cell.ensure_slots(slot as usize + 1);
        cell.set_slot(slot, JsValue::UNDEFINED);
    }
    JsValue::UNDEFINED
}

/// # Safety
/// `rt` must be valid.
pub unsafe extern "C" fn sh_ljs_create_top_level_environment_rjs(
    rt: *mut Runtime,
    size: u32,
) -> JsValue {
    unsafe { &mut *rt }.alloc_environment(JsValue::UNDEFINED, size)
}

/// Walk `level` parent links up from the calling function's environment.
///
/// # Safety
/// `rt` and `frame` must be valid.
pub unsafe extern "C" fn sh_ljs_get_parent_environment_rjs(
    rt: *mut Runtime,
    frame: *mut JsValue,
    level: u32,
) -> JsValue {
    let rt = unsafe { &mut *rt };
    let callee = unsafe { *frame.offset((FRAME_OFS_CALLEE / 8) as isize) };
    if !callee.is_object() {
        return rt.throw_type_error("no calling closure");
    }
    let mut env = unsafe { &*callee.object_pointer() }.linked_env;
    for _ in 0..level {
        if !env.is_object() {
            return rt.throw_type_error("environment chain too short");
        }
        env = unsafe { &*env.object_pointer() }.linked_env;
    }
    env
}

// ---- closures and strings ----

/// Create a closure over function `function_id` of `module_index`,
/// binding `env` (or none) as its environment. Materialises the code
/// block through the module, in its domain.
///
/// # Safety
/// `rt` must be valid; `env` may be null.
pub unsafe extern "C" fn sh_ljs_create_bytecode_closure(
    rt: *mut Runtime,
    env: *const JsValue,
    module_index: u32,
    function_id: u32,
) -> JsValue {
    let rt = unsafe { &mut *rt };
    let module = unsafe { &mut *rt.module_ptr(module_index) };
    // The domain owns the resulting closure.
    let _domain = module.get_domain();
    if let Err(e) = module.get_code_block_may_allocate(function_id) {
        return rt.throw_type_error(&e.to_string());
    }
    let env = if env.is_null() { JsValue::UNDEFINED } else { unsafe { *env } };
    rt.alloc_closure(module_index, function_id, env)
}

/// # Safety
/// `rt` must be valid.
pub unsafe extern "C" fn sh_ljs_get_bytecode_string(
    rt: *mut Runtime,
    module_index: u32,
    string_id: u32,
) -> JsValue {
    let rt = unsafe { &mut *rt };
    let module = unsafe { &*rt.module_ptr(module_index) };
    module.get_string_prim_from_string_id_may_allocate(&mut rt.strings, string_id)
}

// ---- calls ----

/// Dispatch a JS call. `frame` is the callee frame base; the caller has
/// stored argc, new.target and the callee value into the header slots
/// below it and the arguments into the slots below those.
///
/// # Safety
/// `rt` and `frame` must be valid and the header slots populated.
pub unsafe extern "C" fn sh_ljs_call_rjs(rt: *mut Runtime, frame: *mut JsValue) -> JsValue {
    let rt_ref = unsafe { &mut *rt };
    let callee = unsafe { *frame.offset((FRAME_OFS_CALLEE / 8) as isize) };
    if !callee.is_object() {
        return rt_ref.throw_type_error("callee is not a function");
    }
    let cell = unsafe { &*callee.object_pointer() };
    if cell.kind() != CELL_CLOSURE {
        return rt_ref.throw_type_error("callee is not a function");
    }
    let module_index = cell.module_index;
    let function_id = cell.function_id;
    let module = unsafe { &mut *rt_ref.module_ptr(module_index) };
    let block = match module.get_code_block_may_allocate(function_id) {
        Ok(block) => block,
        Err(e) => return rt_ref.throw_type_error(&e.to_string()),
    };
    let block_ref = unsafe { &*block };
    if block_ref.is_lazy() {
        if block_ref.lazy_compile(rt_ref) == crate::vm::ExecutionStatus::Exception {
            return JsValue::EMPTY;
        }
    }

    // Record hotness; the tier-up loop compiles functions that cross the
    // threshold.
    let count = block_ref.bump_exec_count();
    if count == rt_ref.config.jit_threshold && rt_ref.config.trace_jit {
        eprintln!("[JIT] function '{}' is hot", block_ref.get_name_string());
    }

    if rt_ref.config.jit_enabled() {
        if let Some(entry) = block_ref.jit_entry() {
            #[cfg(target_arch = "aarch64")]
            {
                let f: JitFn = unsafe { std::mem::transmute(entry) };
                return unsafe { f(rt, frame) };
            }
            #[cfg(not(target_arch = "aarch64"))]
            let _ = entry;
        }
    }

    match rt_ref.interpreter {
        Some(interp) => interp(rt_ref, block, frame),
        None => rt_ref.throw_type_error("no interpreter available"),
    }
}

// ---- tracing ----

/// Function entry/exit tracing, enabled by `trace_calls`.
///
/// # Safety
/// `msg` must be a valid NUL-terminated string.
pub unsafe extern "C" fn print_function_entry_exit(enter: bool, msg: *const std::os::raw::c_char) {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static LEVEL: AtomicUsize = AtomicUsize::new(0);
    let level = if enter {
        LEVEL.fetch_add(1, Ordering::Relaxed)
    } else {
        LEVEL.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    };
    let msg = unsafe { std::ffi::CStr::from_ptr(msg) }.to_string_lossy();
    let verb = if enter { "Enter" } else { "Leave" };
    eprintln!("{:indent$}*** {} {}", "", verb, msg, indent = level * 4);
}
