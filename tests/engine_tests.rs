//! In-process tests for code blocks, runtime modules, and the JIT
//! emitter, driven through the public API.

use jade::config::RuntimeConfig;
use jade::vm::bytecode::{
    BytecodeBuilder, BytecodeModule, CompileError, ExceptionHandler, OpCode,
    RuntimeFunctionHeader, SourceSpan,
};
use jade::vm::debug_info::{DebugInfoBuilder, SourceLocation};
use jade::vm::runtime::WeakRootClearer;
use jade::vm::{CodeBlock, ExecutionStatus, JsValue, Runtime};

/// Build a runtime holding a single-function module.
fn runtime_with_function(
    header: RuntimeFunctionHeader,
    bytecode: Vec<u8>,
    handlers: Vec<ExceptionHandler>,
) -> (Box<Runtime>, u32, u32) {
    let mut builder = BytecodeModule::builder();
    builder.add_string("f");
    let function_id = builder.add_function(header, bytecode, handlers);
    let mut runtime = Runtime::new(RuntimeConfig::default());
    let module_index = runtime.add_module(Box::new(builder.build()));
    (runtime, module_index, function_id)
}

fn trivial_body() -> Vec<u8> {
    let mut b = BytecodeBuilder::new();
    b.op(OpCode::LoadConstUndefined).u8(0);
    b.op(OpCode::Ret).u8(0);
    b.finish()
}

fn block_of(runtime: &mut Runtime, module_index: u32, function_id: u32) -> &'static CodeBlock {
    let ptr = runtime
        .module_mut(module_index)
        .get_code_block_may_allocate(function_id)
        .unwrap();
    unsafe { &*ptr }
}

mod code_block {
    use super::*;

    #[test]
    fn test_cache_layout() {
        let header = RuntimeFunctionHeader {
            read_cache_size: 5,
            write_cache_size: 3,
            ..Default::default()
        };
        let (mut rt, m, f) = runtime_with_function(header, trivial_body(), Vec::new());
        let block = block_of(&mut rt, m, f);

        assert_eq!(block.property_cache_size(), 8);
        assert_eq!(block.write_prop_cache_offset(), 5);
        for idx in 0..5 {
            let entry = unsafe { &*block.get_read_cache_entry(idx) };
            assert_eq!(entry.class, 0);
        }
        for idx in 0..3 {
            let entry = unsafe { &*block.get_write_cache_entry(idx) };
            assert_eq!(entry.class, 0);
        }
        // The write segment follows the read segment in one slab.
        let read0 = block.get_read_cache_entry(0) as usize;
        let write0 = block.get_write_cache_entry(0) as usize;
        assert_eq!(write0 - read0, 5 * 8);
    }

    #[test]
    #[should_panic(expected = "read cache bound")]
    fn test_read_cache_out_of_bounds() {
        let header = RuntimeFunctionHeader {
            read_cache_size: 5,
            write_cache_size: 3,
            ..Default::default()
        };
        let (mut rt, m, f) = runtime_with_function(header, trivial_body(), Vec::new());
        let block = block_of(&mut rt, m, f);
        block.get_read_cache_entry(5);
    }

    #[test]
    #[should_panic(expected = "write cache bound")]
    fn test_write_cache_out_of_bounds() {
        let header = RuntimeFunctionHeader {
            read_cache_size: 5,
            write_cache_size: 3,
            ..Default::default()
        };
        let (mut rt, m, f) = runtime_with_function(header, trivial_body(), Vec::new());
        let block = block_of(&mut rt, m, f);
        block.get_write_cache_entry(3);
    }

    #[test]
    fn test_offset_round_trip() {
        let body = trivial_body();
        let size = body.len() as u32;
        let (mut rt, m, f) =
            runtime_with_function(RuntimeFunctionHeader::default(), body, Vec::new());
        let block = block_of(&mut rt, m, f);

        assert_eq!(block.end() as usize - block.begin() as usize, size as usize);
        for offset in 0..size {
            let ptr = block.get_offset_ptr(offset);
            assert!(block.contains(ptr));
            assert_eq!(block.get_offset_of(ptr), offset);
        }
    }

    #[test]
    fn test_find_catch_target_narrowest_wins() {
        let handlers = vec![
            ExceptionHandler {
                start: 0,
                end: 100,
                target: 1,
            },
            ExceptionHandler {
                start: 10,
                end: 50,
                target: 2,
            },
        ];
        let (mut rt, m, f) =
            runtime_with_function(RuntimeFunctionHeader::default(), trivial_body(), handlers);
        let block = block_of(&mut rt, m, f);

        assert_eq!(block.find_catch_target_offset(20), 2);
        assert_eq!(block.find_catch_target_offset(60), 1);
        assert_eq!(block.find_catch_target_offset(200), -1);
    }

    #[test]
    fn test_find_catch_target_later_registration_wins_ties() {
        let handlers = vec![
            ExceptionHandler {
                start: 10,
                end: 50,
                target: 1,
            },
            ExceptionHandler {
                start: 10,
                end: 50,
                target: 2,
            },
        ];
        let (mut rt, m, f) =
            runtime_with_function(RuntimeFunctionHeader::default(), trivial_body(), handlers);
        let block = block_of(&mut rt, m, f);
        assert_eq!(block.find_catch_target_offset(30), 2);
    }

    #[test]
    fn test_trivial_readers() {
        let header = RuntimeFunctionHeader {
            param_count: 3,
            frame_size: 12,
            virtual_offset: 640,
            ..Default::default()
        };
        let (mut rt, m, f) = runtime_with_function(header, trivial_body(), Vec::new());
        let block = block_of(&mut rt, m, f);
        assert_eq!(block.get_param_count(), 3);
        assert_eq!(block.get_frame_size(), 12);
        assert_eq!(block.get_function_id(), 0);
        assert_eq!(block.get_virtual_offset(), 640);
        assert!(!block.is_strict_mode());
        assert_eq!(block.get_name_string(), "f");
        let name = block.get_name_may_allocate(&mut rt);
        assert_eq!(rt.symbol_name(name), "f");
        assert_eq!(block.additional_memory_size(), 0);
    }
}

#[cfg(not(feature = "lean"))]
mod lazy {
    use super::*;

    fn span() -> SourceSpan {
        SourceSpan {
            start_line: 3,
            start_col: 10,
            end_line: 7,
            end_col: 2,
        }
    }

    fn lazy_runtime(
        result: Result<(RuntimeFunctionHeader, Vec<u8>), CompileError>,
    ) -> (Box<Runtime>, u32, u32) {
        let mut builder = BytecodeModule::builder();
        builder.add_string("f");
        let function_id =
            builder.add_lazy_function(RuntimeFunctionHeader::default(), span(), result);
        let mut runtime = Runtime::new(RuntimeConfig::default());
        let module_index = runtime.add_module(Box::new(builder.build()));
        (runtime, module_index, function_id)
    }

    #[test]
    fn test_lazy_compile_success() {
        let compiled_header = RuntimeFunctionHeader {
            frame_size: 20,
            ..Default::default()
        };
        let (mut rt, m, f) = lazy_runtime(Ok((compiled_header, super::trivial_body())));
        let block = block_of(&mut rt, m, f);

        assert!(block.is_lazy());
        assert!(block.coords_in_lazy_function(5, 1));
        assert!(!block.coords_in_lazy_function(3, 2));
        assert!(!block.coords_in_lazy_function(8, 1));

        assert_eq!(block.lazy_compile(&mut rt), ExecutionStatus::Returned);
        assert!(!block.is_lazy());
        assert_eq!(block.get_frame_size(), 20);
        assert_eq!(block.get_function_id(), f);
        // A second call is a no-op.
        assert_eq!(block.lazy_compile(&mut rt), ExecutionStatus::Returned);
    }

    #[test]
    fn test_lazy_compile_failure_throws() {
        let (mut rt, m, f) = lazy_runtime(Err(CompileError {
            message: "unexpected token".to_string(),
        }));
        let block = block_of(&mut rt, m, f);

        assert_eq!(block.lazy_compile(&mut rt), ExecutionStatus::Exception);
        assert!(rt.has_thrown());
        assert!(block.is_lazy());
    }
}

#[cfg(not(feature = "lean"))]
mod reflection {
    use super::*;

    #[test]
    fn test_variable_counts_and_names() {
        let mut debug = DebugInfoBuilder::new();
        debug.add_file("main.js");
        let lexical = debug.add_lexical_data(&[
            vec!["x".to_string(), "y".to_string()],
            vec!["captured".to_string()],
        ]);
        let locs = debug.add_source_locations(&[
            (
                0,
                SourceLocation {
                    file_id: 0,
                    line: 4,
                    column: 1,
                },
            ),
            (
                2,
                SourceLocation {
                    file_id: 0,
                    line: 5,
                    column: 3,
                },
            ),
        ]);

        let mut builder = BytecodeModule::builder();
        builder.add_string("f");
        let header = RuntimeFunctionHeader {
            debug_source_locs_offset: Some(locs),
            debug_lexical_data_offset: Some(lexical),
            ..Default::default()
        };
        let function_id = builder.add_function(header, trivial_body(), Vec::new());
        builder.set_debug_info(debug.build());
        let mut runtime = Runtime::new(RuntimeConfig::default());
        let module_index = runtime.add_module(Box::new(builder.build()));
        let block = block_of(&mut runtime, module_index, function_id);

        assert_eq!(block.get_variable_counts(), vec![2, 1]);
        assert_eq!(
            block.get_variable_name_at_depth(0, 0),
            Some("x".to_string())
        );
        assert_eq!(
            block.get_variable_name_at_depth(1, 0),
            Some("captured".to_string())
        );
        assert_eq!(block.get_variable_name_at_depth(0, 2), None);

        let loc = block.get_source_location(2).unwrap();
        assert_eq!((loc.line, loc.column), (5, 3));
        let func_loc = block.get_source_location_for_function().unwrap();
        assert_eq!((func_loc.line, func_loc.column), (4, 1));
    }

    #[test]
    fn test_debug_queries_without_debug_info() {
        let (mut rt, m, f) =
            runtime_with_function(RuntimeFunctionHeader::default(), trivial_body(), Vec::new());
        let block = block_of(&mut rt, m, f);
        assert!(block.get_source_location(0).is_none());
        assert!(block.get_source_location_for_function().is_none());
        assert!(block.get_function_source_id().is_none());
        assert!(block.get_debug_lexical_data_offset().is_none());
        assert!(block.get_variable_counts().is_empty());
    }
}

#[cfg(feature = "jit")]
mod weak_roots {
    use super::*;

    #[test]
    fn test_cache_entries_visited_once_and_cleared() {
        let header = RuntimeFunctionHeader {
            read_cache_size: 2,
            write_cache_size: 1,
            ..Default::default()
        };
        let (mut rt, m, f) = runtime_with_function(header, trivial_body(), Vec::new());
        let block = block_of(&mut rt, m, f);

        // Populate one read entry through the helper path.
        let sym = rt.intern_symbol("x");
        let obj = rt.alloc_object();
        let mut target = obj;
        let mut value = JsValue::encode_f64(1.0);
        unsafe {
            jade::jit::helpers::sh_ljs_put_by_id_loose_rjs(
                &mut *rt,
                &mut target,
                sym,
                &mut value,
                block.get_read_cache_entry(0),
            );
        }
        let class = unsafe { &*block.get_read_cache_entry(0) }.class;
        assert_ne!(class, 0);

        // One live entry, visited exactly once per cycle.
        let mut clearer = WeakRootClearer::new(&rt.hidden_classes);
        rt.mark_weak_roots(&mut clearer);
        assert_eq!(clearer.visited, 1);
        assert_eq!(unsafe { &*block.get_read_cache_entry(0) }.class, class);

        // After the class is reclaimed, marking wipes the entry.
        rt.hidden_classes.reclaim(class);
        let mut clearer = WeakRootClearer::new(&rt.hidden_classes);
        rt.mark_weak_roots(&mut clearer);
        assert_eq!(unsafe { &*block.get_read_cache_entry(0) }.class, 0);

        // The wiped entry is empty and no longer visited.
        let mut clearer = WeakRootClearer::new(&rt.hidden_classes);
        rt.mark_weak_roots(&mut clearer);
        assert_eq!(clearer.visited, 0);
    }
}

#[cfg(feature = "debugger")]
mod breakpoints {
    use super::*;
    use jade::debugger::BreakpointRegistry;

    #[test]
    fn test_install_and_uninstall() {
        let (mut rt, m, f) =
            runtime_with_function(RuntimeFunctionHeader::default(), trivial_body(), Vec::new());
        let block = block_of(&mut rt, m, f);
        let original = block.get_opcode_array()[0];

        let mut registry = BreakpointRegistry::new();
        registry.set_breakpoint(block, 0);
        assert_eq!(block.get_opcode_array()[0], OpCode::Debugger as u8);
        assert_eq!(rt.module(m).user_count(), 1);
        assert!(registry.breakpoint_at(m, f, 0).is_some());

        registry.clear_breakpoint(block, 0);
        assert_eq!(block.get_opcode_array()[0], original);
        assert_eq!(rt.module(m).user_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_next_offset_steps_over_operands() {
        let (mut rt, m, f) =
            runtime_with_function(RuntimeFunctionHeader::default(), trivial_body(), Vec::new());
        let block = block_of(&mut rt, m, f);
        // LoadConstUndefined is two bytes.
        assert_eq!(block.get_next_offset(0), 2);
    }
}

#[cfg(feature = "jit")]
mod jit {
    use super::*;
    use jade::jit::emitter::Emitter;
    use jade::jit::frame::FR;
    use jade::jit::helpers;
    use jade::jit::{compile_code_block, JitError};

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// FADD Dd, Dn, Dm
    fn is_fadd(w: u32) -> bool {
        (w & 0xFFE0_FC00) == 0x1E60_2800
    }

    /// CMP Xn, x21
    fn is_cmp_double_lim(w: u32) -> bool {
        (w & 0xFFFF_FC1F) == 0xEB15_001F
    }

    /// B.HS to anywhere
    fn is_b_hs(w: u32) -> bool {
        (w & 0xFF00_001F) == 0x5400_0002
    }

    /// FMOV Dd, #imm8; returns the imm8.
    fn fmov_imm8(w: u32) -> Option<u8> {
        if (w & 0xFFE0_1FE0) == 0x1E60_1000 {
            Some(((w >> 13) & 0xFF) as u8)
        } else {
            None
        }
    }

    fn count_pattern(haystack: &[u8], needle: &[u8]) -> usize {
        haystack
            .windows(needle.len())
            .filter(|window| *window == needle)
            .count()
    }

    fn test_emitter(num_frame_regs: u32) -> Emitter {
        Emitter::new(
            false,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            num_frame_regs,
            0,
            0,
            0,
        )
    }

    /// Both operands known Number: a pure fast path, no slow path queued.
    #[test]
    fn test_add_fast_path_is_pure() {
        let mut em = test_emitter(8);
        em.load_const_double(FR::new(0), 1.0, "c0");
        em.load_const_double(FR::new(1), 2.0, "c1");
        em.add(FR::new(2), FR::new(0), FR::new(1));
        assert_eq!(em.slow_path_count(), 0);
        em.ret(FR::new(2));
        let compiled = em.add_to_runtime().unwrap();

        let ws = words(compiled.code());
        assert_eq!(ws.iter().filter(|w| is_fadd(**w)).count(), 1);
        assert_eq!(ws.iter().filter(|w| is_cmp_double_lim(**w)).count(), 0);
        assert_eq!(ws.iter().filter(|w| is_b_hs(**w)).count(), 0);
    }

    /// One operand of unknown type: a range check against x21 diverting
    /// to a queued slow path that calls the add helper and branches back.
    #[test]
    fn test_add_slow_path_guard() {
        let mut em = test_emitter(8);
        em.load_const_double(FR::new(1), 2.0, "c1");
        em.add(FR::new(2), FR::new(0), FR::new(1));
        assert_eq!(em.slow_path_count(), 1);
        em.ret(FR::new(2));
        let compiled = em.add_to_runtime().unwrap();

        let ws = words(compiled.code());
        assert_eq!(ws.iter().filter(|w| is_cmp_double_lim(**w)).count(), 1);
        assert_eq!(ws.iter().filter(|w| is_b_hs(**w)).count(), 1);
        assert_eq!(ws.iter().filter(|w| is_fadd(**w)).count(), 1);

        // The slow path thunk loads the add helper from RO data.
        let helper = (helpers::sh_ljs_add_rjs as usize as u64).to_le_bytes();
        assert_eq!(count_pattern(compiled.code(), &helper), 1);

        // Both operand slots are marshalled by address: add xN, x20, #ofs.
        let marshal_r0 = 0x9100_0000u32 | (20 << 5) | 1;
        let marshal_r1 = 0x9100_0000u32 | (8 << 10) | (20 << 5) | 2;
        assert!(ws.contains(&marshal_r0));
        assert!(ws.contains(&marshal_r1));
    }

    /// Two guarded adds share one helper thunk.
    #[test]
    fn test_thunk_dedup() {
        let mut em = test_emitter(8);
        em.add(FR::new(2), FR::new(0), FR::new(1));
        em.add(FR::new(3), FR::new(2), FR::new(0));
        em.ret(FR::new(3));
        let compiled = em.add_to_runtime().unwrap();

        let helper = (helpers::sh_ljs_add_rjs as usize as u64).to_le_bytes();
        assert_eq!(count_pattern(compiled.code(), &helper), 1);
    }

    /// Identical bit patterns share one constant-pool slot.
    #[test]
    fn test_fp_constant_dedup() {
        let mut em = test_emitter(8);
        em.load_const_double(FR::new(0), 3.141592, "pi0");
        em.load_const_double(FR::new(1), 3.141592, "pi1");
        em.ret(FR::new(0));
        let compiled = em.add_to_runtime().unwrap();

        let bits = 3.141592f64.to_bits().to_le_bytes();
        assert_eq!(count_pattern(compiled.code(), &bits), 1);
    }

    /// inc and dec both load -1.0 in their fast path; inc gets its actual
    /// semantics from the slow path. Guards the current behaviour.
    #[test]
    fn test_inc_and_dec_share_the_minus_one_constant() {
        let mut em = test_emitter(8);
        // 100.5 is outside the fmov-imm8 range, so it comes from the
        // constant pool and the only fmov immediates are the op
        // constants.
        em.load_const_double(FR::new(0), 100.5, "c0");
        em.inc(FR::new(1), FR::new(0));
        em.dec(FR::new(2), FR::new(0));
        em.ret(FR::new(2));
        let compiled = em.add_to_runtime().unwrap();

        let imms: Vec<u8> = words(compiled.code())
            .iter()
            .filter_map(|w| fmov_imm8(*w))
            .collect();
        // Two fmov immediates, both -1.0 (0xF0); +1.0 (0x70) never
        // appears.
        assert_eq!(imms, vec![0xF0, 0xF0]);
    }

    /// End-to-end: the driver compiles a loop with labels, guards and a
    /// property access.
    #[test]
    fn test_compile_code_block_samples() {
        // Loop: back-edge label, N-typed ops.
        let mut b = BytecodeBuilder::new();
        b.op(OpCode::LoadConstDouble).u8(0).f64(0.0);
        b.op(OpCode::LoadConstDouble).u8(1).f64(0.0);
        b.op(OpCode::LoadConstDouble).u8(2).f64(100.0);
        let top = b.offset();
        b.op(OpCode::AddN).u8(0).u8(0).u8(1);
        b.op(OpCode::Inc).u8(1).u8(1);
        let at = b.offset();
        b.op(OpCode::JGreaterN)
            .i16((top as i64 - at as i64) as i16)
            .u8(2)
            .u8(1);
        b.op(OpCode::Ret).u8(0);
        let (mut rt, m, f) = runtime_with_function(
            RuntimeFunctionHeader {
                frame_size: 8,
                ..Default::default()
            },
            b.finish(),
            Vec::new(),
        );
        let block = block_of(&mut rt, m, f);
        let compiled = compile_code_block(block, m, &RuntimeConfig::default()).unwrap();
        assert!(!compiled.code().is_empty());

        // Property access: read and write caches flow into RO data.
        let mut b = BytecodeBuilder::new();
        b.op(OpCode::LoadParam).u8(0).u8(1);
        b.op(OpCode::GetById).u8(1).u8(0).u32(7).u8(0);
        b.op(OpCode::PutByIdLoose).u8(0).u32(7).u8(1).u8(0);
        b.op(OpCode::Ret).u8(1);
        let (mut rt, m, f) = runtime_with_function(
            RuntimeFunctionHeader {
                frame_size: 8,
                read_cache_size: 1,
                write_cache_size: 1,
                ..Default::default()
            },
            b.finish(),
            Vec::new(),
        );
        let block = block_of(&mut rt, m, f);
        let compiled = compile_code_block(block, m, &RuntimeConfig::default()).unwrap();

        // The cache base pointers are the first two RO data entries.
        let read_base = (block.read_cache_base() as usize as u64).to_le_bytes();
        let write_base = (block.write_cache_base() as usize as u64).to_le_bytes();
        assert_eq!(count_pattern(compiled.code(), &read_base), 1);
        // Read and write segments of a 1+1 cache differ by one entry.
        assert_eq!(count_pattern(compiled.code(), &write_base), 1);
    }

    /// A function with an installed breakpoint is rejected and falls back
    /// to the interpreter.
    #[test]
    fn test_debugger_inst_is_unsupported() {
        let mut b = BytecodeBuilder::new();
        b.op(OpCode::Debugger);
        b.op(OpCode::Ret).u8(0);
        let (mut rt, m, f) = runtime_with_function(
            RuntimeFunctionHeader {
                frame_size: 4,
                ..Default::default()
            },
            b.finish(),
            Vec::new(),
        );
        let block = block_of(&mut rt, m, f);
        match compile_code_block(block, m, &RuntimeConfig::default()) {
            Err(JitError::UnsupportedInstruction(_)) => {}
            other => panic!("expected UnsupportedInstruction, got {:?}", other.map(|_| ())),
        }
    }

    /// Per-function recovery: a failed compile blocks only that function.
    #[test]
    fn test_jit_context_fallback() {
        let mut builder = BytecodeModule::builder();
        builder.add_string("bad");
        let mut b = BytecodeBuilder::new();
        b.op(OpCode::Debugger);
        b.op(OpCode::Ret).u8(0);
        let bad = builder.add_function(
            RuntimeFunctionHeader {
                frame_size: 4,
                ..Default::default()
            },
            b.finish(),
            Vec::new(),
        );
        let good = builder.add_function(
            RuntimeFunctionHeader {
                frame_size: 4,
                ..Default::default()
            },
            trivial_body(),
            Vec::new(),
        );
        let mut runtime = Runtime::new(RuntimeConfig::default());
        let module_index = runtime.add_module(Box::new(builder.build()));

        let mut jit = jade::jit::JitContext::new();
        assert!(jit.compile_function(&mut runtime, module_index, bad).is_err());
        assert!(jit
            .compile_function(&mut runtime, module_index, good)
            .is_ok());
        assert_eq!(jit.compiled_count(), 1);

        let bad_block = block_of(&mut runtime, module_index, bad);
        let good_block = block_of(&mut runtime, module_index, good);
        assert!(bad_block.jit_blocked());
        assert!(bad_block.jit_entry().is_none());
        assert!(good_block.jit_entry().is_some());
    }
}
