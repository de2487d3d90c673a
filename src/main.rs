//! Engine development shell: compile built-in sample functions with the
//! JIT and inspect the emitted code, or run the call-graph analysis over
//! a sample IR module.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use jade::config::RuntimeConfig;
use jade::ir;
use jade::vm::bytecode::{BytecodeBuilder, OpCode, RuntimeFunctionHeader};
#[cfg(feature = "jit")]
use jade::vm::bytecode::BytecodeModule;
#[cfg(feature = "jit")]
use jade::vm::Runtime;

#[derive(Parser)]
#[command(name = "jade")]
#[command(about = "A JavaScript bytecode VM core", long_about = None)]
struct Cli {
    /// Runtime configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// JIT-compile a built-in sample function and dump the emitted code
    Jit {
        /// Sample name (see `samples`)
        sample: String,
    },
    /// List the built-in samples
    Samples,
    /// Run the call-graph analysis over a sample IR module and print the
    /// function attributes
    Analyze,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Jit { sample } => run_jit(&sample, config),
        Commands::Samples => {
            for (name, _) in SAMPLES {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Analyze => {
            run_analyze();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<RuntimeConfig, String> {
    match path {
        None => Ok(RuntimeConfig::default()),
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("error: could not read '{}': {}", path.display(), e))?;
            serde_json::from_str(&text)
                .map_err(|e| format!("error: bad config '{}': {}", path.display(), e))
        }
    }
}

type SampleFn = fn() -> (RuntimeFunctionHeader, Vec<u8>);

/// Built-in sample bodies the `jit` subcommand compiles.
const SAMPLES: &[(&str, SampleFn)] = &[
    ("add", sample_add),
    ("loop", sample_loop),
    ("props", sample_props),
];

/// r2 = r0 + r1 with unknown operand types.
fn sample_add() -> (RuntimeFunctionHeader, Vec<u8>) {
    let mut b = BytecodeBuilder::new();
    b.op(OpCode::LoadParam).u8(0).u8(1);
    b.op(OpCode::LoadParam).u8(1).u8(2);
    b.op(OpCode::Add).u8(2).u8(0).u8(1);
    b.op(OpCode::Ret).u8(2);
    let header = RuntimeFunctionHeader {
        param_count: 3,
        frame_size: 8,
        ..Default::default()
    };
    (header, b.finish())
}

/// Sum the numbers below one thousand.
fn sample_loop() -> (RuntimeFunctionHeader, Vec<u8>) {
    let mut b = BytecodeBuilder::new();
    b.op(OpCode::LoadConstDouble).u8(0).f64(0.0); // acc
    b.op(OpCode::LoadConstDouble).u8(1).f64(0.0); // i
    b.op(OpCode::LoadConstDouble).u8(2).f64(1000.0);
    let loop_top = b.offset();
    b.op(OpCode::AddN).u8(0).u8(0).u8(1);
    b.op(OpCode::Inc).u8(1).u8(1);
    let jump_at = b.offset();
    let rel = loop_top as i64 - jump_at as i64;
    b.op(OpCode::JGreaterN).i16(rel as i16).u8(2).u8(1);
    b.op(OpCode::Ret).u8(0);
    let header = RuntimeFunctionHeader {
        param_count: 1,
        frame_size: 8,
        ..Default::default()
    };
    (header, b.finish())
}

/// Cached property read and write on the first parameter.
fn sample_props() -> (RuntimeFunctionHeader, Vec<u8>) {
    let mut b = BytecodeBuilder::new();
    b.op(OpCode::LoadParam).u8(0).u8(1);
    b.op(OpCode::GetById).u8(1).u8(0).u32(0).u8(0);
    b.op(OpCode::Inc).u8(1).u8(1);
    b.op(OpCode::PutByIdLoose).u8(0).u32(0).u8(1).u8(0);
    b.op(OpCode::Ret).u8(1);
    let header = RuntimeFunctionHeader {
        param_count: 2,
        frame_size: 8,
        read_cache_size: 1,
        write_cache_size: 1,
        ..Default::default()
    };
    (header, b.finish())
}

#[cfg(feature = "jit")]
fn run_jit(sample: &str, mut config: RuntimeConfig) -> Result<(), String> {
    let build = SAMPLES
        .iter()
        .find(|(name, _)| *name == sample)
        .map(|(_, build)| *build)
        .ok_or_else(|| format!("error: unknown sample '{}'", sample))?;

    config.dump_jit_code = true;
    let mut runtime = Runtime::new(config);
    let mut builder = BytecodeModule::builder();
    builder.add_string(sample);
    let (header, bytecode) = build();
    let function_id = builder.add_function(header, bytecode, Vec::new());
    let module_index = runtime.add_module(Box::new(builder.build()));

    let mut jit = jade::jit::JitContext::new();
    let entry = jit
        .compile_function(&mut runtime, module_index, function_id)
        .map_err(|e| format!("error: {}", e))?;
    println!("entry: {:p}", entry);
    Ok(())
}

#[cfg(not(feature = "jit"))]
fn run_jit(_sample: &str, _config: RuntimeConfig) -> Result<(), String> {
    Err("error: this build excludes the JIT".to_string())
}

/// outer() { var f = function() {...}; f(); } plus an escaping closure.
fn run_analyze() {
    let mut m = ir::Module::new();
    let outer = m.add_function("outer", true);
    let callee = m.add_function("callee", false);
    let escaping = m.add_function("escaping", false);
    m.func_mut(callee).parent_scope_param_users = 1;

    let scope = m.add_inst(outer, ir::InstKind::CreateScope { parent: None });
    let c1 = m.add_inst(
        outer,
        ir::InstKind::CreateClosure {
            function: callee,
            scope,
        },
    );
    m.add_inst(
        outer,
        ir::InstKind::Call {
            callee: ir::Operand::Inst(c1),
            target: None,
            environment: None,
            args: Vec::new(),
            new_target: ir::Operand::Undefined,
        },
    );
    let c2 = m.add_inst(
        outer,
        ir::InstKind::CreateClosure {
            function: escaping,
            scope,
        },
    );
    m.add_inst(
        outer,
        ir::InstKind::Call {
            callee: ir::Operand::Inst(c1),
            target: None,
            environment: None,
            args: vec![ir::Operand::Inst(c2)],
            new_target: ir::Operand::Undefined,
        },
    );

    ir::analysis::run_function_analysis(&mut m);

    for f in m.function_ids().collect::<Vec<_>>() {
        let func = m.func(f);
        println!(
            "{}: allCallsitesKnownInStrictMode={} unreachable={}",
            func.name,
            func.attributes.all_callsites_known_in_strict_mode,
            func.attributes.unreachable
        );
    }
}
