//! Bytecode instruction set and the provider surface.
//!
//! The engine consumes bytecode through a `BytecodeProvider`: per function a
//! `RuntimeFunctionHeader`, the opcode bytes (absent while the function is
//! lazy), and an exception table. File parsing and validation live outside
//! the core; the in-memory `BytecodeModule` here is the provider the CLI and
//! the tests use.

use super::debug_info::DebugInfo;
use std::fmt;

/// Bytecode opcodes. One byte each, fixed operand layout per opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Ret r: return the value in frame register r.
    Ret = 0,
    /// Mov rDst, rSrc
    Mov = 1,
    /// LoadParam r, idx: parameter idx (0 = this) or undefined.
    LoadParam = 2,
    /// LoadConstDouble r, f64
    LoadConstDouble = 3,
    LoadConstUndefined = 4,
    LoadConstTrue = 5,
    LoadConstFalse = 6,
    LoadConstNull = 7,
    /// LoadConstString r, stringID(u32)
    LoadConstString = 8,

    /// Arithmetic: rRes, rLeft, rRight. The N forms are statically known to
    /// take numbers and skip the type guard.
    Add = 9,
    Sub = 10,
    Mul = 11,
    AddN = 12,
    SubN = 13,
    MulN = 14,
    /// Inc/Dec/ToNumber: rRes, rInput.
    Inc = 15,
    Dec = 16,
    ToNumber = 17,

    /// Jmp rel(i16): relative to the start of this instruction.
    Jmp = 18,
    /// Conditional jumps: rel(i16), rLeft, rRight.
    JGreater = 19,
    JGreaterEqual = 20,
    JNotGreater = 21,
    JNotGreaterEqual = 22,
    JGreaterN = 23,
    JGreaterEqualN = 24,
    JNotGreaterN = 25,
    JNotGreaterEqualN = 26,

    /// GetById rRes, rSrc, symID(u32), cacheIdx(u8)
    GetById = 27,
    TryGetById = 28,
    /// PutById rTarget, symID(u32), rValue, cacheIdx(u8)
    PutByIdLoose = 29,
    PutByIdStrict = 30,
    TryPutByIdLoose = 31,
    TryPutByIdStrict = 32,
    /// GetByVal rRes, rSrc, rKey
    GetByVal = 33,
    PutByValLoose = 34,
    PutByValStrict = 35,
    /// GetByIndex rRes, rSrc, idx(u8)
    GetByIndex = 36,

    /// Call rRes, rCallee, argc(u8). The arguments are the argc frame
    /// registers at the top of the frame.
    Call = 37,

    GetGlobalObject = 38,
    /// DeclareGlobalVar symID(u32)
    DeclareGlobalVar = 39,
    /// CreateTopLevelEnvironment rRes, size(u32)
    CreateTopLevelEnvironment = 40,
    /// GetParentEnvironment rRes, level(u8)
    GetParentEnvironment = 41,
    /// LoadFromEnvironment rRes, rEnv, slot(u8)
    LoadFromEnvironment = 42,
    /// StoreToEnvironment rEnv, slot(u8), rValue
    StoreToEnvironment = 43,
    /// StoreNPToEnvironment: value statically known non-pointer.
    StoreNPToEnvironment = 44,
    /// CreateClosure rRes, rEnv, functionID(u32)
    CreateClosure = 45,

    /// Breakpoint placeholder patched in by the debugger.
    Debugger = 46,
}

/// Last opcode value, for decode validation.
const MAX_OPCODE: u8 = OpCode::Debugger as u8;

impl OpCode {
    pub fn from_u8(byte: u8) -> Option<OpCode> {
        if byte <= MAX_OPCODE {
            // Discriminants are dense and start at zero.
            Some(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
        } else {
            None
        }
    }

    /// Total encoded length of an instruction, opcode byte included.
    pub fn inst_length(self) -> usize {
        use OpCode::*;
        match self {
            Debugger => 1,
            Ret | LoadConstUndefined | LoadConstTrue | LoadConstFalse | LoadConstNull
            | GetGlobalObject => 2,
            Mov | LoadParam | Inc | Dec | ToNumber | Jmp | GetParentEnvironment => 3,
            Add | Sub | Mul | AddN | SubN | MulN | GetByVal | PutByValLoose | PutByValStrict
            | GetByIndex | Call | LoadFromEnvironment | StoreToEnvironment
            | StoreNPToEnvironment => 4,
            JGreater | JGreaterEqual | JNotGreater | JNotGreaterEqual | JGreaterN
            | JGreaterEqualN | JNotGreaterN | JNotGreaterEqualN | DeclareGlobalVar => 5,
            LoadConstString | CreateTopLevelEnvironment => 6,
            CreateClosure => 7,
            GetById | TryGetById | PutByIdLoose | PutByIdStrict | TryPutByIdLoose
            | TryPutByIdStrict => 8,
            LoadConstDouble => 10,
        }
    }

    /// Whether this opcode terminates a function body.
    pub fn is_return_class(self) -> bool {
        matches!(self, OpCode::Ret)
    }
}

/// Flags carried by a function header.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionHeaderFlags {
    pub strict_mode: bool,
    pub prohibit_construct: bool,
}

/// Per-function header handed out by the provider.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeFunctionHeader {
    pub param_count: u32,
    pub frame_size: u32,
    pub bytecode_size: u32,
    pub flags: FunctionHeaderFlags,
    /// Read/write inline property cache sizes chosen by the bytecode
    /// generator.
    pub read_cache_size: u8,
    pub write_cache_size: u8,
    /// Offset of this function's entry in the debug source-location stream.
    pub debug_source_locs_offset: Option<u32>,
    /// Offset of this function's lexical data (variable names).
    pub debug_lexical_data_offset: Option<u32>,
    /// Entry in the function source table, if the source was preserved.
    pub function_source_id: Option<u32>,
    /// Offset of the function in a virtual bytecode stream in which all
    /// functions emit their bytecode in order. Used for backtraces when
    /// debug info is absent.
    pub virtual_offset: u32,
    /// Name of the function in the string table.
    pub name_string_id: u32,
}

impl Default for RuntimeFunctionHeader {
    fn default() -> Self {
        RuntimeFunctionHeader {
            param_count: 1,
            frame_size: 16,
            bytecode_size: 0,
            flags: FunctionHeaderFlags::default(),
            read_cache_size: 0,
            write_cache_size: 0,
            debug_source_locs_offset: None,
            debug_lexical_data_offset: None,
            function_source_id: None,
            virtual_offset: 0,
            name_string_id: 0,
        }
    }
}

/// One exception-table range: [start, end) guarded, handler at target.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionHandler {
    pub start: u32,
    pub end: u32,
    pub target: u32,
}

/// A source span of a lazily compiled function (1-based coordinates).
#[derive(Debug, Clone, Copy)]
pub struct SourceSpan {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

impl SourceSpan {
    /// Whether the 1-based (line, col) falls inside the span.
    pub fn contains(&self, line: u32, col: u32) -> bool {
        if line < self.start_line || line > self.end_line {
            return false;
        }
        if line == self.start_line && col < self.start_col {
            return false;
        }
        if line == self.end_line && col > self.end_col {
            return false;
        }
        true
    }
}

/// Error raised by the lazy compilation path.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compile error: {}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// Error type for bytecode validation.
#[derive(Debug)]
pub enum BytecodeError {
    /// Opcode byte outside the instruction set.
    InvalidOpcode(u8),
    /// An instruction runs past the end of the function.
    TruncatedInstruction(u32),
    /// The last instruction is not a return-class opcode.
    MissingTerminator,
    /// A jump lands outside the function or between instructions.
    BadJumpTarget(u32),
}

impl fmt::Display for BytecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BytecodeError::InvalidOpcode(op) => write!(f, "invalid opcode: {}", op),
            BytecodeError::TruncatedInstruction(off) => {
                write!(f, "truncated instruction at offset {}", off)
            }
            BytecodeError::MissingTerminator => {
                write!(f, "function does not end with a return-class instruction")
            }
            BytecodeError::BadJumpTarget(off) => write!(f, "bad jump target at offset {}", off),
        }
    }
}

impl std::error::Error for BytecodeError {}

/// Verify that `bytecode` decodes as a sequence of instructions ending
/// exactly at its length with a return-class terminator, and that all jumps
/// land on instruction boundaries.
pub fn verify_bytecode(bytecode: &[u8]) -> Result<(), BytecodeError> {
    let mut boundaries = vec![false; bytecode.len() + 1];
    let mut jumps: Vec<(u32, i64)> = Vec::new();
    let mut off = 0usize;
    let mut last_op = None;
    while off < bytecode.len() {
        let op = OpCode::from_u8(bytecode[off])
            .ok_or(BytecodeError::InvalidOpcode(bytecode[off]))?;
        let len = op.inst_length();
        if off + len > bytecode.len() {
            return Err(BytecodeError::TruncatedInstruction(off as u32));
        }
        boundaries[off] = true;
        if matches!(
            op,
            OpCode::Jmp
                | OpCode::JGreater
                | OpCode::JGreaterEqual
                | OpCode::JNotGreater
                | OpCode::JNotGreaterEqual
                | OpCode::JGreaterN
                | OpCode::JGreaterEqualN
                | OpCode::JNotGreaterN
                | OpCode::JNotGreaterEqualN
        ) {
            let rel = i16::from_le_bytes([bytecode[off + 1], bytecode[off + 2]]) as i64;
            jumps.push((off as u32, off as i64 + rel));
        }
        last_op = Some(op);
        off += len;
    }
    match last_op {
        Some(op) if op.is_return_class() => {}
        _ => return Err(BytecodeError::MissingTerminator),
    }
    for (from, target) in jumps {
        if target < 0 || target as usize >= bytecode.len() || !boundaries[target as usize] {
            return Err(BytecodeError::BadJumpTarget(from));
        }
    }
    Ok(())
}

/// The provider surface the runtime consumes bytecode through.
///
/// Implementations must keep each function's bytecode at a stable address
/// once it has been materialized: code blocks retain raw pointers into it.
pub trait BytecodeProvider {
    fn function_count(&self) -> u32;
    fn function_header(&self, function_id: u32) -> RuntimeFunctionHeader;
    /// Opcode bytes of the function. `None` while the function is lazy.
    fn bytecode(&self, function_id: u32) -> Option<&[u8]>;
    fn exception_table(&self, function_id: u32) -> &[ExceptionHandler];
    /// Source span of a lazy function, if any.
    fn lazy_source_span(&self, function_id: u32) -> Option<SourceSpan>;
    /// Hand the lazy function to the front end and install its bytecode.
    /// After a successful return, `bytecode(function_id)` is `Some` and the
    /// header reflects the compiled body.
    fn compile_lazy_function(&mut self, function_id: u32) -> Result<(), CompileError>;
    /// Interned string table access.
    fn string(&self, string_id: u32) -> &str;
    fn string_count(&self) -> u32;
    fn debug_info(&self) -> Option<&DebugInfo>;
    /// ID of the module's global (top level) function.
    fn global_function_id(&self) -> u32;
}

/// Data held for one function by the in-memory provider.
struct ModuleFunction {
    header: RuntimeFunctionHeader,
    /// Boxed so the address survives vector growth.
    bytecode: Option<Box<[u8]>>,
    exception_table: Vec<ExceptionHandler>,
    lazy: Option<LazyFunction>,
}

/// A function whose body the front end has not produced yet. The in-memory
/// provider models the front-end handoff by carrying the compile result the
/// builder supplied.
struct LazyFunction {
    span: SourceSpan,
    result: Result<(RuntimeFunctionHeader, Box<[u8]>), CompileError>,
}

/// In-memory bytecode module: the `BytecodeProvider` used by the CLI and
/// the tests.
pub struct BytecodeModule {
    functions: Vec<ModuleFunction>,
    strings: Vec<String>,
    debug_info: Option<DebugInfo>,
    global_function_id: u32,
}

impl BytecodeModule {
    pub fn builder() -> BytecodeModuleBuilder {
        BytecodeModuleBuilder::default()
    }
}

impl BytecodeProvider for BytecodeModule {
    fn function_count(&self) -> u32 {
        self.functions.len() as u32
    }

    fn function_header(&self, function_id: u32) -> RuntimeFunctionHeader {
        self.functions[function_id as usize].header
    }

    fn bytecode(&self, function_id: u32) -> Option<&[u8]> {
        self.functions[function_id as usize]
            .bytecode
            .as_deref()
    }

    fn exception_table(&self, function_id: u32) -> &[ExceptionHandler] {
        &self.functions[function_id as usize].exception_table
    }

    fn lazy_source_span(&self, function_id: u32) -> Option<SourceSpan> {
        self.functions[function_id as usize]
            .lazy
            .as_ref()
            .map(|l| l.span)
    }

    fn compile_lazy_function(&mut self, function_id: u32) -> Result<(), CompileError> {
        let func = &mut self.functions[function_id as usize];
        let lazy = match func.lazy.take() {
            Some(lazy) => lazy,
            None => return Ok(()),
        };
        match lazy.result {
            Ok((header, bytecode)) => {
                func.header = header;
                func.header.bytecode_size = bytecode.len() as u32;
                func.bytecode = Some(bytecode);
                Ok(())
            }
            Err(e) => {
                // Keep the function lazy so a later attempt fails the same way.
                func.lazy = Some(LazyFunction {
                    span: lazy.span,
                    result: Err(e.clone()),
                });
                Err(e)
            }
        }
    }

    fn string(&self, string_id: u32) -> &str {
        &self.strings[string_id as usize]
    }

    fn string_count(&self) -> u32 {
        self.strings.len() as u32
    }

    fn debug_info(&self) -> Option<&DebugInfo> {
        self.debug_info.as_ref()
    }

    fn global_function_id(&self) -> u32 {
        self.global_function_id
    }
}

/// Builder for `BytecodeModule`.
#[derive(Default)]
pub struct BytecodeModuleBuilder {
    functions: Vec<ModuleFunction>,
    strings: Vec<String>,
    debug_info: Option<DebugInfo>,
    global_function_id: u32,
}

impl BytecodeModuleBuilder {
    /// Intern a string and return its ID.
    pub fn add_string(&mut self, s: &str) -> u32 {
        if let Some(pos) = self.strings.iter().position(|existing| existing == s) {
            return pos as u32;
        }
        self.strings.push(s.to_string());
        (self.strings.len() - 1) as u32
    }

    /// Add a function with materialized bytecode. Returns its function ID.
    pub fn add_function(
        &mut self,
        mut header: RuntimeFunctionHeader,
        bytecode: Vec<u8>,
        exception_table: Vec<ExceptionHandler>,
    ) -> u32 {
        header.bytecode_size = bytecode.len() as u32;
        self.functions.push(ModuleFunction {
            header,
            bytecode: Some(bytecode.into_boxed_slice()),
            exception_table,
            lazy: None,
        });
        (self.functions.len() - 1) as u32
    }

    /// Add a lazy function. `result` is what the front end will produce
    /// when `compile_lazy_function` runs.
    pub fn add_lazy_function(
        &mut self,
        header: RuntimeFunctionHeader,
        span: SourceSpan,
        result: Result<(RuntimeFunctionHeader, Vec<u8>), CompileError>,
    ) -> u32 {
        self.functions.push(ModuleFunction {
            header,
            bytecode: None,
            exception_table: Vec::new(),
            lazy: Some(LazyFunction {
                span,
                result: result.map(|(h, b)| (h, b.into_boxed_slice())),
            }),
        });
        (self.functions.len() - 1) as u32
    }

    pub fn set_global_function(&mut self, function_id: u32) {
        self.global_function_id = function_id;
    }

    pub fn set_debug_info(&mut self, debug_info: DebugInfo) {
        self.debug_info = Some(debug_info);
    }

    pub fn build(self) -> BytecodeModule {
        BytecodeModule {
            functions: self.functions,
            strings: self.strings,
            debug_info: self.debug_info,
            global_function_id: self.global_function_id,
        }
    }
}

/// Small helper for assembling instruction bytes in tests and the CLI.
#[derive(Default)]
pub struct BytecodeBuilder {
    bytes: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.bytes.push(op as u8);
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.bytes.push(v);
        self
    }

    pub fn i16(&mut self, v: i16) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_bits().to_le_bytes());
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ret_body() -> Vec<u8> {
        let mut b = BytecodeBuilder::new();
        b.op(OpCode::LoadConstUndefined).u8(0);
        b.op(OpCode::Ret).u8(0);
        b.finish()
    }

    #[test]
    fn test_verify_accepts_minimal_body() {
        assert!(verify_bytecode(&ret_body()).is_ok());
    }

    #[test]
    fn test_verify_rejects_missing_terminator() {
        let mut b = BytecodeBuilder::new();
        b.op(OpCode::LoadConstUndefined).u8(0);
        let err = verify_bytecode(&b.finish()).unwrap_err();
        assert!(matches!(err, BytecodeError::MissingTerminator));
    }

    #[test]
    fn test_verify_rejects_truncation() {
        let body = vec![OpCode::LoadConstDouble as u8, 0, 1, 2];
        let err = verify_bytecode(&body).unwrap_err();
        assert!(matches!(err, BytecodeError::TruncatedInstruction(0)));
    }

    #[test]
    fn test_verify_rejects_misaligned_jump() {
        let mut b = BytecodeBuilder::new();
        // Jumps into the middle of the Ret instruction's operand.
        b.op(OpCode::Jmp).i16(4);
        b.op(OpCode::Ret).u8(0);
        let err = verify_bytecode(&b.finish()).unwrap_err();
        assert!(matches!(err, BytecodeError::BadJumpTarget(0)));
    }

    #[test]
    fn test_verify_accepts_backward_jump() {
        let mut b = BytecodeBuilder::new();
        b.op(OpCode::LoadConstUndefined).u8(0); // offset 0
        b.op(OpCode::Jmp).i16(-2); // offset 2, back to 0
        b.op(OpCode::Ret).u8(0);
        assert!(verify_bytecode(&b.finish()).is_ok());
    }

    #[test]
    fn test_lazy_function_materializes() {
        let mut builder = BytecodeModule::builder();
        let span = SourceSpan {
            start_line: 2,
            start_col: 1,
            end_line: 4,
            end_col: 2,
        };
        let compiled = RuntimeFunctionHeader {
            frame_size: 4,
            ..Default::default()
        };
        let id = builder.add_lazy_function(
            RuntimeFunctionHeader::default(),
            span,
            Ok((compiled, ret_body())),
        );
        let mut module = builder.build();
        assert!(module.bytecode(id).is_none());
        assert!(module.lazy_source_span(id).is_some());
        module.compile_lazy_function(id).unwrap();
        assert!(module.bytecode(id).is_some());
        assert_eq!(module.function_header(id).frame_size, 4);
        assert!(module.lazy_source_span(id).is_none());
    }
}
