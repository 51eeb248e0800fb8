//! Hand assembly of programs.
//!
//! `ConstWriter` lays out const-segment records (literals, `FunctionMeta`,
//! `TypeMeta`) and `ProgramBuilder` collects code around it. Tests, benches
//! and the CLI demos build every program through these two types.

use crate::error::VmError;
use crate::memory::{Addr, MemoryLayout};
use crate::opcode::{Instruction, OpCode};
use crate::program::{LoadedProgram, ProgramHeader, DEFAULT_HEAP_SIZE};
use crate::types::{
    Type, VtableEntry, FUNCTION_META_HEADER_SIZE, MAX_IMPLEMENTED_INTERFACES, TYPE_META_NAME_SIZE,
};

/// Append-only const segment.
#[derive(Debug, Default, Clone)]
pub struct ConstWriter {
    bytes: Vec<u8>,
}

impl ConstWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn here(&self) -> Addr {
        self.bytes.len() as Addr
    }

    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) -> Addr {
        let addr = self.here();
        self.bytes.extend_from_slice(&v.to_le_bytes());
        addr
    }

    pub fn f64(&mut self, v: f64) -> Addr {
        let addr = self.here();
        self.bytes.extend_from_slice(&v.to_le_bytes());
        addr
    }

    /// Zero-terminated string literal.
    pub fn str(&mut self, s: &str) -> Addr {
        let addr = self.here();
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        addr
    }

    /// `FunctionMeta` with its entry left at 0; see `set_function_entry`.
    pub fn function(
        &mut self,
        name: &str,
        arg_count: u32,
        local_count: u32,
        ret_type: Type,
    ) -> Addr {
        let addr = self.here();
        self.u32(0);
        self.u32(0);
        self.u32(local_count);
        self.u32(arg_count);
        self.bytes.push(ret_type.tag());
        debug_assert_eq!(self.bytes.len() - addr as usize, FUNCTION_META_HEADER_SIZE);
        self.str(name);
        addr
    }

    pub fn set_function_entry(&mut self, function: Addr, base_pc: u32, pc: u32) {
        let at = function as usize;
        self.bytes[at..at + 4].copy_from_slice(&base_pc.to_le_bytes());
        self.bytes[at + 4..at + 8].copy_from_slice(&pc.to_le_bytes());
    }

    /// `TypeMeta` record. Names longer than 63 bytes are truncated.
    ///
    /// # Panics
    ///
    /// Panics if `interfaces` has more than `MAX_IMPLEMENTED_INTERFACES`
    /// entries; the record's interface table has a fixed width.
    pub fn type_meta(
        &mut self,
        name: &str,
        interfaces: &[Addr],
        vtable: &[VtableEntry],
        fields: &[Type],
    ) -> Addr {
        assert!(
            interfaces.len() <= MAX_IMPLEMENTED_INTERFACES,
            "{} implements {} interfaces",
            name,
            interfaces.len()
        );
        let addr = self.here();
        let mut raw = [0u8; TYPE_META_NAME_SIZE];
        let len = name.len().min(TYPE_META_NAME_SIZE - 1);
        raw[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.bytes.extend_from_slice(&raw);

        self.u32(interfaces.len() as u32);
        for i in 0..MAX_IMPLEMENTED_INTERFACES {
            self.u32(interfaces.get(i).copied().unwrap_or(0));
        }
        for entry in vtable {
            self.u32(entry.virtual_function);
            self.u32(entry.implementation);
        }
        self.u32(0);
        self.u32(0);
        self.bytes.extend(fields.iter().map(|ty| ty.tag()));
        self.bytes.push(0);
        addr
    }

    /// Interfaces are field-less TypeMetas referenced by address.
    pub fn interface(&mut self, name: &str) -> Addr {
        self.type_meta(name, &[], &[], &[])
    }
}

/// Collects code and consts for a single-image program.
///
/// Each function gets its own module base: branch targets passed to `Br`
/// and `BrZero` are offsets from the start of the function being emitted,
/// which is what `pc()` returns.
#[derive(Debug, Clone)]
pub struct ProgramBuilder {
    code: Vec<u8>,
    consts: ConstWriter,
    base: usize,
    register_count: u32,
    max_stack_depth: u32,
    max_heap_size: u32,
    global_segment_size: u32,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self {
            code: Vec::new(),
            consts: ConstWriter::new(),
            base: 0,
            register_count: 16,
            max_stack_depth: 64,
            max_heap_size: 0,
            global_segment_size: 64,
        }
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registers(mut self, count: u32) -> Self {
        self.register_count = count;
        self
    }

    pub fn stack_depth(mut self, depth: u32) -> Self {
        self.max_stack_depth = depth;
        self
    }

    pub fn heap_size(mut self, bytes: u32) -> Self {
        self.max_heap_size = bytes;
        self
    }

    pub fn globals(mut self, bytes: u32) -> Self {
        self.global_segment_size = bytes;
        self
    }

    pub fn consts(&mut self) -> &mut ConstWriter {
        &mut self.consts
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Offset of the next instruction relative to the current function.
    pub fn pc(&self) -> u32 {
        (self.code.len() - self.base) as u32
    }

    /// Emit one instruction and return its function-relative offset.
    pub fn emit(&mut self, instr: Instruction) -> u32 {
        let at = self.pc();
        instr.encode(&mut self.code);
        at
    }

    /// Rewrite the immediate of the instruction at function-relative `at`,
    /// e.g. a forward branch target.
    pub fn patch_imm(&mut self, at: u32, imm: u32) -> Result<(), VmError> {
        let offset = self.base + at as usize;
        let instr = Instruction::decode(&self.code, offset)?;
        if instr.op.shape().encoded_len() < 5 {
            return Err(VmError::Runtime(format!("{} has no immediate", instr.op.name())));
        }
        let end = offset + instr.encoded_len();
        self.code[end - 4..end].copy_from_slice(&imm.to_le_bytes());
        Ok(())
    }

    /// Declare a function whose body is emitted later with `define_function`.
    pub fn declare_function(
        &mut self,
        name: &str,
        arg_count: u32,
        local_count: u32,
        ret_type: Type,
    ) -> Addr {
        self.consts.function(name, arg_count, local_count, ret_type)
    }

    /// Start the body of a declared function at the current code position.
    pub fn define_function(&mut self, function: Addr) {
        self.base = self.code.len();
        self.consts.set_function_entry(function, self.base as u32, 0);
    }

    pub fn begin_function(
        &mut self,
        name: &str,
        arg_count: u32,
        local_count: u32,
        ret_type: Type,
    ) -> Addr {
        let function = self.declare_function(name, arg_count, local_count, ret_type);
        self.define_function(function);
        function
    }

    pub fn layout(&self) -> MemoryLayout {
        MemoryLayout {
            code_segment_size: self.code.len() as u32,
            const_segment_size: self.consts.len() as u32,
            global_segment_size: self.global_segment_size,
            register_count: self.register_count,
            max_stack_depth: self.max_stack_depth,
            max_heap_size: self.max_heap_size,
        }
    }

    pub fn header(&self, entry_point: Addr) -> ProgramHeader {
        ProgramHeader::new(&self.layout(), entry_point)
    }

    /// Image file bytes: header, code, consts.
    pub fn image(&self, entry_point: Addr) -> Vec<u8> {
        let mut out = self.header(entry_point).encode().to_vec();
        out.extend_from_slice(&self.code);
        out.extend_from_slice(self.consts.as_bytes());
        out
    }

    pub fn load(&self, entry_point: Addr) -> Result<LoadedProgram, VmError> {
        let mut segments = self.code.clone();
        segments.extend_from_slice(self.consts.as_bytes());
        let heap_size = match self.max_heap_size {
            0 => DEFAULT_HEAP_SIZE,
            cap => cap as usize,
        };
        LoadedProgram::from_segments(self.header(entry_point), &segments, Some(heap_size))
    }
}

/// Shorthand for the common instruction shapes.
pub mod asm {
    use super::*;

    pub fn ldc_i32(r: u8, v: i32) -> Instruction {
        Instruction::reg_imm(OpCode::LdcI32, r, v as u32)
    }

    pub fn op3(op: OpCode, a: u8, b: u8, c: u8) -> Instruction {
        Instruction::reg3(op, a, b, c)
    }

    pub fn mov(a: u8, b: u8) -> Instruction {
        Instruction::reg2(OpCode::Mov, a, b)
    }

    pub fn call(ret: u8, first_arg: u8, function: Addr) -> Instruction {
        Instruction::reg2_imm(OpCode::Call, ret, first_arg, function)
    }

    pub fn invoke(ret: u8, first_arg: u8, built_in: u32) -> Instruction {
        Instruction::reg2_imm(OpCode::Invoke, ret, first_arg, built_in)
    }

    pub fn st_glb(op: OpCode, r: u8, offset: u32) -> Instruction {
        Instruction::reg_imm(op, r, offset)
    }

    pub fn ret() -> Instruction {
        Instruction::none(OpCode::Ret)
    }

    pub fn halt() -> Instruction {
        Instruction::none(OpCode::Halt)
    }
}
