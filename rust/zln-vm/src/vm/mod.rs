//! Register VM dispatch loop.
//!
//! `Cpu` owns views into every segment of the execution buffer for the
//! duration of one run: the code and const segments shared, the globals,
//! register bank, frames and heap exclusively.

mod intrinsics;
mod ops;

pub use intrinsics::{BuiltInFunction, LIST_ARRAY_OFFSET, LIST_GROWTH, LIST_SIZE_OFFSET};

use crate::callstack::{CallStack, StackFrame};
use crate::error::{TraceFrame, VmError};
use crate::heap::Heap;
use crate::memory::{self, Addr, MemoryLayout, Segment, Segments};
use crate::opcode::{Instruction, OpCode};
use crate::register::{Register, RegisterWindow};
use crate::types::{FunctionMeta, Type};
use std::fmt;
use tracing::{debug, error, trace};

/// Type alias for the per-instruction debug callback.
pub type DebugCallback = Option<Box<dyn FnMut(&DebugStep<'_>)>>;
/// Type alias for the sink of the `Print` built-in.
pub type PrintCallback = Option<Box<dyn FnMut(&str)>>;

/// Machine state handed to the debug callback before each instruction
/// executes.
#[derive(Debug)]
pub struct DebugStep<'a> {
    pub pc: u32,
    pub base_pc: u32,
    pub instruction: &'a Instruction,
    pub stack_depth: usize,
    pub frame: StackFrame,
    pub function: &'a str,
    pub registers: RegisterWindow<'a>,
}

#[derive(Default)]
pub struct RuntimeConfig {
    pub debug_callback: DebugCallback,
    pub print_callback: PrintCallback,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debug_callback(mut self, callback: impl FnMut(&DebugStep<'_>) + 'static) -> Self {
        self.debug_callback = Some(Box::new(callback));
        self
    }

    pub fn with_print_callback(mut self, callback: impl FnMut(&str) + 'static) -> Self {
        self.print_callback = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("debug_callback", &self.debug_callback.is_some())
            .field("print_callback", &self.print_callback.is_some())
            .finish()
    }
}

enum Flow {
    Next,
    Jump,
    Halt,
}

pub struct Cpu<'m> {
    code: &'m [u8],
    consts: &'m [u8],
    globals: &'m mut [u8],
    stack: CallStack<'m>,
    heap: Heap<'m>,
    config: RuntimeConfig,
    base_pc: u32,
    pc: u32,
    steps: u64,
}

/// Run the function described at const address `entry_point` until it
/// halts.
pub fn execute(
    memory: &mut [u8],
    layout: &MemoryLayout,
    entry_point: Addr,
    config: RuntimeConfig,
) -> Result<(), VmError> {
    let segments = layout.split(memory)?;
    Cpu::new(segments, layout, entry_point, config)?.run()
}

impl<'m> Cpu<'m> {
    pub fn new(
        segments: Segments<'m>,
        layout: &MemoryLayout,
        entry_point: Addr,
        config: RuntimeConfig,
    ) -> Result<Self, VmError> {
        let entry = FunctionMeta::read(segments.consts, entry_point)?;
        let stack = CallStack::new(
            segments.registers,
            segments.frames,
            layout.max_stack_depth as usize,
            layout.register_count as usize,
            entry_point,
        )?;
        let heap = Heap::new(segments.heap, segments.consts)?;
        Ok(Self {
            code: segments.code,
            consts: segments.consts,
            globals: segments.globals,
            stack,
            heap,
            config,
            base_pc: entry.base_pc,
            pc: entry.pc,
            steps: 0,
        })
    }

    pub fn heap(&self) -> &Heap<'m> {
        &self.heap
    }

    pub fn stack(&self) -> &CallStack<'m> {
        &self.stack
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn base_pc(&self) -> u32 {
        self.base_pc
    }

    /// Instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Execute until `Halt`. Errors carry the call chain active when they
    /// were raised.
    pub fn run(&mut self) -> Result<(), VmError> {
        if let Err(err) = self.run_loop() {
            let err = err.with_stack_trace(self.stack_trace());
            error!(
                error = %err.message(),
                pc = self.pc,
                depth = self.stack.depth(),
                "execution aborted"
            );
            return Err(err);
        }
        debug!(steps = self.steps, heap_tail = self.heap.tail(), "halted");
        Ok(())
    }

    fn run_loop(&mut self) -> Result<(), VmError> {
        loop {
            let offset = self.base_pc as usize + self.pc as usize;
            let instr = Instruction::decode(self.code, offset)?;
            self.emit_debug_step(&instr)?;
            self.steps += 1;
            match self.step(&instr)? {
                Flow::Next => self.pc += instr.encoded_len() as u32,
                Flow::Jump => {}
                Flow::Halt => return Ok(()),
            }
        }
    }

    fn emit_debug_step(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let Some(callback) = self.config.debug_callback.as_mut() else {
            return Ok(());
        };
        let frame = self.stack.top()?;
        let function = FunctionMeta::read(self.consts, frame.meta)?.name(self.consts)?;
        let step = DebugStep {
            pc: self.pc,
            base_pc: self.base_pc,
            instruction: instr,
            stack_depth: self.stack.depth(),
            frame,
            function,
            registers: self.stack.window()?,
        };
        callback(&step);
        Ok(())
    }

    /// Function names and pcs of the active frames, base frame first.
    fn stack_trace(&self) -> Vec<TraceFrame> {
        let depth = self.stack.depth();
        (0..depth)
            .filter_map(|i| {
                let frame = self.stack.frame(i).ok()?;
                let pc = if i + 1 == depth {
                    self.pc
                } else {
                    self.stack.frame(i + 1).ok()?.ret_pc
                };
                let function = FunctionMeta::read(self.consts, frame.meta)
                    .and_then(|meta| meta.name(self.consts).map(str::to_string))
                    .unwrap_or_else(|_| format!("<function @{}>", frame.meta));
                Some(TraceFrame { function, pc })
            })
            .collect()
    }

    fn reg(&self, index: u8) -> Result<Register, VmError> {
        self.stack.reg(index)
    }

    fn set(&mut self, index: u8, value: Register) -> Result<(), VmError> {
        self.stack.set_reg(index, value)
    }

    /// Byte offset of element `index_reg` in the array at `array`.
    fn element_offset(&self, array: Addr, index_reg: u8, ty: Type) -> Result<usize, VmError> {
        let size = ty.size()?;
        let len = self.heap.entry(array)?.data_size as usize / size;
        let index = self.reg(index_reg)?.as_i32();
        match usize::try_from(index) {
            Ok(i) if i < len => Ok(i * size),
            _ => Err(VmError::IndexOutOfBounds {
                index: index as i64,
                len,
            }),
        }
    }

    /// Push a frame for `callee` and jump to its entry.
    fn enter(&mut self, callee: FunctionMeta, instr: &Instruction) -> Result<(), VmError> {
        let ret_pc = self.pc + instr.encoded_len() as u32;
        self.stack.push(callee.addr, instr.a, ret_pc)?;
        self.stack.copy_args(instr.b, callee.arg_count as usize)?;
        trace!(function = callee.addr, depth = self.stack.depth(), "call");
        self.base_pc = callee.base_pc;
        self.pc = callee.pc;
        Ok(())
    }

    /// Pop the active frame and resume the caller.
    fn leave(&mut self) -> Result<(), VmError> {
        let callee = FunctionMeta::read(self.consts, self.stack.top()?.meta)?;
        let result = self.reg(0)?;
        let frame = self.stack.pop()?;
        if callee.ret_type != Type::Void {
            self.set(frame.ret_register as u8, result)?;
        }
        let caller = FunctionMeta::read(self.consts, self.stack.top()?.meta)?;
        trace!(function = callee.addr, depth = self.stack.depth(), "return");
        self.base_pc = caller.base_pc;
        self.pc = frame.ret_pc;
        Ok(())
    }

    fn step(&mut self, instr: &Instruction) -> Result<Flow, VmError> {
        use OpCode::*;
        let op = instr.op;
        let ty = || {
            op.value_type()
                .ok_or_else(|| VmError::Runtime(format!("{} has no operand type", op.name())))
        };
        match op {
            Nop => {}

            LdGlbI32 | LdGlbF64 | LdGlbU8 | LdGlbRef | LdGlbPtr => {
                let value =
                    memory::load_value(self.globals, Segment::Global, instr.imm as usize, ty()?)?;
                self.set(instr.a, value)?;
            }
            StGlbI32 | StGlbF64 | StGlbU8 | StGlbRef | StGlbPtr => {
                let value = self.reg(instr.a)?;
                let at = instr.imm as usize;
                memory::store_value(self.globals, Segment::Global, at, ty()?, value)?;
            }
            LdFldI32 | LdFldF64 | LdFldU8 | LdFldRef | LdFldPtr => {
                let entry = self.reg(instr.b)?.as_ref();
                let value = self.heap.load(entry, instr.imm as usize, ty()?)?;
                self.set(instr.a, value)?;
            }
            StFldI32 | StFldF64 | StFldU8 | StFldRef | StFldPtr => {
                let value = self.reg(instr.a)?;
                let entry = self.reg(instr.b)?.as_ref();
                self.heap.store(entry, instr.imm as usize, ty()?, value)?;
            }
            LdElemI32 | LdElemF64 | LdElemU8 | LdElemRef | LdElemPtr => {
                let array = self.reg(instr.b)?.as_ref();
                let offset = self.element_offset(array, instr.c, ty()?)?;
                let value = self.heap.load(array, offset, ty()?)?;
                self.set(instr.a, value)?;
            }
            StElemI32 | StElemF64 | StElemU8 | StElemRef | StElemPtr => {
                let value = self.reg(instr.a)?;
                let array = self.reg(instr.b)?.as_ref();
                let offset = self.element_offset(array, instr.c, ty()?)?;
                self.heap.store(array, offset, ty()?, value)?;
            }

            LdcI32 => self.set(instr.a, Register::from_i32(instr.imm as i32))?,
            LdcStr => {
                let addr = self.heap.alloc_string(instr.imm)?;
                self.set(instr.a, Register::from_ref(addr))?;
            }
            LdcF64 => {
                let value = memory::read_f64(self.consts, Segment::Const, instr.imm as usize)?;
                self.set(instr.a, Register::from_f64(value))?;
            }
            LdcZero => self.set(instr.a, Register::ZERO)?,

            AddStr => {
                let (l, r) = (self.reg(instr.b)?.as_ref(), self.reg(instr.c)?.as_ref());
                let addr = ops::concat(&mut self.heap, l, r)?;
                self.set(instr.a, Register::from_ref(addr))?;
            }
            AddI32 | AddF64 | AddU8 | SubI32 | SubF64 | SubU8 | MulI32 | MulF64 | MulU8
            | DivI32 | DivF64 | DivU8 | ModI32 | ModF64 | ModU8 | BandI32 | BandU8 | BorI32
            | BorU8 | XorI32 | XorU8 | LShiftI32 | LShiftU8 | RShiftI32 | RShiftU8 => {
                let arith = op.arith_op().ok_or_else(|| {
                    VmError::Runtime(format!("{} is not arithmetic", op.name()))
                })?;
                let value = ops::arith(arith, ty()?, self.reg(instr.b)?, self.reg(instr.c)?)?;
                self.set(instr.a, value)?;
            }

            EqI32 | EqF64 | EqU8 | EqStr | EqRef | EqPtr | NeI32 | NeF64 | NeU8 | NeStr
            | NeRef | NePtr | GtI32 | GtF64 | GtU8 | GtStr | GeI32 | GeF64 | GeU8 | GeStr
            | LtI32 | LtF64 | LtU8 | LtStr | LeI32 | LeF64 | LeU8 | LeStr => {
                let cmp = op.cmp_op().ok_or_else(|| {
                    VmError::Runtime(format!("{} is not a comparison", op.name()))
                })?;
                let (l, r) = (self.reg(instr.b)?, self.reg(instr.c)?);
                let holds = match ty()? {
                    Type::String => {
                        ops::compare_str(cmp, &self.heap.view(), l.as_ref(), r.as_ref())?
                    }
                    other => ops::compare(cmp, other, l, r)?,
                };
                self.set(instr.a, Register::from_bool(holds))?;
            }

            And => {
                let holds = self.reg(instr.b)?.is_true() && self.reg(instr.c)?.is_true();
                self.set(instr.a, Register::from_bool(holds))?;
            }
            Or => {
                let holds = self.reg(instr.b)?.is_true() || self.reg(instr.c)?.is_true();
                self.set(instr.a, Register::from_bool(holds))?;
            }
            Mov => {
                let value = self.reg(instr.b)?;
                self.set(instr.a, value)?;
            }

            BrZero => {
                if !self.reg(instr.a)?.is_true() {
                    self.pc = instr.imm;
                    return Ok(Flow::Jump);
                }
            }
            Br => {
                self.pc = instr.imm;
                return Ok(Flow::Jump);
            }
            Call => {
                let callee = FunctionMeta::read(self.consts, instr.imm)?;
                self.enter(callee, instr)?;
                return Ok(Flow::Jump);
            }
            CallVirt => {
                let this = self.reg(instr.b)?.as_ref();
                let view = self.heap.view();
                let callee = match view.get_impl_function(this, instr.imm)? {
                    Some(callee) => callee,
                    None => {
                        let type_name = match view.instance_type(this)? {
                            Some(meta) => meta.name()?.to_string(),
                            None => view.type_name(&view.entry(this)?)?,
                        };
                        return Err(VmError::MissingOverride {
                            type_name,
                            virtual_function: instr.imm,
                        });
                    }
                };
                self.enter(callee, instr)?;
                return Ok(Flow::Jump);
            }
            Ret => {
                self.leave()?;
                return Ok(Flow::Jump);
            }
            Halt => return Ok(Flow::Halt),

            ConvI32 | ConvF64 | ConvU8 | ConvStr | ConvRef | ConvPtr => {
                let value = ops::convert(ty()?, instr.imm, self.reg(instr.b)?)?;
                self.set(instr.a, value)?;
            }

            NewObj => {
                let addr = self.heap.alloc_obj(instr.imm)?;
                self.set(instr.a, Register::from_ref(addr))?;
            }
            NewStr => {
                let addr = self.heap.alloc_array(Type::Unsigned8, instr.imm as usize)?;
                self.set(instr.a, Register::from_ref(addr))?;
            }
            NewArrI32 | NewArrF64 | NewArrU8 | NewArrRef | NewArrPtr => {
                let count = self.reg(instr.b)?.as_i32();
                let count = usize::try_from(count).map_err(|_| {
                    VmError::Runtime(format!("negative array length {}", count))
                })?;
                let addr = self.heap.alloc_array(ty()?, count)?;
                self.set(instr.a, Register::from_ref(addr))?;
            }
            AddRef => {
                let addr = self.reg(instr.a)?.as_ref();
                self.heap.add_ref(addr)?;
            }
            RemoveRef => {
                let addr = self.reg(instr.a)?.as_ref();
                self.heap.remove_ref(addr)?;
            }
            Invoke => intrinsics::invoke(self, instr.imm, instr.a, instr.b)?,
            TypeChk => {
                let source = self.reg(instr.b)?.as_ref();
                let holds = match source {
                    0 => false,
                    addr => match self.heap.view().instance_type(addr)? {
                        Some(meta) => meta.addr() == instr.imm || meta.implements(instr.imm)?,
                        None => false,
                    },
                };
                self.set(instr.a, Register::from_bool(holds))?;
            }
        }
        Ok(Flow::Next)
    }
}
