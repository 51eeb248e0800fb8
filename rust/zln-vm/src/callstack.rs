//! Call stack and activation records.
//!
//! Frames and register windows live in two caller-supplied segments sized
//! up front for `max_depth` frames. Pushing a frame never allocates: the
//! new window starts `register_count` registers past the caller's.
//!
//! Frame layout (16 bytes, little-endian):
//! ```text
//! meta u32 | ret_register u32 | ret_pc u32 | register_base u32
//! ```

use crate::error::VmError;
use crate::memory::{self, Addr, Segment};
use crate::register::{Register, RegisterWindow, REGISTER_SIZE};
use serde::Serialize;

pub const FRAME_SIZE: usize = 16;

/// One activation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    /// Const address of the executing function's `FunctionMeta`.
    pub meta: Addr,
    /// Caller register receiving the return value.
    pub ret_register: u32,
    /// Caller pc to resume at, relative to the caller's `base_pc`.
    pub ret_pc: u32,
    /// Index of this frame's first register in the register segment.
    pub register_base: u32,
}

impl StackFrame {
    fn read(frames: &[u8], index: usize) -> Result<Self, VmError> {
        let at = index * FRAME_SIZE;
        Ok(Self {
            meta: memory::read_u32(frames, Segment::Frame, at)?,
            ret_register: memory::read_u32(frames, Segment::Frame, at + 4)?,
            ret_pc: memory::read_u32(frames, Segment::Frame, at + 8)?,
            register_base: memory::read_u32(frames, Segment::Frame, at + 12)?,
        })
    }

    fn write(&self, frames: &mut [u8], index: usize) -> Result<(), VmError> {
        let at = index * FRAME_SIZE;
        memory::write_u32(frames, Segment::Frame, at, self.meta)?;
        memory::write_u32(frames, Segment::Frame, at + 4, self.ret_register)?;
        memory::write_u32(frames, Segment::Frame, at + 8, self.ret_pc)?;
        memory::write_u32(frames, Segment::Frame, at + 12, self.register_base)
    }
}

pub struct CallStack<'m> {
    registers: &'m mut [u8],
    frames: &'m mut [u8],
    max_depth: usize,
    register_count: usize,
    depth: usize,
}

impl<'m> CallStack<'m> {
    /// Create a stack whose base frame runs `entry_point`.
    pub fn new(
        registers: &'m mut [u8],
        frames: &'m mut [u8],
        max_depth: usize,
        register_count: usize,
        entry_point: Addr,
    ) -> Result<Self, VmError> {
        if max_depth == 0 || register_count == 0 {
            return Err(VmError::Runtime(format!(
                "call stack needs at least one frame and one register (depth {}, registers {})",
                max_depth, register_count
            )));
        }
        let register_bytes = max_depth * register_count * REGISTER_SIZE;
        if registers.len() < register_bytes {
            return Err(VmError::MemoryTooSmall {
                required: register_bytes,
                actual: registers.len(),
            });
        }
        if frames.len() < max_depth * FRAME_SIZE {
            return Err(VmError::MemoryTooSmall {
                required: max_depth * FRAME_SIZE,
                actual: frames.len(),
            });
        }
        let mut stack = Self {
            registers,
            frames,
            max_depth,
            register_count,
            depth: 0,
        };
        stack.install(StackFrame {
            meta: entry_point,
            ret_register: 0,
            ret_pc: 0,
            register_base: 0,
        })?;
        Ok(stack)
    }

    /// Number of active frames, base frame included.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn register_count(&self) -> usize {
        self.register_count
    }

    /// Frame at `index`, counted from the base frame.
    pub fn frame(&self, index: usize) -> Result<StackFrame, VmError> {
        if index >= self.depth {
            return Err(VmError::StackUnderflow);
        }
        StackFrame::read(self.frames, index)
    }

    pub fn top(&self) -> Result<StackFrame, VmError> {
        self.frame(self.depth - 1)
    }

    fn install(&mut self, frame: StackFrame) -> Result<(), VmError> {
        frame.write(self.frames, self.depth)?;
        let start = frame.register_base as usize * REGISTER_SIZE;
        memory::slice_mut(
            self.registers,
            Segment::Register,
            start,
            self.register_count * REGISTER_SIZE,
        )?
        .fill(0);
        self.depth += 1;
        Ok(())
    }

    /// Push a frame for `meta`. The callee window starts zeroed.
    pub fn push(
        &mut self,
        meta: Addr,
        ret_register: u8,
        ret_pc: u32,
    ) -> Result<StackFrame, VmError> {
        if self.depth == self.max_depth {
            return Err(VmError::StackOverflow(self.max_depth));
        }
        let caller = self.top()?;
        let frame = StackFrame {
            meta,
            ret_register: ret_register as u32,
            ret_pc,
            register_base: caller.register_base + self.register_count as u32,
        };
        self.install(frame)?;
        Ok(frame)
    }

    /// Pop the active frame. The base frame cannot be popped.
    pub fn pop(&mut self) -> Result<StackFrame, VmError> {
        if self.depth <= 1 {
            return Err(VmError::StackUnderflow);
        }
        let frame = self.top()?;
        self.depth -= 1;
        Ok(frame)
    }

    fn register_offset(&self, frame: &StackFrame, index: usize) -> Result<usize, VmError> {
        if index >= self.register_count {
            return Err(VmError::RegisterOutOfBounds(index));
        }
        Ok((frame.register_base as usize + index) * REGISTER_SIZE)
    }

    pub fn reg(&self, index: u8) -> Result<Register, VmError> {
        let at = self.register_offset(&self.top()?, index as usize)?;
        memory::read_u64(self.registers, Segment::Register, at).map(Register::from_bits)
    }

    pub fn set_reg(&mut self, index: u8, value: Register) -> Result<(), VmError> {
        let at = self.register_offset(&self.top()?, index as usize)?;
        memory::write_u64(self.registers, Segment::Register, at, value.bits())
    }

    /// Copy `count` caller registers starting at `first` into the active
    /// window starting at register 1.
    pub fn copy_args(&mut self, first: u8, count: usize) -> Result<(), VmError> {
        if count == 0 {
            return Ok(());
        }
        if self.depth < 2 {
            return Err(VmError::StackUnderflow);
        }
        let caller = self.frame(self.depth - 2)?;
        let callee = self.top()?;
        let first = first as usize;
        let src = self.register_offset(&caller, first)?;
        self.register_offset(&caller, first + count - 1)?;
        let dst = self.register_offset(&callee, 1)?;
        self.register_offset(&callee, count)?;
        self.registers
            .copy_within(src..src + count * REGISTER_SIZE, dst);
        Ok(())
    }

    /// Register window of the frame at `index`.
    pub fn window_at(&self, index: usize) -> Result<RegisterWindow<'_>, VmError> {
        let frame = self.frame(index)?;
        let start = frame.register_base as usize * REGISTER_SIZE;
        let bytes = memory::slice(
            self.registers,
            Segment::Register,
            start,
            self.register_count * REGISTER_SIZE,
        )?;
        Ok(RegisterWindow::new(bytes))
    }

    pub fn window(&self) -> Result<RegisterWindow<'_>, VmError> {
        self.window_at(self.depth - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers(depth: usize, regs: usize) -> (Vec<u8>, Vec<u8>) {
        (vec![0xaa; depth * regs * REGISTER_SIZE], vec![0; depth * FRAME_SIZE])
    }

    #[test]
    fn base_frame_is_installed() {
        let (mut regs, mut frames) = buffers(4, 8);
        let stack = CallStack::new(&mut regs, &mut frames, 4, 8, 77).unwrap();
        assert_eq!(stack.depth(), 1);
        let top = stack.top().unwrap();
        assert_eq!(top.meta, 77);
        assert_eq!(top.register_base, 0);
        assert_eq!(stack.reg(3).unwrap(), Register::ZERO);
    }

    #[test]
    fn push_offsets_window_and_pop_restores() {
        let (mut regs, mut frames) = buffers(4, 8);
        let mut stack = CallStack::new(&mut regs, &mut frames, 4, 8, 0).unwrap();
        stack.set_reg(2, Register::from_i32(42)).unwrap();
        stack.set_reg(3, Register::from_i32(43)).unwrap();

        let frame = stack.push(20, 5, 16).unwrap();
        assert_eq!(frame.register_base, 8);
        assert_eq!(stack.depth(), 2);
        stack.copy_args(2, 2).unwrap();
        assert_eq!(stack.reg(1).unwrap().as_i32(), 42);
        assert_eq!(stack.reg(2).unwrap().as_i32(), 43);
        stack.set_reg(2, Register::from_i32(-1)).unwrap();

        let popped = stack.pop().unwrap();
        assert_eq!(popped, frame);
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.reg(2).unwrap().as_i32(), 42);
    }

    #[test]
    fn overflow_and_underflow_are_fatal() {
        let (mut regs, mut frames) = buffers(2, 4);
        let mut stack = CallStack::new(&mut regs, &mut frames, 2, 4, 0).unwrap();
        assert!(matches!(stack.pop(), Err(VmError::StackUnderflow)));
        stack.push(0, 0, 0).unwrap();
        assert!(matches!(stack.push(0, 0, 0), Err(VmError::StackOverflow(2))));
    }

    #[test]
    fn register_index_is_bounded() {
        let (mut regs, mut frames) = buffers(2, 4);
        let mut stack = CallStack::new(&mut regs, &mut frames, 2, 4, 0).unwrap();
        assert!(matches!(stack.reg(4), Err(VmError::RegisterOutOfBounds(4))));
        stack.push(0, 0, 0).unwrap();
        assert!(matches!(
            stack.copy_args(2, 3),
            Err(VmError::RegisterOutOfBounds(4))
        ));
    }

    #[test]
    fn undersized_buffers_are_rejected() {
        let mut regs = vec![0; 10];
        let mut frames = vec![0; 64];
        assert!(matches!(
            CallStack::new(&mut regs, &mut frames, 2, 4, 0),
            Err(VmError::MemoryTooSmall { .. })
        ));
    }
}
