//! Memory layout and bounds-checked byte access.
//!
//! The embedder hands the VM one contiguous buffer, sliced into six
//! segments in a fixed order:
//!
//! ```text
//! code | const | global | registers | stack frames | heap
//! ```
//!
//! Every address carried by an instruction is relative to the segment it
//! addresses. Multi-byte values are little-endian in every segment.

use crate::callstack::FRAME_SIZE;
use crate::error::VmError;
use crate::heap::HEAP_RESERVED_BYTES;
use crate::register::{Register, REGISTER_SIZE};
use crate::types::Type;
use serde::Serialize;
use std::fmt;

/// Segment-relative byte address.
pub type Addr = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Segment {
    Code,
    Const,
    Global,
    Register,
    Frame,
    Heap,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Segment::Code => "code",
            Segment::Const => "const",
            Segment::Global => "global",
            Segment::Register => "register",
            Segment::Frame => "frame",
            Segment::Heap => "heap",
        };
        f.write_str(name)
    }
}

// --- Byte access ---

pub fn slice(buf: &[u8], segment: Segment, offset: usize, len: usize) -> Result<&[u8], VmError> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or(VmError::SegmentOutOfBounds {
            segment,
            offset,
            len,
        })
}

pub fn slice_mut(
    buf: &mut [u8],
    segment: Segment,
    offset: usize,
    len: usize,
) -> Result<&mut [u8], VmError> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get_mut(offset..end))
        .ok_or(VmError::SegmentOutOfBounds {
            segment,
            offset,
            len,
        })
}

fn read_array<const N: usize>(
    buf: &[u8],
    segment: Segment,
    offset: usize,
) -> Result<[u8; N], VmError> {
    let mut out = [0u8; N];
    out.copy_from_slice(slice(buf, segment, offset, N)?);
    Ok(out)
}

pub fn read_u8(buf: &[u8], segment: Segment, offset: usize) -> Result<u8, VmError> {
    Ok(read_array::<1>(buf, segment, offset)?[0])
}

pub fn read_u32(buf: &[u8], segment: Segment, offset: usize) -> Result<u32, VmError> {
    read_array(buf, segment, offset).map(u32::from_le_bytes)
}

pub fn read_i32(buf: &[u8], segment: Segment, offset: usize) -> Result<i32, VmError> {
    read_array(buf, segment, offset).map(i32::from_le_bytes)
}

pub fn read_u64(buf: &[u8], segment: Segment, offset: usize) -> Result<u64, VmError> {
    read_array(buf, segment, offset).map(u64::from_le_bytes)
}

pub fn read_i64(buf: &[u8], segment: Segment, offset: usize) -> Result<i64, VmError> {
    read_array(buf, segment, offset).map(i64::from_le_bytes)
}

pub fn read_f64(buf: &[u8], segment: Segment, offset: usize) -> Result<f64, VmError> {
    read_array(buf, segment, offset).map(f64::from_le_bytes)
}

pub fn write_bytes(
    buf: &mut [u8],
    segment: Segment,
    offset: usize,
    bytes: &[u8],
) -> Result<(), VmError> {
    slice_mut(buf, segment, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

pub fn write_u8(buf: &mut [u8], segment: Segment, offset: usize, v: u8) -> Result<(), VmError> {
    write_bytes(buf, segment, offset, &[v])
}

pub fn write_u32(buf: &mut [u8], segment: Segment, offset: usize, v: u32) -> Result<(), VmError> {
    write_bytes(buf, segment, offset, &v.to_le_bytes())
}

pub fn write_i32(buf: &mut [u8], segment: Segment, offset: usize, v: i32) -> Result<(), VmError> {
    write_bytes(buf, segment, offset, &v.to_le_bytes())
}

pub fn write_u64(buf: &mut [u8], segment: Segment, offset: usize, v: u64) -> Result<(), VmError> {
    write_bytes(buf, segment, offset, &v.to_le_bytes())
}

pub fn write_i64(buf: &mut [u8], segment: Segment, offset: usize, v: i64) -> Result<(), VmError> {
    write_bytes(buf, segment, offset, &v.to_le_bytes())
}

pub fn write_f64(buf: &mut [u8], segment: Segment, offset: usize, v: f64) -> Result<(), VmError> {
    write_bytes(buf, segment, offset, &v.to_le_bytes())
}

/// Load a value of primitive type `ty` into a register. `Unsigned8`
/// zero-extends into the `i32` view.
pub fn load_value(
    buf: &[u8],
    segment: Segment,
    offset: usize,
    ty: Type,
) -> Result<Register, VmError> {
    Ok(match ty {
        Type::Int32 => Register::from_i32(read_i32(buf, segment, offset)?),
        Type::Float64 => Register::from_f64(read_f64(buf, segment, offset)?),
        Type::Unsigned8 => Register::from_i32(read_u8(buf, segment, offset)? as i32),
        Type::String | Type::Ref => Register::from_ref(read_u32(buf, segment, offset)?),
        Type::NativePtr => Register::from_ptr(read_i64(buf, segment, offset)?),
        Type::Void => return Err(VmError::InvalidType(0)),
    })
}

/// Store the `ty` view of `value`. `Unsigned8` keeps the low 8 bits.
pub fn store_value(
    buf: &mut [u8],
    segment: Segment,
    offset: usize,
    ty: Type,
    value: Register,
) -> Result<(), VmError> {
    match ty {
        Type::Int32 => write_i32(buf, segment, offset, value.as_i32()),
        Type::Float64 => write_f64(buf, segment, offset, value.as_f64()),
        Type::Unsigned8 => write_u8(buf, segment, offset, value.as_i32() as u8),
        Type::String | Type::Ref => write_u32(buf, segment, offset, value.as_ref()),
        Type::NativePtr => write_i64(buf, segment, offset, value.as_ptr()),
        Type::Void => Err(VmError::InvalidType(0)),
    }
}

/// Bytes of the zero-terminated string at `offset`, terminator excluded.
/// A string that runs off the end of the buffer is an out-of-bounds access.
pub fn read_cstr(buf: &[u8], segment: Segment, offset: usize) -> Result<&[u8], VmError> {
    let tail = buf.get(offset..).ok_or(VmError::SegmentOutOfBounds {
        segment,
        offset,
        len: 1,
    })?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(VmError::SegmentOutOfBounds {
            segment,
            offset,
            len: tail.len() + 1,
        })?;
    Ok(&tail[..len])
}

// --- Layout ---

/// Sizes of every segment of the execution buffer.
///
/// Boundaries are computed from the sizes alone; the heap takes whatever
/// is left after the stack-frame segment, capped by `max_heap_size` when
/// that is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryLayout {
    pub code_segment_size: u32,
    pub const_segment_size: u32,
    pub global_segment_size: u32,
    pub register_count: u32,
    pub max_stack_depth: u32,
    pub max_heap_size: u32,
}

/// The execution buffer split into its segments.
pub struct Segments<'m> {
    pub code: &'m [u8],
    pub consts: &'m [u8],
    pub globals: &'m mut [u8],
    pub registers: &'m mut [u8],
    pub frames: &'m mut [u8],
    pub heap: &'m mut [u8],
}

impl MemoryLayout {
    pub fn register_segment_size(&self) -> usize {
        self.register_count as usize * self.max_stack_depth as usize * REGISTER_SIZE
    }

    pub fn frame_segment_size(&self) -> usize {
        self.max_stack_depth as usize * FRAME_SIZE
    }

    pub fn const_offset(&self) -> usize {
        self.code_segment_size as usize
    }

    pub fn global_offset(&self) -> usize {
        self.const_offset() + self.const_segment_size as usize
    }

    pub fn register_offset(&self) -> usize {
        self.global_offset() + self.global_segment_size as usize
    }

    pub fn frame_offset(&self) -> usize {
        self.register_offset() + self.register_segment_size()
    }

    /// Byte offset where the heap segment begins.
    pub fn heap_offset(&self) -> usize {
        self.frame_offset() + self.frame_segment_size()
    }

    /// Smallest buffer that can host this layout with an empty heap.
    pub fn min_memory_size(&self) -> usize {
        self.heap_offset() + HEAP_RESERVED_BYTES
    }

    pub fn split<'m>(&self, memory: &'m mut [u8]) -> Result<Segments<'m>, VmError> {
        let required = self.min_memory_size();
        if memory.len() < required {
            return Err(VmError::MemoryTooSmall {
                required,
                actual: memory.len(),
            });
        }
        let (code, rest) = memory.split_at_mut(self.code_segment_size as usize);
        let (consts, rest) = rest.split_at_mut(self.const_segment_size as usize);
        let (globals, rest) = rest.split_at_mut(self.global_segment_size as usize);
        let (registers, rest) = rest.split_at_mut(self.register_segment_size());
        let (frames, rest) = rest.split_at_mut(self.frame_segment_size());
        let heap_len = match self.max_heap_size {
            0 => rest.len(),
            cap => rest.len().min(cap as usize),
        };
        Ok(Segments {
            code,
            consts,
            globals,
            registers,
            frames,
            heap: &mut rest[..heap_len],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> MemoryLayout {
        MemoryLayout {
            code_segment_size: 10,
            const_segment_size: 20,
            global_segment_size: 8,
            register_count: 4,
            max_stack_depth: 2,
            max_heap_size: 0,
        }
    }

    #[test]
    fn segment_offsets_follow_fixed_order() {
        let l = layout();
        assert_eq!(l.const_offset(), 10);
        assert_eq!(l.global_offset(), 30);
        assert_eq!(l.register_offset(), 38);
        assert_eq!(l.register_segment_size(), 64);
        assert_eq!(l.frame_offset(), 102);
        assert_eq!(l.heap_offset(), 102 + 2 * FRAME_SIZE);
    }

    #[test]
    fn split_rejects_short_buffer() {
        let mut memory = vec![0u8; 50];
        let err = layout().split(&mut memory).err().expect("must fail");
        assert!(matches!(err, VmError::MemoryTooSmall { actual: 50, .. }));
    }

    #[test]
    fn split_caps_heap() {
        let mut l = layout();
        l.max_heap_size = 64;
        let mut memory = vec![0u8; l.heap_offset() + 1000];
        let segments = l.split(&mut memory).expect("split");
        assert_eq!(segments.code.len(), 10);
        assert_eq!(segments.consts.len(), 20);
        assert_eq!(segments.globals.len(), 8);
        assert_eq!(segments.heap.len(), 64);
    }

    #[test]
    fn little_endian_round_trip_and_bounds() {
        let mut buf = [0u8; 12];
        write_i32(&mut buf, Segment::Global, 0, -2).unwrap();
        write_f64(&mut buf, Segment::Global, 4, 1000.125).unwrap();
        assert_eq!(buf[0..4], [0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(read_i32(&buf, Segment::Global, 0).unwrap(), -2);
        assert_eq!(read_f64(&buf, Segment::Global, 4).unwrap(), 1000.125);
        let err = read_u32(&buf, Segment::Global, 10).unwrap_err();
        assert!(matches!(
            err,
            VmError::SegmentOutOfBounds {
                segment: Segment::Global,
                offset: 10,
                len: 4
            }
        ));
    }

    #[test]
    fn typed_values_use_static_widths() {
        let mut buf = [0u8; 16];
        let g = Segment::Global;
        store_value(&mut buf, g, 0, Type::Unsigned8, Register::from_i32(0x1ff)).unwrap();
        store_value(&mut buf, g, 1, Type::Ref, Register::from_ref(0x123ab)).unwrap();
        store_value(&mut buf, g, 5, Type::NativePtr, Register::from_ptr(-3)).unwrap();
        assert_eq!(buf[0], 0xff);
        assert_eq!(buf[1..5], [0xab, 0x23, 0x01, 0x00]);
        assert_eq!(load_value(&buf, Segment::Global, 0, Type::Unsigned8).unwrap().as_i32(), 255);
        assert_eq!(load_value(&buf, Segment::Global, 1, Type::Ref).unwrap().as_ref(), 0x123ab);
        assert_eq!(load_value(&buf, Segment::Global, 5, Type::NativePtr).unwrap().as_ptr(), -3);
        assert!(load_value(&buf, Segment::Global, 9, Type::Float64).is_err());
        assert!(matches!(
            load_value(&buf, Segment::Global, 0, Type::Void),
            Err(VmError::InvalidType(0))
        ));
    }

    #[test]
    fn cstr_requires_terminator() {
        let buf = b"abc\0de";
        assert_eq!(read_cstr(buf, Segment::Const, 0).unwrap(), b"abc");
        assert_eq!(read_cstr(buf, Segment::Const, 3).unwrap(), b"");
        assert!(read_cstr(buf, Segment::Const, 4).is_err());
    }
}
