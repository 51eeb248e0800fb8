//! Typed arithmetic, comparison, conversion and string helpers used by the
//! dispatch loop.

use crate::error::VmError;
use crate::heap::{Heap, HeapView};
use crate::memory::Addr;
use crate::opcode::{ArithOp, CmpOp};
use crate::register::Register;
use crate::types::Type;
use std::cmp::Ordering;

pub(crate) fn arith(op: ArithOp, ty: Type, l: Register, r: Register) -> Result<Register, VmError> {
    match ty {
        Type::Int32 => int_arith(op, l.as_i32(), r.as_i32()).map(Register::from_i32),
        Type::Unsigned8 => {
            int_arith(op, l.as_i32(), r.as_i32()).map(|v| Register::from_i32(v & 0xff))
        }
        Type::Float64 => float_arith(op, l.as_f64(), r.as_f64()).map(Register::from_f64),
        other => Err(VmError::Runtime(format!(
            "no {:?} arithmetic on {}",
            op,
            other.short_name()
        ))),
    }
}

fn int_arith(op: ArithOp, l: i32, r: i32) -> Result<i32, VmError> {
    Ok(match op {
        ArithOp::Add => l.wrapping_add(r),
        ArithOp::Sub => l.wrapping_sub(r),
        ArithOp::Mul => l.wrapping_mul(r),
        ArithOp::Div => {
            if r == 0 {
                return Err(VmError::DivisionByZero);
            }
            l.wrapping_div(r)
        }
        ArithOp::Mod => {
            if r == 0 {
                return Err(VmError::DivisionByZero);
            }
            l.wrapping_rem(r)
        }
        ArithOp::Band => l & r,
        ArithOp::Bor => l | r,
        ArithOp::Xor => l ^ r,
        ArithOp::LShift => l.wrapping_shl(r as u32),
        ArithOp::RShift => l.wrapping_shr(r as u32),
    })
}

fn float_arith(op: ArithOp, l: f64, r: f64) -> Result<f64, VmError> {
    match op {
        ArithOp::Add => Ok(l + r),
        ArithOp::Sub => Ok(l - r),
        ArithOp::Mul => Ok(l * r),
        ArithOp::Div => Ok(l / r),
        ArithOp::Mod => Ok(l % r),
        other => Err(VmError::Runtime(format!("no {:?} on F64", other))),
    }
}

fn holds<T: PartialOrd>(cmp: CmpOp, l: T, r: T) -> bool {
    match cmp {
        CmpOp::Eq => l == r,
        CmpOp::Ne => l != r,
        CmpOp::Gt => l > r,
        CmpOp::Ge => l >= r,
        CmpOp::Lt => l < r,
        CmpOp::Le => l <= r,
    }
}

pub(crate) fn compare(cmp: CmpOp, ty: Type, l: Register, r: Register) -> Result<bool, VmError> {
    match ty {
        Type::Int32 | Type::Unsigned8 => Ok(holds(cmp, l.as_i32(), r.as_i32())),
        Type::Float64 => Ok(holds(cmp, l.as_f64(), r.as_f64())),
        Type::Ref | Type::String => Ok(holds(cmp, l.as_ref(), r.as_ref())),
        Type::NativePtr => Ok(holds(cmp, l.as_ptr(), r.as_ptr())),
        Type::Void => Err(VmError::InvalidType(0)),
    }
}

/// Byte-wise ordering of two strings. The same address (nil included)
/// compares equal; nil against a string is a nil dereference.
pub(crate) fn compare_strings(view: &HeapView<'_>, l: Addr, r: Addr) -> Result<Ordering, VmError> {
    if l == r {
        return Ok(Ordering::Equal);
    }
    if l == 0 || r == 0 {
        return Err(VmError::NilDereference);
    }
    Ok(view.string_bytes(l)?.cmp(view.string_bytes(r)?))
}

pub(crate) fn compare_str(
    cmp: CmpOp,
    view: &HeapView<'_>,
    l: Addr,
    r: Addr,
) -> Result<bool, VmError> {
    Ok(holds(cmp, compare_strings(view, l, r)?, Ordering::Equal))
}

/// Concatenate two strings into a new heap string.
///
/// The buffer is sized from the operands' buffers, not their text: both
/// data sizes summed, minus the left terminator.
pub(crate) fn concat(heap: &mut Heap<'_>, l: Addr, r: Addr) -> Result<Addr, VmError> {
    if l == 0 || r == 0 {
        return Err(VmError::NilDereference);
    }
    let view = heap.view();
    let buffers = view.entry(l)?.data_size as usize + view.entry(r)?.data_size as usize;
    let left = view.string_bytes(l)?.to_vec();
    let right = view.string_bytes(r)?.to_vec();
    // unterminated operands still need room for both texts
    let data_size = buffers.saturating_sub(1).max(left.len() + right.len());
    let joined = heap.alloc_array(Type::Unsigned8, data_size)?;
    heap.write_payload(joined, 0, &left)?;
    heap.write_payload(joined, left.len(), &right)?;
    Ok(joined)
}

enum Scalar {
    Int(i64),
    Float(f64),
}

/// Reinterpret `value` as `source` and convert it to the type tagged
/// `target`. Strings convert as references.
pub(crate) fn convert(source: Type, target: u32, value: Register) -> Result<Register, VmError> {
    let unsupported = || VmError::UnsupportedConversion {
        from: source.into(),
        to: target,
    };
    let scalar = match source {
        Type::Int32 | Type::Unsigned8 => Scalar::Int(value.as_i32() as i64),
        Type::Float64 => Scalar::Float(value.as_f64()),
        Type::String | Type::Ref => Scalar::Int(value.as_ref() as i64),
        Type::NativePtr => Scalar::Int(value.as_ptr()),
        Type::Void => return Err(unsupported()),
    };
    let target_type = Type::from_tag(target).map_err(|_| unsupported())?;
    let converted = match (target_type, scalar) {
        (Type::Int32, Scalar::Int(v)) => Register::from_i32(v as i32),
        (Type::Int32, Scalar::Float(f)) => Register::from_i32(f as i32),
        (Type::Unsigned8, Scalar::Int(v)) => Register::from_i32(v as i32 & 0xff),
        (Type::Unsigned8, Scalar::Float(f)) => Register::from_i32(f as i32 & 0xff),
        (Type::Float64, Scalar::Int(v)) => Register::from_f64(v as f64),
        (Type::Float64, Scalar::Float(f)) => Register::from_f64(f),
        (Type::Ref | Type::String, Scalar::Int(v)) => Register::from_ref(v as u32),
        (Type::Ref | Type::String, Scalar::Float(f)) => Register::from_ref(f as u32),
        (Type::NativePtr, Scalar::Int(v)) => Register::from_ptr(v),
        (Type::NativePtr, Scalar::Float(f)) => Register::from_ptr(f as i64),
        (Type::Void, _) => return Err(unsupported()),
    };
    Ok(converted)
}
