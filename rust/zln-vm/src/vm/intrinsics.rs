//! Built-in runtime functions reachable through `Invoke`.
//!
//! A built-in receives the result register and the first of a contiguous
//! run of argument registers in the active window.
//!
//! Lists are composites laid out as `size: Int32 @0, array: Ref @4`. The
//! backing array grows by `LIST_GROWTH` elements when full.

use super::Cpu;
use crate::error::VmError;
use crate::memory::Addr;
use crate::register::Register;
use crate::types::Type;
use strum::{FromRepr, IntoStaticStr};
use tracing::{debug, info, trace};

pub const LIST_SIZE_OFFSET: usize = 0;
pub const LIST_ARRAY_OFFSET: usize = 4;
pub const LIST_GROWTH: usize = 16;

/// Built-in function ids as encoded in `Invoke`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u32)]
pub enum BuiltInFunction {
    ArrayLength = 1,
    ArrayCopy = 2,
    ListSize = 10,
    ListCapacity = 11,
    ListAdd = 12,
    ListRemove = 13,
    ListSet = 14,
    ListGet = 15,
    StringLength = 20,
    Print = 30,
}

type Invocation = fn(&mut Cpu<'_>, u8, u8) -> Result<(), VmError>;

impl BuiltInFunction {
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    fn invocation(self) -> Invocation {
        match self {
            BuiltInFunction::ArrayLength => array_length,
            BuiltInFunction::ArrayCopy => array_copy,
            BuiltInFunction::ListSize => list_size,
            BuiltInFunction::ListCapacity => list_capacity,
            BuiltInFunction::ListAdd => list_add,
            BuiltInFunction::ListRemove => list_remove,
            BuiltInFunction::ListSet => list_set,
            BuiltInFunction::ListGet => list_get,
            BuiltInFunction::StringLength => string_length,
            BuiltInFunction::Print => print,
        }
    }
}

pub(crate) fn invoke(cpu: &mut Cpu<'_>, id: u32, result: u8, first_arg: u8) -> Result<(), VmError> {
    let function = BuiltInFunction::from_repr(id).ok_or(VmError::UnknownBuiltIn(id))?;
    trace!(builtin = function.name(), "invoke");
    (function.invocation())(cpu, result, first_arg)
}

fn arg(cpu: &Cpu<'_>, first: u8, n: u8) -> Result<Register, VmError> {
    let index = first
        .checked_add(n)
        .ok_or(VmError::RegisterOutOfBounds(first as usize + n as usize))?;
    cpu.stack.reg(index)
}

fn non_negative(value: i32, len: usize) -> Result<usize, VmError> {
    usize::try_from(value).map_err(|_| VmError::IndexOutOfBounds {
        index: value as i64,
        len,
    })
}

fn element_type(cpu: &Cpu<'_>, array: Addr) -> Result<(Type, usize, usize), VmError> {
    let entry = cpu.heap.entry(array)?;
    let ty = entry.element_type().ok_or_else(|| {
        VmError::Runtime(format!("heap entry {} is not an array", array))
    })?;
    Ok((ty, ty.size()?, entry.len()?))
}

// --- Arrays ---

fn array_length(cpu: &mut Cpu<'_>, result: u8, first: u8) -> Result<(), VmError> {
    let array = arg(cpu, first, 0)?.as_ref();
    let len = cpu.heap.entry(array)?.len()?;
    cpu.stack.set_reg(result, Register::from_i32(len as i32))
}

/// `copy(array, offset, count)`: a new array of `count` elements taken
/// from `offset`, zero padded past the end of the source.
fn array_copy(cpu: &mut Cpu<'_>, result: u8, first: u8) -> Result<(), VmError> {
    let array = arg(cpu, first, 0)?.as_ref();
    let (ty, size, len) = element_type(cpu, array)?;
    let offset = non_negative(arg(cpu, first, 1)?.as_i32(), len)?;
    let count = non_negative(arg(cpu, first, 2)?.as_i32(), len)?;

    cpu.heap.add_ref(array)?;
    let copy = cpu.heap.alloc_array(ty, count)?;
    let available = len.saturating_sub(offset).min(count);
    cpu.heap
        .copy_data(array, offset * size, copy, 0, available * size)?;
    cpu.heap.remove_ref(array)?;
    cpu.stack.set_reg(result, Register::from_ref(copy))
}

// --- Lists ---

struct ListParts {
    size: usize,
    array: Addr,
}

fn list_parts(cpu: &Cpu<'_>, list: Addr) -> Result<ListParts, VmError> {
    let size = cpu.heap.load(list, LIST_SIZE_OFFSET, Type::Int32)?.as_i32();
    let array = cpu.heap.load(list, LIST_ARRAY_OFFSET, Type::Ref)?.as_ref();
    Ok(ListParts {
        size: non_negative(size, 0)?,
        array,
    })
}

fn checked_index(cpu: &Cpu<'_>, first: u8, n: u8, size: usize) -> Result<usize, VmError> {
    let index = arg(cpu, first, n)?.as_i32();
    match usize::try_from(index) {
        Ok(i) if i < size => Ok(i),
        _ => Err(VmError::IndexOutOfBounds {
            index: index as i64,
            len: size,
        }),
    }
}

fn list_size(cpu: &mut Cpu<'_>, result: u8, first: u8) -> Result<(), VmError> {
    let parts = list_parts(cpu, arg(cpu, first, 0)?.as_ref())?;
    cpu.stack.set_reg(result, Register::from_i32(parts.size as i32))
}

fn list_capacity(cpu: &mut Cpu<'_>, result: u8, first: u8) -> Result<(), VmError> {
    let parts = list_parts(cpu, arg(cpu, first, 0)?.as_ref())?;
    let capacity = match parts.array {
        0 => 0,
        array => cpu.heap.entry(array)?.len()?,
    };
    cpu.stack.set_reg(result, Register::from_i32(capacity as i32))
}

/// Move the list onto a backing array `LIST_GROWTH` elements larger.
/// The list is pinned while allocating so neither it nor its current
/// array can be recycled underneath the copy.
fn grow_list(cpu: &mut Cpu<'_>, list: Addr, array: Addr) -> Result<Addr, VmError> {
    let (ty, size, len) = element_type(cpu, array)?;
    cpu.heap.add_ref(list)?;
    let grown = cpu.heap.alloc_array(ty, len + LIST_GROWTH)?;
    cpu.heap.copy_data(array, 0, grown, 0, len * size)?;
    cpu.heap
        .store(list, LIST_ARRAY_OFFSET, Type::Ref, Register::from_ref(grown))?;
    cpu.heap.add_ref(grown)?;
    cpu.heap.remove_ref(array)?;
    cpu.heap.remove_ref(list)?;
    debug!(list, capacity = len + LIST_GROWTH, "grew list");
    Ok(grown)
}

fn list_add(cpu: &mut Cpu<'_>, _result: u8, first: u8) -> Result<(), VmError> {
    let list = arg(cpu, first, 0)?.as_ref();
    let item = arg(cpu, first, 1)?;
    let parts = list_parts(cpu, list)?;
    if parts.array == 0 {
        return Err(VmError::NilDereference);
    }
    let (ty, size, len) = element_type(cpu, parts.array)?;
    let array = if parts.size >= len {
        grow_list(cpu, list, parts.array)?
    } else {
        parts.array
    };
    cpu.heap.store(array, parts.size * size, ty, item)?;
    cpu.heap.store(
        list,
        LIST_SIZE_OFFSET,
        Type::Int32,
        Register::from_i32(parts.size as i32 + 1),
    )
}

fn list_remove(cpu: &mut Cpu<'_>, _result: u8, first: u8) -> Result<(), VmError> {
    let list = arg(cpu, first, 0)?.as_ref();
    let parts = list_parts(cpu, list)?;
    let index = checked_index(cpu, first, 1, parts.size)?;
    let (ty, size, _) = element_type(cpu, parts.array)?;
    let tail = parts.size - index - 1;
    cpu.heap
        .copy_data(parts.array, (index + 1) * size, parts.array, index * size, tail * size)?;
    cpu.heap
        .store(parts.array, (parts.size - 1) * size, ty, Register::ZERO)?;
    cpu.heap.store(
        list,
        LIST_SIZE_OFFSET,
        Type::Int32,
        Register::from_i32(parts.size as i32 - 1),
    )
}

fn list_set(cpu: &mut Cpu<'_>, _result: u8, first: u8) -> Result<(), VmError> {
    let list = arg(cpu, first, 0)?.as_ref();
    let parts = list_parts(cpu, list)?;
    let index = checked_index(cpu, first, 1, parts.size)?;
    let item = arg(cpu, first, 2)?;
    let (ty, size, _) = element_type(cpu, parts.array)?;
    cpu.heap.store(parts.array, index * size, ty, item)
}

fn list_get(cpu: &mut Cpu<'_>, result: u8, first: u8) -> Result<(), VmError> {
    let list = arg(cpu, first, 0)?.as_ref();
    let parts = list_parts(cpu, list)?;
    let index = checked_index(cpu, first, 1, parts.size)?;
    let (ty, size, _) = element_type(cpu, parts.array)?;
    let value = cpu.heap.load(parts.array, index * size, ty)?;
    cpu.stack.set_reg(result, value)
}

// --- Strings ---

fn string_length(cpu: &mut Cpu<'_>, result: u8, first: u8) -> Result<(), VmError> {
    let string = arg(cpu, first, 0)?.as_ref();
    let len = cpu.heap.view().string_bytes(string)?.len();
    cpu.stack.set_reg(result, Register::from_i32(len as i32))
}

fn print(cpu: &mut Cpu<'_>, _result: u8, first: u8) -> Result<(), VmError> {
    let string = arg(cpu, first, 0)?.as_ref();
    let text = cpu.heap.view().read_string(string)?;
    match cpu.config.print_callback.as_mut() {
        Some(callback) => callback(&text),
        None => info!(target: "zln::print", "{}", text),
    }
    Ok(())
}
