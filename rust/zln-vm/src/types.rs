//! Primitive types and the const-segment metadata records that describe
//! functions and composite types.
//!
//! `FunctionMeta` layout (packed, little-endian):
//! ```text
//! base_pc u32 @0 | pc u32 @4 | local_count u32 @8 | arg_count u32 @12
//! ret_type u8 @16 | name: zero-terminated bytes @17
//! ```
//!
//! `TypeMeta` layout:
//! ```text
//! name [u8; 64] zero padded                @0
//! interface_count u32                      @64
//! interfaces [u32; 8]                      @68
//! vtable (virtual_fn u32, impl_fn u32)*    @100, terminated by (0, 0)
//! field types u8*                          terminated by 0 (Void)
//! ```
//!
//! Composite instances are packed: a field's offset is the sum of the sizes
//! of the fields before it.

use crate::error::VmError;
use crate::memory::{self, Addr, Segment};
use serde::Serialize;
use strum::{FromRepr, IntoStaticStr};

/// Primitive type tags as stored in metadata, heap headers and `Conv`
/// operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, Serialize)]
#[repr(u8)]
pub enum Type {
    Void = 0,
    Int32 = 1,
    Float64 = 2,
    Unsigned8 = 3,
    String = 4,
    Ref = 5,
    NativePtr = 6,
}

impl Type {
    pub fn from_tag(tag: u32) -> Result<Type, VmError> {
        u8::try_from(tag)
            .ok()
            .and_then(Type::from_repr)
            .ok_or(VmError::InvalidType(tag))
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Static size in bytes. `Void` has no size.
    pub fn size(self) -> Result<usize, VmError> {
        match self {
            Type::Void => Err(VmError::InvalidType(0)),
            Type::Int32 => Ok(4),
            Type::Float64 => Ok(8),
            Type::Unsigned8 => Ok(1),
            Type::String | Type::Ref => Ok(4),
            Type::NativePtr => Ok(8),
        }
    }

    /// Whether values of this type are heap addresses that participate in
    /// reference counting.
    pub fn is_reference(self) -> bool {
        matches!(self, Type::String | Type::Ref)
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Type::Void => "NIL",
            Type::Int32 => "I32",
            Type::Float64 => "F64",
            Type::Unsigned8 => "UI8",
            Type::String => "STR",
            Type::Ref => "REF",
            Type::NativePtr => "PTR",
        }
    }
}

fn malformed(addr: Addr, reason: impl Into<String>) -> VmError {
    VmError::MalformedMetadata {
        addr,
        reason: reason.into(),
    }
}

fn utf8_name(bytes: &[u8], addr: Addr) -> Result<&str, VmError> {
    std::str::from_utf8(bytes).map_err(|_| malformed(addr, "name is not valid UTF-8"))
}

// --- FunctionMeta ---

pub const FUNCTION_META_HEADER_SIZE: usize = 17;

/// Descriptor of a callable function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionMeta {
    /// Const address this record was read from.
    pub addr: Addr,
    /// Start of the function's module in the code segment. Branch targets
    /// are relative to it.
    pub base_pc: u32,
    /// Entry offset relative to `base_pc`.
    pub pc: u32,
    pub local_count: u32,
    pub arg_count: u32,
    pub ret_type: Type,
}

impl FunctionMeta {
    pub fn read(consts: &[u8], addr: Addr) -> Result<Self, VmError> {
        let at = addr as usize;
        memory::slice(consts, Segment::Const, at, FUNCTION_META_HEADER_SIZE)?;
        let ret_tag = memory::read_u8(consts, Segment::Const, at + 16)?;
        let ret_type = Type::from_tag(ret_tag as u32)
            .map_err(|_| malformed(addr, format!("bad return type tag {}", ret_tag)))?;
        Ok(Self {
            addr,
            base_pc: memory::read_u32(consts, Segment::Const, at)?,
            pc: memory::read_u32(consts, Segment::Const, at + 4)?,
            local_count: memory::read_u32(consts, Segment::Const, at + 8)?,
            arg_count: memory::read_u32(consts, Segment::Const, at + 12)?,
            ret_type,
        })
    }

    pub fn name<'a>(&self, consts: &'a [u8]) -> Result<&'a str, VmError> {
        let bytes = memory::read_cstr(
            consts,
            Segment::Const,
            self.addr as usize + FUNCTION_META_HEADER_SIZE,
        )?;
        utf8_name(bytes, self.addr)
    }

    /// Absolute code offset of the first instruction.
    pub fn entry_offset(&self) -> usize {
        self.base_pc as usize + self.pc as usize
    }
}

// --- TypeMeta ---

pub const TYPE_META_NAME_SIZE: usize = 64;
pub const MAX_IMPLEMENTED_INTERFACES: usize = 8;
pub const TYPE_META_HEADER_SIZE: usize = TYPE_META_NAME_SIZE + 4 + 4 * MAX_IMPLEMENTED_INTERFACES;
pub const VTABLE_ENTRY_SIZE: usize = 8;

/// One vtable slot: the interface's virtual function and the concrete
/// function implementing it for this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VtableEntry {
    pub virtual_function: Addr,
    pub implementation: Addr,
}

/// Resolves virtual functions to implementations.
pub trait DispatchTable {
    /// FunctionMeta address implementing `virtual_function`, if any.
    fn resolve(&self, virtual_function: Addr) -> Result<Option<Addr>, VmError>;
}

/// Borrowed view of a `TypeMeta` record in the const segment.
#[derive(Debug, Clone, Copy)]
pub struct TypeMeta<'a> {
    consts: &'a [u8],
    addr: Addr,
}

impl<'a> TypeMeta<'a> {
    pub fn at(consts: &'a [u8], addr: Addr) -> Result<Self, VmError> {
        memory::slice(consts, Segment::Const, addr as usize, TYPE_META_HEADER_SIZE)?;
        Ok(Self { consts, addr })
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    fn base(&self) -> usize {
        self.addr as usize
    }

    pub fn name(&self) -> Result<&'a str, VmError> {
        let raw = memory::slice(self.consts, Segment::Const, self.base(), TYPE_META_NAME_SIZE)?;
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        utf8_name(&raw[..len], self.addr)
    }

    pub fn interfaces(&self) -> Result<Vec<Addr>, VmError> {
        let at = self.base() + TYPE_META_NAME_SIZE;
        let count = memory::read_u32(self.consts, Segment::Const, at)? as usize;
        if count > MAX_IMPLEMENTED_INTERFACES {
            return Err(malformed(self.addr, format!("{} interfaces", count)));
        }
        (0..count)
            .map(|i| memory::read_u32(self.consts, Segment::Const, at + 4 + i * 4))
            .collect()
    }

    pub fn implements(&self, interface: Addr) -> Result<bool, VmError> {
        Ok(self.interfaces()?.contains(&interface))
    }

    /// Walks vtable slots until `visit` returns true or the terminator is
    /// reached. Returns the offset just past the last slot read.
    fn walk_vtable(&self, mut visit: impl FnMut(VtableEntry) -> bool) -> Result<usize, VmError> {
        let mut at = self.base() + TYPE_META_HEADER_SIZE;
        loop {
            let entry = VtableEntry {
                virtual_function: memory::read_u32(self.consts, Segment::Const, at)?,
                implementation: memory::read_u32(self.consts, Segment::Const, at + 4)?,
            };
            at += VTABLE_ENTRY_SIZE;
            if entry.virtual_function == 0 && entry.implementation == 0 {
                return Ok(at);
            }
            if visit(entry) {
                return Ok(at);
            }
        }
    }

    pub fn vtable(&self) -> Result<Vec<VtableEntry>, VmError> {
        let mut entries = Vec::new();
        self.walk_vtable(|entry| {
            entries.push(entry);
            false
        })?;
        Ok(entries)
    }

    pub fn field_types(&self) -> Result<Vec<Type>, VmError> {
        let start = self.walk_vtable(|_| false)?;
        let raw = memory::read_cstr(self.consts, Segment::Const, start)?;
        raw.iter()
            .map(|&tag| {
                Type::from_tag(tag as u32)
                    .map_err(|_| malformed(self.addr, format!("bad field type tag {}", tag)))
            })
            .collect()
    }

    /// `(offset, type)` of every field, in declaration order.
    pub fn field_layout(&self) -> Result<Vec<(usize, Type)>, VmError> {
        let mut offset = 0;
        let mut layout = Vec::new();
        for ty in self.field_types()? {
            layout.push((offset, ty));
            offset += ty.size()?;
        }
        Ok(layout)
    }

    pub fn instance_size(&self) -> Result<usize, VmError> {
        self.field_types()?
            .into_iter()
            .try_fold(0, |total, ty| Ok(total + ty.size()?))
    }
}

impl DispatchTable for TypeMeta<'_> {
    fn resolve(&self, virtual_function: Addr) -> Result<Option<Addr>, VmError> {
        let mut found = None;
        self.walk_vtable(|entry| {
            if entry.virtual_function == virtual_function {
                found = Some(entry.implementation);
                true
            } else {
                false
            }
        })?;
        Ok(found)
    }
}

/// Size in bytes of an instance of the composite type at `type_meta`.
pub fn instance_size(consts: &[u8], type_meta: Addr) -> Result<usize, VmError> {
    TypeMeta::at(consts, type_meta)?.instance_size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::ConstWriter;

    #[test]
    fn type_sizes() {
        assert_eq!(Type::Int32.size().unwrap(), 4);
        assert_eq!(Type::Float64.size().unwrap(), 8);
        assert_eq!(Type::Unsigned8.size().unwrap(), 1);
        assert_eq!(Type::String.size().unwrap(), 4);
        assert_eq!(Type::Ref.size().unwrap(), 4);
        assert_eq!(Type::NativePtr.size().unwrap(), 8);
        assert!(Type::Void.size().is_err());
        assert!(matches!(Type::from_tag(7), Err(VmError::InvalidType(7))));
        assert_eq!(Type::from_tag(3).unwrap(), Type::Unsigned8);
    }

    #[test]
    fn function_meta_reads_back() {
        let mut consts = ConstWriter::new();
        consts.f64(1.5);
        let addr = consts.function("compute", 2, 3, Type::Float64);
        consts.set_function_entry(addr, 40, 12);
        let bytes = consts.into_bytes();

        let meta = FunctionMeta::read(&bytes, addr).unwrap();
        assert_eq!(meta.addr, 8);
        assert_eq!(meta.base_pc, 40);
        assert_eq!(meta.pc, 12);
        assert_eq!(meta.arg_count, 2);
        assert_eq!(meta.local_count, 3);
        assert_eq!(meta.ret_type, Type::Float64);
        assert_eq!(meta.entry_offset(), 52);
        assert_eq!(meta.name(&bytes).unwrap(), "compute");
    }

    #[test]
    fn type_meta_layout_and_dispatch() {
        let mut consts = ConstWriter::new();
        let shape = consts.interface("Shape");
        let area = consts.function("Shape.area", 1, 0, Type::Float64);
        let square_area = consts.function("Square.area", 1, 0, Type::Float64);
        let square = consts.type_meta(
            "Square",
            &[shape],
            &[VtableEntry {
                virtual_function: area,
                implementation: square_area,
            }],
            &[Type::Int32, Type::Ref, Type::Float64, Type::Unsigned8],
        );
        let bytes = consts.into_bytes();

        let meta = TypeMeta::at(&bytes, square).unwrap();
        assert_eq!(meta.name().unwrap(), "Square");
        assert_eq!(meta.interfaces().unwrap(), vec![shape]);
        assert!(meta.implements(shape).unwrap());
        assert!(!meta.implements(square).unwrap());
        assert_eq!(meta.instance_size().unwrap(), 17);
        assert_eq!(
            meta.field_layout().unwrap(),
            vec![
                (0, Type::Int32),
                (4, Type::Ref),
                (8, Type::Float64),
                (16, Type::Unsigned8)
            ]
        );
        assert_eq!(meta.resolve(area).unwrap(), Some(square_area));
        assert_eq!(meta.resolve(square_area).unwrap(), None);
        assert_eq!(instance_size(&bytes, shape).unwrap(), 0);
    }
}
