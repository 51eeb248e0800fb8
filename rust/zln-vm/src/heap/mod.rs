//! Reference-counted heap living inside the heap segment.
//!
//! Every entry carries a 16-byte header:
//!
//! ```text
//! header u32     array element type tag, or OBJECT_HEADER_FLAG | TypeMeta
//! ref_count u32
//! data_size u32  payload bytes in use
//! alloc_size u32 payload bytes reserved (>= data_size)
//! ```
//!
//! Allocation bumps the tail while there is room. Once the tail is
//! exhausted the allocator reuses a free entry (`ref_count == 0`), or
//! carves a new entry out of the trailing slack of a live one, compacting
//! adjacent free entries once before giving up. The first
//! `HEAP_RESERVED_BYTES` are never handed out, so address 0 is nil.
//!
//! Reference cycles are never reclaimed.

pub mod layout;

use crate::error::VmError;
use crate::memory::{self, Addr, Segment};
use crate::register::Register;
use crate::types::{DispatchTable, FunctionMeta, Type, TypeMeta};
use layout::{Placement, Slot};
use serde::Serialize;
use tracing::debug;

pub const HEAP_ENTRY_HEADER_SIZE: usize = 16;
pub const HEAP_RESERVED_BYTES: usize = 16;
/// Set in the header word of composite instances.
pub const OBJECT_HEADER_FLAG: u32 = 0x8000_0000;

const _: () = assert!(HEAP_RESERVED_BYTES >= HEAP_ENTRY_HEADER_SIZE);

/// What an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    /// Array of the given element type. Strings are `Unsigned8` arrays.
    Array(Type),
    /// Composite instance described by the TypeMeta at this const address.
    Object(Addr),
}

impl EntryKind {
    pub fn from_header(header: u32) -> Result<Self, VmError> {
        if header & OBJECT_HEADER_FLAG != 0 {
            Ok(EntryKind::Object(header & !OBJECT_HEADER_FLAG))
        } else {
            Ok(EntryKind::Array(Type::from_tag(header)?))
        }
    }

    pub fn to_header(self) -> u32 {
        match self {
            EntryKind::Array(ty) => ty.tag() as u32,
            EntryKind::Object(meta) => meta | OBJECT_HEADER_FLAG,
        }
    }
}

/// Snapshot of one entry's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapEntry {
    pub addr: Addr,
    pub kind: EntryKind,
    pub ref_count: u32,
    pub data_size: u32,
    pub alloc_size: u32,
}

impl HeapEntry {
    pub fn payload_offset(&self) -> usize {
        self.addr as usize + HEAP_ENTRY_HEADER_SIZE
    }

    pub fn slot(&self) -> Slot {
        Slot {
            addr: self.addr,
            ref_count: self.ref_count,
            data_size: self.data_size,
            alloc_size: self.alloc_size,
        }
    }

    pub fn element_type(&self) -> Option<Type> {
        match self.kind {
            EntryKind::Array(ty) => Some(ty),
            EntryKind::Object(_) => None,
        }
    }

    /// Element count of an array entry.
    pub fn len(&self) -> Result<usize, VmError> {
        match self.kind {
            EntryKind::Array(ty) => Ok(self.data_size as usize / ty.size()?),
            EntryKind::Object(_) => Err(VmError::Runtime(format!(
                "heap entry {} is an object, not an array",
                self.addr
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data_size == 0
    }
}

fn read_entry(memory: &[u8], addr: Addr) -> Result<HeapEntry, VmError> {
    if addr == 0 {
        return Err(VmError::NilDereference);
    }
    let at = addr as usize;
    let header = memory::read_u32(memory, Segment::Heap, at)?;
    Ok(HeapEntry {
        addr,
        kind: EntryKind::from_header(header)?,
        ref_count: memory::read_u32(memory, Segment::Heap, at + 4)?,
        data_size: memory::read_u32(memory, Segment::Heap, at + 8)?,
        alloc_size: memory::read_u32(memory, Segment::Heap, at + 12)?,
    })
}

/// Read-only access to a heap segment, usable after execution has ended.
#[derive(Clone, Copy)]
pub struct HeapView<'a> {
    memory: &'a [u8],
    consts: &'a [u8],
}

impl<'a> HeapView<'a> {
    pub fn new(memory: &'a [u8], consts: &'a [u8]) -> Self {
        Self { memory, consts }
    }

    pub fn entry(&self, addr: Addr) -> Result<HeapEntry, VmError> {
        read_entry(self.memory, addr)
    }

    /// Walk entries from the first address until a never-written header.
    pub fn entries(&self) -> Result<Vec<HeapEntry>, VmError> {
        self.entries_until(self.memory.len())
    }

    fn entries_until(&self, end: usize) -> Result<Vec<HeapEntry>, VmError> {
        let mut out = Vec::new();
        let mut at = HEAP_RESERVED_BYTES;
        while at + HEAP_ENTRY_HEADER_SIZE <= end {
            if memory::read_u32(self.memory, Segment::Heap, at)? == 0 {
                break;
            }
            let entry = self.entry(at as Addr)?;
            at += entry.slot().span();
            out.push(entry);
        }
        Ok(out)
    }

    /// Payload bytes in use.
    pub fn data(&self, addr: Addr) -> Result<&'a [u8], VmError> {
        let entry = self.entry(addr)?;
        memory::slice(
            self.memory,
            Segment::Heap,
            entry.payload_offset(),
            entry.data_size as usize,
        )
    }

    /// String payload up to its terminator.
    pub fn string_bytes(&self, addr: Addr) -> Result<&'a [u8], VmError> {
        let data = self.data(addr)?;
        let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Ok(&data[..len])
    }

    pub fn read_string(&self, addr: Addr) -> Result<String, VmError> {
        Ok(String::from_utf8_lossy(self.string_bytes(addr)?).into_owned())
    }

    /// TypeMeta of a composite instance; `None` for arrays.
    pub fn instance_type(&self, addr: Addr) -> Result<Option<TypeMeta<'a>>, VmError> {
        match self.entry(addr)?.kind {
            EntryKind::Object(meta) => TypeMeta::at(self.consts, meta).map(Some),
            EntryKind::Array(_) => Ok(None),
        }
    }

    /// Implementation of `virtual_function` for the instance at `addr`.
    pub fn get_impl_function(
        &self,
        addr: Addr,
        virtual_function: Addr,
    ) -> Result<Option<FunctionMeta>, VmError> {
        let Some(meta) = self.instance_type(addr)? else {
            return Ok(None);
        };
        meta.resolve(virtual_function)?
            .map(|implementation| FunctionMeta::read(self.consts, implementation))
            .transpose()
    }

    /// Heap addresses held directly by the entry at `addr`.
    pub fn contained_refs(&self, addr: Addr) -> Result<Vec<Addr>, VmError> {
        let entry = self.entry(addr)?;
        let base = entry.payload_offset();
        let offsets: Vec<usize> = match entry.kind {
            EntryKind::Array(ty) if ty.is_reference() => {
                (0..entry.len()?).map(|i| i * ty.size().unwrap_or(4)).collect()
            }
            EntryKind::Array(_) => return Ok(Vec::new()),
            EntryKind::Object(meta) => TypeMeta::at(self.consts, meta)?
                .field_layout()?
                .into_iter()
                .filter(|(offset, ty)| ty.is_reference() && offset + 4 <= entry.data_size as usize)
                .map(|(offset, _)| offset)
                .collect(),
        };
        offsets
            .into_iter()
            .map(|offset| memory::read_u32(self.memory, Segment::Heap, base + offset))
            .filter(|child| !matches!(child, Ok(0)))
            .collect()
    }

    /// Human-readable type of an entry, e.g. `I32[]` or a TypeMeta name.
    pub fn type_name(&self, entry: &HeapEntry) -> Result<String, VmError> {
        match entry.kind {
            EntryKind::Array(ty) => Ok(format!("{}[]", ty.short_name())),
            EntryKind::Object(meta) => Ok(TypeMeta::at(self.consts, meta)?.name()?.to_string()),
        }
    }
}

pub struct Heap<'m> {
    memory: &'m mut [u8],
    consts: &'m [u8],
    tail: usize,
}

impl<'m> Heap<'m> {
    /// Take over a heap segment. The segment is cleared.
    pub fn new(memory: &'m mut [u8], consts: &'m [u8]) -> Result<Self, VmError> {
        if memory.len() < HEAP_RESERVED_BYTES {
            return Err(VmError::MemoryTooSmall {
                required: HEAP_RESERVED_BYTES,
                actual: memory.len(),
            });
        }
        memory.fill(0);
        Ok(Self {
            memory,
            consts,
            tail: HEAP_RESERVED_BYTES,
        })
    }

    pub fn view(&self) -> HeapView<'_> {
        HeapView::new(self.memory, self.consts)
    }

    pub fn size(&self) -> usize {
        self.memory.len()
    }

    /// First never-allocated byte.
    pub fn tail(&self) -> usize {
        self.tail
    }

    pub fn entry(&self, addr: Addr) -> Result<HeapEntry, VmError> {
        read_entry(self.memory, addr)
    }

    pub fn entries(&self) -> Result<Vec<HeapEntry>, VmError> {
        self.view().entries_until(self.tail)
    }

    fn slots(&self) -> Result<Vec<Slot>, VmError> {
        Ok(self.entries()?.iter().map(HeapEntry::slot).collect())
    }

    // --- Allocation ---

    pub fn alloc_array(&mut self, element_type: Type, count: usize) -> Result<Addr, VmError> {
        let data_size = element_type
            .size()?
            .checked_mul(count)
            .ok_or(VmError::OutOfMemory {
                requested: usize::MAX,
            })?;
        self.alloc_entry(EntryKind::Array(element_type), data_size)
    }

    pub fn alloc_obj(&mut self, type_meta: Addr) -> Result<Addr, VmError> {
        if type_meta & OBJECT_HEADER_FLAG != 0 {
            return Err(VmError::MalformedMetadata {
                addr: type_meta,
                reason: "TypeMeta address does not fit in an object header".into(),
            });
        }
        let data_size = TypeMeta::at(self.consts, type_meta)?.instance_size()?;
        self.alloc_entry(EntryKind::Object(type_meta), data_size)
    }

    /// Copy the zero-terminated const string at `const_addr` into a new
    /// `Unsigned8` array.
    pub fn alloc_string(&mut self, const_addr: Addr) -> Result<Addr, VmError> {
        let consts = self.consts;
        let bytes = memory::read_cstr(consts, Segment::Const, const_addr as usize)?;
        self.alloc_bytes(bytes)
    }

    /// New string entry holding `bytes` plus a terminator.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<Addr, VmError> {
        let addr = self.alloc_array(Type::Unsigned8, bytes.len() + 1)?;
        let at = addr as usize + HEAP_ENTRY_HEADER_SIZE;
        memory::write_bytes(self.memory, Segment::Heap, at, bytes)?;
        Ok(addr)
    }

    fn alloc_entry(&mut self, kind: EntryKind, data_size: usize) -> Result<Addr, VmError> {
        let requested = HEAP_ENTRY_HEADER_SIZE + data_size;
        let data_size_u32 =
            u32::try_from(data_size).map_err(|_| VmError::OutOfMemory { requested })?;
        if self.tail + requested <= self.memory.len() {
            let addr = self.tail as Addr;
            self.write_entry(addr, kind, data_size_u32, data_size_u32)?;
            self.tail += requested;
            return Ok(addr);
        }
        if let Some(placement) = layout::find_slot(&self.slots()?, data_size) {
            return self.place(placement, kind, data_size_u32);
        }
        self.compact()?;
        if let Some(placement) = layout::find_slot(&self.slots()?, data_size) {
            return self.place(placement, kind, data_size_u32);
        }
        Err(VmError::OutOfMemory { requested })
    }

    fn place(
        &mut self,
        placement: Placement,
        kind: EntryKind,
        data_size: u32,
    ) -> Result<Addr, VmError> {
        match placement {
            Placement::Reuse { addr } => {
                let alloc_size = self.entry(addr)?.alloc_size;
                self.write_entry(addr, kind, data_size, alloc_size)?;
                Ok(addr)
            }
            Placement::Split {
                owner,
                addr,
                alloc_size,
            } => {
                let owner_data = self.entry(owner)?.data_size;
                memory::write_u32(self.memory, Segment::Heap, owner as usize + 12, owner_data)?;
                self.write_entry(addr, kind, data_size, alloc_size)?;
                Ok(addr)
            }
        }
    }

    /// Write a fresh header with `ref_count == 0` and zero the payload.
    fn write_entry(
        &mut self,
        addr: Addr,
        kind: EntryKind,
        data_size: u32,
        alloc_size: u32,
    ) -> Result<(), VmError> {
        let at = addr as usize;
        memory::write_u32(self.memory, Segment::Heap, at, kind.to_header())?;
        memory::write_u32(self.memory, Segment::Heap, at + 4, 0)?;
        memory::write_u32(self.memory, Segment::Heap, at + 8, data_size)?;
        memory::write_u32(self.memory, Segment::Heap, at + 12, alloc_size)?;
        memory::slice_mut(
            self.memory,
            Segment::Heap,
            at + HEAP_ENTRY_HEADER_SIZE,
            data_size as usize,
        )?
        .fill(0);
        Ok(())
    }

    /// Merge runs of adjacent free entries. Returns how many entries were
    /// absorbed.
    pub fn compact(&mut self) -> Result<usize, VmError> {
        let slots = self.slots()?;
        let merged = layout::coalesce(&slots);
        for slot in &merged {
            let at = slot.addr as usize;
            if memory::read_u32(self.memory, Segment::Heap, at + 12)? != slot.alloc_size {
                memory::write_u32(self.memory, Segment::Heap, at + 12, slot.alloc_size)?;
            }
        }
        let absorbed = slots.len() - merged.len();
        debug!(absorbed, entries = merged.len(), "compacted heap");
        Ok(absorbed)
    }

    // --- Field access ---

    /// Absolute heap offset of byte `offset` of the entry's payload.
    pub fn get_field_addr(&self, entry: Addr, offset: usize) -> Result<usize, VmError> {
        self.field_range(entry, offset, 1)
    }

    fn field_range(&self, entry: Addr, offset: usize, width: usize) -> Result<usize, VmError> {
        let header = self.entry(entry)?;
        match offset.checked_add(width) {
            Some(end) if end <= header.data_size as usize => Ok(header.payload_offset() + offset),
            _ => Err(VmError::FieldOutOfBounds {
                addr: entry,
                offset,
                width,
                data_size: header.data_size,
            }),
        }
    }

    pub fn load(&self, entry: Addr, offset: usize, ty: Type) -> Result<Register, VmError> {
        let at = self.field_range(entry, offset, ty.size()?)?;
        memory::load_value(self.memory, Segment::Heap, at, ty)
    }

    pub fn store(
        &mut self,
        entry: Addr,
        offset: usize,
        ty: Type,
        value: Register,
    ) -> Result<(), VmError> {
        let at = self.field_range(entry, offset, ty.size()?)?;
        memory::store_value(self.memory, Segment::Heap, at, ty, value)
    }

    /// Overwrite payload bytes of `entry` starting at `offset`.
    pub fn write_payload(
        &mut self,
        entry: Addr,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), VmError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let at = self.field_range(entry, offset, bytes.len())?;
        memory::write_bytes(self.memory, Segment::Heap, at, bytes)
    }

    /// Copy `count` payload bytes between entries.
    pub fn copy_data(
        &mut self,
        from: Addr,
        from_offset: usize,
        to: Addr,
        to_offset: usize,
        count: usize,
    ) -> Result<(), VmError> {
        if count == 0 {
            return Ok(());
        }
        let src = self.field_range(from, from_offset, count)?;
        let dst = self.field_range(to, to_offset, count)?;
        self.memory.copy_within(src..src + count, dst);
        Ok(())
    }

    // --- Reference counting ---

    fn write_ref_count(&mut self, addr: Addr, count: u32) -> Result<(), VmError> {
        memory::write_u32(self.memory, Segment::Heap, addr as usize + 4, count)
    }

    /// Increment the count. On the 0 to 1 transition every contained
    /// reference is add-ref'd as well, transitively.
    pub fn add_ref(&mut self, addr: Addr) -> Result<u32, VmError> {
        if addr == 0 {
            return Ok(0);
        }
        let count = self.entry(addr)?.ref_count + 1;
        self.write_ref_count(addr, count)?;
        if count == 1 {
            let mut pending = self.view().contained_refs(addr)?;
            while let Some(child) = pending.pop() {
                let child_count = self.entry(child)?.ref_count + 1;
                self.write_ref_count(child, child_count)?;
                if child_count == 1 {
                    pending.extend(self.view().contained_refs(child)?);
                }
            }
        }
        Ok(count)
    }

    /// Decrement the count. On the 1 to 0 transition every contained
    /// reference is released as well, transitively.
    pub fn remove_ref(&mut self, addr: Addr) -> Result<u32, VmError> {
        if addr == 0 {
            return Ok(0);
        }
        let count = self.release_one(addr)?;
        if count == 0 {
            let mut pending = self.view().contained_refs(addr)?;
            while let Some(child) = pending.pop() {
                if self.release_one(child)? == 0 {
                    pending.extend(self.view().contained_refs(child)?);
                }
            }
        }
        Ok(count)
    }

    fn release_one(&mut self, addr: Addr) -> Result<u32, VmError> {
        let count = self
            .entry(addr)?
            .ref_count
            .checked_sub(1)
            .ok_or(VmError::RefCountUnderflow(addr))?;
        self.write_ref_count(addr, count)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::ConstWriter;

    fn heap_of(memory: &mut [u8]) -> Heap<'_> {
        Heap::new(memory, &[]).unwrap()
    }

    #[test]
    fn bump_allocation_from_reserved_start() {
        let mut memory = vec![0xee; 256];
        let mut heap = heap_of(&mut memory);
        let a = heap.alloc_array(Type::Int32, 10).unwrap();
        assert_eq!(a, 16);
        let entry = heap.entry(a).unwrap();
        assert_eq!(entry.kind, EntryKind::Array(Type::Int32));
        assert_eq!(entry.ref_count, 0);
        assert_eq!(entry.data_size, 40);
        assert_eq!(entry.alloc_size, 40);
        assert_eq!(entry.len().unwrap(), 10);
        assert_eq!(heap.tail(), 72);
        assert!(heap.view().data(a).unwrap().iter().all(|&b| b == 0));
        let b = heap.alloc_array(Type::Unsigned8, 3).unwrap();
        assert_eq!(b, 72);
        assert_eq!(heap.entries().unwrap().len(), 2);
    }

    #[test]
    fn nil_is_never_dereferenced() {
        let mut memory = vec![0; 64];
        let mut heap = heap_of(&mut memory);
        assert!(matches!(heap.entry(0), Err(VmError::NilDereference)));
        assert!(matches!(heap.get_field_addr(0, 0), Err(VmError::NilDereference)));
        assert_eq!(heap.add_ref(0).unwrap(), 0);
        assert_eq!(heap.remove_ref(0).unwrap(), 0);
    }

    #[test]
    fn field_access_is_bounds_checked() {
        let mut memory = vec![0; 128];
        let mut heap = heap_of(&mut memory);
        let a = heap.alloc_array(Type::Int32, 2).unwrap();
        assert_eq!(heap.get_field_addr(a, 7).unwrap(), 16 + 16 + 7);
        assert!(matches!(
            heap.get_field_addr(a, 8),
            Err(VmError::FieldOutOfBounds { offset: 8, data_size: 8, .. })
        ));
        heap.store(a, 4, Type::Int32, Register::from_i32(-9)).unwrap();
        assert_eq!(heap.load(a, 4, Type::Int32).unwrap().as_i32(), -9);
        assert!(heap.store(a, 6, Type::Int32, Register::ZERO).is_err());
    }

    #[test]
    fn free_slot_is_reused_when_tail_is_full() {
        let mut memory = vec![0; 16 + 16 + 40];
        let mut heap = heap_of(&mut memory);
        let a = heap.alloc_array(Type::Int32, 10).unwrap();
        heap.store(a, 0, Type::Int32, Register::from_i32(5)).unwrap();
        let b = heap.alloc_array(Type::Unsigned8, 12).unwrap();
        assert_eq!(a, b);
        let entry = heap.entry(b).unwrap();
        assert_eq!(entry.kind, EntryKind::Array(Type::Unsigned8));
        assert_eq!(entry.data_size, 12);
        assert_eq!(entry.alloc_size, 40);
        assert_eq!(heap.load(b, 0, Type::Int32).unwrap().as_i32(), 0);
    }

    #[test]
    fn live_slot_slack_is_split() {
        let mut memory = vec![0; 16 + 16 + 100];
        let mut heap = heap_of(&mut memory);
        heap.alloc_array(Type::Unsigned8, 100).unwrap();
        let b = heap.alloc_array(Type::Unsigned8, 10).unwrap();
        assert_eq!(b, 16);
        heap.add_ref(b).unwrap();

        let c = heap.alloc_array(Type::Unsigned8, 20).unwrap();
        assert_eq!(c, 42);
        let owner = heap.entry(b).unwrap();
        assert_eq!(owner.alloc_size, 10);
        assert_eq!(owner.ref_count, 1);
        let split = heap.entry(c).unwrap();
        assert_eq!(split.data_size, 20);
        assert_eq!(split.alloc_size, 74);
        assert_eq!(heap.entries().unwrap().len(), 2);
    }

    #[test]
    fn compaction_merges_free_neighbours_for_large_requests() {
        let mut memory = vec![0; 16 + 3 * 24];
        let mut heap = heap_of(&mut memory);
        for _ in 0..3 {
            heap.alloc_array(Type::Unsigned8, 8).unwrap();
        }
        let big = heap.alloc_array(Type::Unsigned8, 30).unwrap();
        assert_eq!(big, 16);
        let entry = heap.entry(big).unwrap();
        assert_eq!(entry.data_size, 30);
        assert_eq!(entry.alloc_size, 56);
        assert_eq!(heap.entries().unwrap().len(), 1);
    }

    #[test]
    fn compaction_skips_live_entries() {
        let mut memory = vec![0; 16 + 3 * 24];
        let mut heap = heap_of(&mut memory);
        let a = heap.alloc_array(Type::Unsigned8, 8).unwrap();
        heap.add_ref(a).unwrap();
        heap.alloc_array(Type::Unsigned8, 8).unwrap();
        heap.alloc_array(Type::Unsigned8, 8).unwrap();
        let big = heap.alloc_array(Type::Unsigned8, 30).unwrap();
        assert_eq!(big, 40);
        assert_eq!(heap.entry(big).unwrap().alloc_size, 32);
        assert_eq!(heap.compact().unwrap(), 0);
        assert_eq!(heap.entries().unwrap().len(), 2);
    }

    #[test]
    fn compaction_is_idempotent() {
        let mut memory = vec![0; 16 + 5 * 24];
        let mut heap = heap_of(&mut memory);
        let addrs: Vec<Addr> = (0..5)
            .map(|_| heap.alloc_array(Type::Unsigned8, 8).unwrap())
            .collect();
        heap.add_ref(addrs[1]).unwrap();

        assert_eq!(heap.compact().unwrap(), 2);
        let once = heap.entries().unwrap();
        let spans: Vec<(Addr, u32, u32)> = once
            .iter()
            .map(|e| (e.addr, e.ref_count, e.alloc_size))
            .collect();
        assert_eq!(spans, vec![(16, 0, 8), (40, 1, 8), (64, 0, 56)]);

        assert_eq!(heap.compact().unwrap(), 0);
        assert_eq!(heap.entries().unwrap(), once);
    }

    #[test]
    fn exhaustion_is_out_of_memory() {
        let mut memory = vec![0; 16 + 24];
        let mut heap = heap_of(&mut memory);
        let a = heap.alloc_array(Type::Unsigned8, 8).unwrap();
        heap.add_ref(a).unwrap();
        let err = heap.alloc_array(Type::Unsigned8, 8).unwrap_err();
        assert!(matches!(err, VmError::OutOfMemory { requested: 24 }));
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn refcounts_cascade_through_reference_arrays() {
        let mut memory = vec![0; 512];
        let mut heap = heap_of(&mut memory);
        let parent = heap.alloc_array(Type::Ref, 3).unwrap();
        let left = heap.alloc_array(Type::Unsigned8, 4).unwrap();
        let right = heap.alloc_array(Type::Unsigned8, 4).unwrap();
        heap.store(parent, 0, Type::Ref, Register::from_ref(left)).unwrap();
        heap.store(parent, 8, Type::Ref, Register::from_ref(right)).unwrap();

        assert_eq!(heap.add_ref(parent).unwrap(), 1);
        assert_eq!(heap.entry(left).unwrap().ref_count, 1);
        assert_eq!(heap.entry(right).unwrap().ref_count, 1);
        assert_eq!(heap.add_ref(parent).unwrap(), 2);
        assert_eq!(heap.entry(left).unwrap().ref_count, 1);

        assert_eq!(heap.remove_ref(parent).unwrap(), 1);
        assert_eq!(heap.entry(left).unwrap().ref_count, 1);
        assert_eq!(heap.remove_ref(parent).unwrap(), 0);
        assert_eq!(heap.entry(left).unwrap().ref_count, 0);
        assert_eq!(heap.entry(right).unwrap().ref_count, 0);
        assert!(matches!(
            heap.remove_ref(parent),
            Err(VmError::RefCountUnderflow(a)) if a == parent
        ));
    }

    #[test]
    fn refcounts_follow_object_reference_fields() {
        let mut consts = ConstWriter::new();
        let node = consts.type_meta("Node", &[], &[], &[Type::Int32, Type::Ref, Type::String]);
        let consts = consts.into_bytes();
        let mut memory = vec![0; 512];
        let mut heap = Heap::new(&mut memory, &consts).unwrap();

        let head = heap.alloc_obj(node).unwrap();
        assert_eq!(heap.entry(head).unwrap().data_size, 12);
        let next = heap.alloc_obj(node).unwrap();
        let name = heap.alloc_bytes(b"tail").unwrap();
        heap.store(head, 4, Type::Ref, Register::from_ref(next)).unwrap();
        heap.store(next, 8, Type::String, Register::from_ref(name)).unwrap();

        heap.add_ref(head).unwrap();
        assert_eq!(heap.entry(next).unwrap().ref_count, 1);
        assert_eq!(heap.entry(name).unwrap().ref_count, 1);
        assert_eq!(heap.view().read_string(name).unwrap(), "tail");
        assert_eq!(heap.view().type_name(&heap.entry(head).unwrap()).unwrap(), "Node");

        heap.remove_ref(head).unwrap();
        assert_eq!(heap.entry(next).unwrap().ref_count, 0);
        assert_eq!(heap.entry(name).unwrap().ref_count, 0);
    }

    #[test]
    fn cycles_terminate_but_leak() {
        let mut memory = vec![0; 256];
        let mut heap = heap_of(&mut memory);
        let a = heap.alloc_array(Type::Ref, 1).unwrap();
        let b = heap.alloc_array(Type::Ref, 1).unwrap();
        heap.store(a, 0, Type::Ref, Register::from_ref(b)).unwrap();
        heap.store(b, 0, Type::Ref, Register::from_ref(a)).unwrap();
        assert_eq!(heap.add_ref(a).unwrap(), 1);
        assert_eq!(heap.entry(a).unwrap().ref_count, 2);
        assert_eq!(heap.remove_ref(a).unwrap(), 1);
        assert_eq!(heap.entry(b).unwrap().ref_count, 1);
    }

    #[test]
    fn view_walks_until_unwritten_header() {
        let mut memory = vec![0; 256];
        {
            let mut heap = heap_of(&mut memory);
            heap.alloc_array(Type::Float64, 2).unwrap();
            let s = heap.alloc_bytes(b"hi").unwrap();
            heap.add_ref(s).unwrap();
        }
        let view = HeapView::new(&memory, &[]);
        let entries = view.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].addr, 48);
        assert_eq!(entries[1].ref_count, 1);
        assert_eq!(entries[1].data_size, 3);
        assert_eq!(view.read_string(48).unwrap(), "hi");
        assert_eq!(view.type_name(&entries[0]).unwrap(), "F64[]");
    }
}
