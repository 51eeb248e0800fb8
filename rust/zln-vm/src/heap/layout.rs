//! Pure placement and compaction planning over heap entry layouts.
//!
//! Entries tile the heap contiguously: each one spans its header plus
//! `alloc_size` payload bytes. Nothing here touches memory; the heap reads
//! the current slots, asks for a plan, and rewrites the affected headers.

use super::HEAP_ENTRY_HEADER_SIZE;
use crate::memory::Addr;

/// Placement bookkeeping of one heap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub addr: Addr,
    pub ref_count: u32,
    pub data_size: u32,
    pub alloc_size: u32,
}

impl Slot {
    pub fn is_free(&self) -> bool {
        self.ref_count == 0
    }

    /// Bytes covered by the entry, header included.
    pub fn span(&self) -> usize {
        HEAP_ENTRY_HEADER_SIZE + self.alloc_size as usize
    }

    /// Trailing payload bytes beyond the live data.
    pub fn slack(&self) -> usize {
        self.alloc_size.saturating_sub(self.data_size) as usize
    }
}

/// Where a request of some data size can be placed without growing the
/// tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Reuse a free entry in place; its `alloc_size` is kept.
    Reuse { addr: Addr },
    /// Shrink a live entry to its data size and carve a new entry out of
    /// its slack.
    Split { owner: Addr, addr: Addr, alloc_size: u32 },
}

/// First slot, in address order, that can take `data_size` bytes.
pub fn find_slot(slots: &[Slot], data_size: usize) -> Option<Placement> {
    slots.iter().find_map(|slot| {
        if slot.is_free() {
            (slot.alloc_size as usize >= data_size).then_some(Placement::Reuse { addr: slot.addr })
        } else if slot.slack() >= HEAP_ENTRY_HEADER_SIZE + data_size {
            let addr = slot.addr as usize + HEAP_ENTRY_HEADER_SIZE + slot.data_size as usize;
            let alloc_size = slot.slack() - HEAP_ENTRY_HEADER_SIZE;
            Some(Placement::Split {
                owner: slot.addr,
                addr: addr as Addr,
                alloc_size: alloc_size as u32,
            })
        } else {
            None
        }
    })
}

/// Merge every maximal run of adjacent free slots into the run's first
/// slot. Live slots are returned untouched.
pub fn coalesce(slots: &[Slot]) -> Vec<Slot> {
    let mut merged: Vec<Slot> = Vec::with_capacity(slots.len());
    for slot in slots {
        match merged.last_mut() {
            Some(prev) if prev.is_free() && slot.is_free() => {
                prev.alloc_size += slot.span() as u32;
            }
            _ => merged.push(*slot),
        }
    }
    merged
}
