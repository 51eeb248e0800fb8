//! Untagged 8-byte register cell.
//!
//! A register carries no type information: the opcode reading it decides
//! which view applies. The accessors below are the only place the bits are
//! reinterpreted.

use crate::memory::Addr;
use std::fmt;

/// Width of one register in the register segment.
pub const REGISTER_SIZE: usize = 8;

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Register(u64);

impl Register {
    pub const ZERO: Register = Register(0);

    // --- Construction ---

    pub fn from_bits(bits: u64) -> Self {
        Register(bits)
    }

    /// Upper 32 bits are cleared.
    pub fn from_i32(v: i32) -> Self {
        Register(v as u32 as u64)
    }

    pub fn from_bool(v: bool) -> Self {
        Register::from_i32(v as i32)
    }

    pub fn from_ref(addr: Addr) -> Self {
        Register(addr as u64)
    }

    pub fn from_f64(v: f64) -> Self {
        Register(v.to_bits())
    }

    pub fn from_ptr(v: i64) -> Self {
        Register(v as u64)
    }

    // --- Views ---

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn as_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    pub fn as_ref(self) -> Addr {
        self.0 as u32
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn as_ptr(self) -> i64 {
        self.0 as i64
    }

    pub fn is_true(self) -> bool {
        self.as_i32() != 0
    }

    // --- Encoding ---

    pub fn to_bytes(self) -> [u8; REGISTER_SIZE] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; REGISTER_SIZE]) -> Self {
        Register(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}|{}", self.as_ref(), self.as_i32())
    }
}

/// Read-only view of one frame's register window.
#[derive(Clone, Copy)]
pub struct RegisterWindow<'a> {
    bytes: &'a [u8],
}

impl<'a> RegisterWindow<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / REGISTER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Register> {
        let start = index.checked_mul(REGISTER_SIZE)?;
        let chunk = self.bytes.get(start..start + REGISTER_SIZE)?;
        let mut raw = [0u8; REGISTER_SIZE];
        raw.copy_from_slice(chunk);
        Some(Register::from_bytes(raw))
    }

    pub fn iter(&self) -> impl Iterator<Item = Register> + 'a {
        self.bytes.chunks_exact(REGISTER_SIZE).map(|chunk| {
            let mut raw = [0u8; REGISTER_SIZE];
            raw.copy_from_slice(chunk);
            Register::from_bytes(raw)
        })
    }
}

impl fmt::Debug for RegisterWindow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_views_clear_upper_bits() {
        let r = Register::from_i32(-1);
        assert_eq!(r.bits(), 0xffff_ffff);
        assert_eq!(r.as_i32(), -1);
        assert_eq!(r.as_ref(), u32::MAX);
        assert_eq!(Register::from_ref(0x123ab).as_i32(), 0x123ab);
    }

    #[test]
    fn wide_views_keep_all_bits() {
        let r = Register::from_f64(1000.125);
        assert_eq!(r.as_f64(), 1000.125);
        assert_eq!(Register::from_bytes(r.to_bytes()), r);
        assert_eq!(Register::from_ptr(-5).as_ptr(), -5);
    }

    #[test]
    fn window_reads_registers_in_order() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&Register::from_i32(7).to_bytes());
        bytes.extend_from_slice(&Register::from_f64(2.5).to_bytes());
        let window = RegisterWindow::new(&bytes);
        assert_eq!(window.len(), 2);
        assert_eq!(window.get(0).map(Register::as_i32), Some(7));
        assert_eq!(window.get(1).map(Register::as_f64), Some(2.5));
        assert!(window.get(2).is_none());
        assert_eq!(window.iter().count(), 2);
    }
}
