//! Register and coil storage served by a slave
//!
//! A [`Mapping`] is a cheap handle (`Arc`) to four fixed-size tables. The
//! engine writes into the tables in place while serving a request and the
//! caller sees the result through the handle it already holds, so nothing is
//! ever copied between the two. Cells are atomics: concurrent access is
//! memory-safe, ordering between a request and a caller's read is up to the
//! caller.

use core::fmt;
use core::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

static NEXT_MAPPING_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique mapping identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MappingId(u64);

impl MappingId {
    fn next() -> Self {
        MappingId(NEXT_MAPPING_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MappingId({})", self.0)
    }
}

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct MappingInner {
    id: MappingId,
    bits: Box<[AtomicU8]>,
    input_bits: Box<[AtomicU8]>,
    registers: Box<[AtomicU16]>,
    input_registers: Box<[AtomicU16]>,
}

/// Shared handle to coil, discrete input, holding and input register tables.
#[derive(Clone)]
pub struct Mapping {
    inner: Arc<MappingInner>,
}

fn zeroed_u8(n: usize) -> Box<[AtomicU8]> {
    (0..n).map(|_| AtomicU8::new(0)).collect()
}

fn zeroed_u16(n: usize) -> Box<[AtomicU16]> {
    (0..n).map(|_| AtomicU16::new(0)).collect()
}

impl Mapping {
    /// Allocate zeroed tables. Bits are stored one per byte (0 or 1).
    pub fn new(
        nb_bits: usize,
        nb_input_bits: usize,
        nb_registers: usize,
        nb_input_registers: usize,
    ) -> Self {
        Self {
            inner: Arc::new(MappingInner {
                id: MappingId::next(),
                bits: zeroed_u8(nb_bits),
                input_bits: zeroed_u8(nb_input_bits),
                registers: zeroed_u16(nb_registers),
                input_registers: zeroed_u16(nb_input_registers),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> MappingId {
        self.inner.id
    }

    /// True if both handles refer to the same tables.
    #[inline]
    pub fn same_as(&self, other: &Mapping) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // --- table views ---

    /// Coils (read/write bits).
    #[inline]
    pub fn bits(&self) -> &[AtomicU8] {
        &self.inner.bits
    }

    /// Discrete inputs (read-only bits).
    #[inline]
    pub fn input_bits(&self) -> &[AtomicU8] {
        &self.inner.input_bits
    }

    /// Holding registers.
    #[inline]
    pub fn registers(&self) -> &[AtomicU16] {
        &self.inner.registers
    }

    #[inline]
    pub fn input_registers(&self) -> &[AtomicU16] {
        &self.inner.input_registers
    }

    pub fn nb_bits(&self) -> usize {
        self.inner.bits.len()
    }

    pub fn nb_input_bits(&self) -> usize {
        self.inner.input_bits.len()
    }

    pub fn nb_registers(&self) -> usize {
        self.inner.registers.len()
    }

    pub fn nb_input_registers(&self) -> usize {
        self.inner.input_registers.len()
    }

    // --- cell access, `None` when out of range ---

    pub fn get_bit(&self, addr: usize) -> Option<bool> {
        self.bits().get(addr).map(|b| b.load(Ordering::Acquire) != 0)
    }

    pub fn set_bit(&self, addr: usize, value: bool) -> Option<()> {
        self.bits().get(addr).map(|b| b.store(value as u8, Ordering::Release))
    }

    pub fn get_input_bit(&self, addr: usize) -> Option<bool> {
        self.input_bits().get(addr).map(|b| b.load(Ordering::Acquire) != 0)
    }

    pub fn set_input_bit(&self, addr: usize, value: bool) -> Option<()> {
        self.input_bits()
            .get(addr)
            .map(|b| b.store(value as u8, Ordering::Release))
    }

    pub fn get_register(&self, addr: usize) -> Option<u16> {
        self.registers().get(addr).map(|r| r.load(Ordering::Acquire))
    }

    pub fn set_register(&self, addr: usize, value: u16) -> Option<()> {
        self.registers().get(addr).map(|r| r.store(value, Ordering::Release))
    }

    pub fn get_input_register(&self, addr: usize) -> Option<u16> {
        self.input_registers().get(addr).map(|r| r.load(Ordering::Acquire))
    }

    pub fn set_input_register(&self, addr: usize, value: u16) -> Option<()> {
        self.input_registers()
            .get(addr)
            .map(|r| r.store(value, Ordering::Release))
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("id", &self.inner.id)
            .field("nb_bits", &self.nb_bits())
            .field("nb_input_bits", &self.nb_input_bits())
            .field("nb_registers", &self.nb_registers())
            .field("nb_input_registers", &self.nb_input_registers())
            .finish()
    }
}

// Bulk helpers used when serving requests. `start + count` must already be
// range checked by the caller.

/// Load `count` bits starting at `start`.
pub fn load_bits(table: &[AtomicU8], start: usize, count: usize) -> Vec<bool> {
    table[start..start + count]
        .iter()
        .map(|b| b.load(Ordering::Acquire) != 0)
        .collect()
}

/// Store `values` starting at `start`.
pub fn store_bits(table: &[AtomicU8], start: usize, values: &[bool]) {
    for (cell, &v) in table[start..start + values.len()].iter().zip(values) {
        cell.store(v as u8, Ordering::Release);
    }
}

pub fn load_registers(table: &[AtomicU16], start: usize, count: usize) -> Vec<u16> {
    table[start..start + count]
        .iter()
        .map(|r| r.load(Ordering::Acquire))
        .collect()
}

pub fn store_registers(table: &[AtomicU16], start: usize, values: &[u16]) {
    for (cell, &v) in table[start..start + values.len()].iter().zip(values) {
        cell.store(v, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_unique() {
        let a = Mapping::new(1, 1, 1, 1);
        let b = Mapping::new(1, 1, 1, 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn test_shared_not_copied() {
        let m = Mapping::new(8, 0, 4, 0);
        let engine_side = m.clone();
        engine_side.set_register(2, 0xBEEF).unwrap();
        engine_side.set_bit(7, true).unwrap();
        assert_eq!(m.get_register(2), Some(0xBEEF));
        assert_eq!(m.get_bit(7), Some(true));
        assert!(m.same_as(&engine_side));
    }

    #[test]
    fn test_bounds() {
        let m = Mapping::new(2, 3, 4, 5);
        assert_eq!(m.nb_bits(), 2);
        assert_eq!(m.nb_input_bits(), 3);
        assert_eq!(m.nb_registers(), 4);
        assert_eq!(m.nb_input_registers(), 5);
        assert_eq!(m.get_bit(2), None);
        assert_eq!(m.set_input_register(5, 1), None);
        assert_eq!(m.get_input_register(4), Some(0));
    }

    #[test]
    fn test_bulk_helpers() {
        let m = Mapping::new(4, 0, 4, 0);
        store_bits(m.bits(), 1, &[true, false, true]);
        assert_eq!(load_bits(m.bits(), 0, 4), vec![false, true, false, true]);
        store_registers(m.registers(), 2, &[10, 20]);
        assert_eq!(load_registers(m.registers(), 1, 3), vec![0, 10, 20]);
    }

    #[test]
    fn test_concurrent_writers() {
        let m = Mapping::new(0, 0, 1, 0);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.registers()[0].fetch_add(1, Ordering::AcqRel);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.get_register(0), Some(4000));
    }
}
