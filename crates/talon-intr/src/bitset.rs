//! Lock-free 32-bit bitmap used for all pending/blocked interrupt state.
//!
//! Every bitmap in this crate (pending IRQs per controller, pending IPLs,
//! pending/blocked controller sets per CPU) is a single word of at most 32
//! bits, mutated with atomic OR/AND-NOT so interrupt marking can race with
//! delivery without a lock.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct AtomicBitset(AtomicU32);

impl AtomicBitset {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.load() == 0
    }

    #[inline]
    pub fn test(&self, bit: u32) -> bool {
        debug_assert!(bit < 32);
        self.load() & (1 << bit) != 0
    }

    /// Sets `bit`, returning whether it was already set.
    #[inline]
    pub fn set(&self, bit: u32) -> bool {
        debug_assert!(bit < 32);
        self.0.fetch_or(1 << bit, Ordering::AcqRel) & (1 << bit) != 0
    }

    /// Clears `bit`, returning whether it was set.
    #[inline]
    pub fn clear(&self, bit: u32) -> bool {
        debug_assert!(bit < 32);
        self.0.fetch_and(!(1 << bit), Ordering::AcqRel) & (1 << bit) != 0
    }

    /// ORs `mask` in, returning the previous word.
    #[inline]
    pub fn or(&self, mask: u32) -> u32 {
        self.0.fetch_or(mask, Ordering::AcqRel)
    }

    /// Clears every bit in `mask`, returning the previous word.
    #[inline]
    pub fn and_not(&self, mask: u32) -> u32 {
        self.0.fetch_and(!mask, Ordering::AcqRel)
    }

    /// Atomically takes the whole word, leaving it empty.
    #[inline]
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }

    /// Highest set bit, the way a priority scan wants it.
    #[inline]
    pub fn highest_set(&self) -> Option<u32> {
        highest_bit(self.load())
    }
}

/// Index of the highest set bit in `word`, if any.
#[inline]
pub fn highest_bit(word: u32) -> Option<u32> {
    if word == 0 {
        None
    } else {
        Some(31 - word.leading_zeros())
    }
}

/// Index of the lowest set bit in `word`, if any.
#[inline]
pub fn lowest_bit(word: u32) -> Option<u32> {
    if word == 0 {
        None
    } else {
        Some(word.trailing_zeros())
    }
}
