//! Per-port command slot queue.
//!
//! Tracks which hardware slots hold an in-flight transfer, parks transfers
//! that cannot start yet, and enforces the mixing rule: queued (tagged)
//! transfers share the slot set, while an untagged transfer requires the
//! queue to itself.

use std::collections::VecDeque;

use crate::regs::MAX_SLOTS;
use crate::xfer::{Xfer, XferFlags};

pub struct SlotQueue {
    max_openings: u8,
    active_mask: u32,
    active: Vec<Option<Xfer>>,
    pending: VecDeque<Xfer>,
    freeze_count: u32,
}

impl SlotQueue {
    pub fn new(max_openings: u8) -> Self {
        let max_openings = max_openings.clamp(1, MAX_SLOTS);
        Self {
            max_openings,
            active_mask: 0,
            active: (0..MAX_SLOTS).map(|_| None).collect(),
            pending: VecDeque::new(),
            freeze_count: 0,
        }
    }

    pub fn max_openings(&self) -> u8 {
        self.max_openings
    }

    pub fn active_mask(&self) -> u32 {
        self.active_mask
    }

    pub fn active_count(&self) -> u32 {
        self.active_mask.count_ones()
    }

    pub fn is_active(&self, slot: u8) -> bool {
        self.active_mask & (1 << slot) != 0
    }

    pub fn is_idle(&self) -> bool {
        self.active_mask == 0
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Lowest free slot for a transfer, or `None` when it must wait.
    ///
    /// An untagged transfer only starts on an idle queue; a tagged transfer
    /// additionally refuses to join an active untagged one.
    pub fn alloc_slot(&mut self, ncq: bool) -> Option<u8> {
        if self.active_count() >= u32::from(self.max_openings) {
            return None;
        }
        if !ncq && !self.is_idle() {
            return None;
        }
        if ncq && self.active_non_ncq() {
            return None;
        }
        let slot = (!self.active_mask).trailing_zeros() as u8;
        (slot < MAX_SLOTS).then_some(slot)
    }

    pub fn activate(&mut self, slot: u8, xfer: Xfer) {
        debug_assert!(!self.is_active(slot));
        debug_assert_eq!(xfer.slot, slot);
        self.active_mask |= 1 << slot;
        self.active[slot as usize] = Some(xfer);
    }

    /// Removes and returns the transfer occupying a hardware slot.
    pub fn take(&mut self, slot: u8) -> Option<Xfer> {
        let xfer = self.active[slot as usize].take()?;
        self.active_mask &= !(1 << slot);
        Some(xfer)
    }

    pub fn peek(&self, slot: u8) -> Option<&Xfer> {
        self.active[slot as usize].as_ref()
    }

    pub fn active_mut(&mut self, slot: u8) -> Option<&mut Xfer> {
        self.active[slot as usize].as_mut()
    }

    /// The sole in-flight transfer, when exactly one slot is busy.
    pub fn single_active(&self) -> Option<&Xfer> {
        if self.active_count() != 1 {
            return None;
        }
        let slot = self.active_mask.trailing_zeros() as usize;
        self.active[slot].as_ref()
    }

    pub fn push_pending(&mut self, xfer: Xfer) {
        self.pending.push_back(xfer);
    }

    /// Requeue at the front, ahead of everything parked.
    pub fn push_pending_front(&mut self, xfer: Xfer) {
        self.pending.push_front(xfer);
    }

    pub fn pop_pending(&mut self) -> Option<Xfer> {
        self.pending.pop_front()
    }

    pub fn pop_pending_back(&mut self) -> Option<Xfer> {
        self.pending.pop_back()
    }

    /// Pulls every in-flight transfer off the queue, ascending slot order.
    pub fn drain_active(&mut self) -> Vec<Xfer> {
        let mut out = Vec::new();
        for slot in 0..MAX_SLOTS {
            if let Some(xfer) = self.take(slot) {
                out.push(xfer);
            }
        }
        out
    }

    pub fn freeze(&mut self) {
        self.freeze_count += 1;
    }

    pub fn thaw(&mut self) {
        debug_assert!(self.freeze_count > 0);
        self.freeze_count = self.freeze_count.saturating_sub(1);
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze_count > 0
    }

    fn active_non_ncq(&self) -> bool {
        self.active
            .iter()
            .flatten()
            .any(|x| !x.flags.contains(XferFlags::NCQ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_xfer;

    #[test]
    fn tagged_transfers_fill_ascending_slots() {
        let mut q = SlotQueue::new(MAX_SLOTS);
        for expect in 0..4u8 {
            let slot = q.alloc_slot(true).unwrap();
            assert_eq!(slot, expect);
            q.activate(slot, test_xfer(slot, XferFlags::NCQ));
        }
        assert_eq!(q.active_mask(), 0b1111);
        assert!(q.take(1).is_some());
        assert_eq!(q.alloc_slot(true), Some(1));
    }

    #[test]
    fn untagged_requires_idle_queue() {
        let mut q = SlotQueue::new(MAX_SLOTS);
        let slot = q.alloc_slot(true).unwrap();
        q.activate(slot, test_xfer(slot, XferFlags::NCQ));
        assert_eq!(q.alloc_slot(false), None);
        q.take(slot);
        assert_eq!(q.alloc_slot(false), Some(0));
    }

    #[test]
    fn tagged_waits_behind_untagged() {
        let mut q = SlotQueue::new(MAX_SLOTS);
        let slot = q.alloc_slot(false).unwrap();
        q.activate(slot, test_xfer(slot, XferFlags::empty()));
        assert_eq!(q.alloc_slot(true), None);
    }

    #[test]
    fn openings_cap_concurrency() {
        let mut q = SlotQueue::new(2);
        for _ in 0..2 {
            let slot = q.alloc_slot(true).unwrap();
            q.activate(slot, test_xfer(slot, XferFlags::NCQ));
        }
        assert_eq!(q.alloc_slot(true), None);
    }

    #[test]
    fn drain_returns_ascending_slot_order() {
        let mut q = SlotQueue::new(MAX_SLOTS);
        for slot in [4u8, 1, 7] {
            q.activate(slot, test_xfer(slot, XferFlags::NCQ));
        }
        let drained: Vec<u8> = q.drain_active().iter().map(|x| x.slot()).collect();
        assert_eq!(drained, vec![1, 4, 7]);
        assert!(q.is_idle());
    }
}
