//! Pending-interrupt bookkeeping and the two-phase delivery loop.
//!
//! Phase one runs in the (modeled) interrupt entry: the controller's pending
//! lines are read, blocked in hardware, and latched into per-controller and
//! per-CPU bitmaps. Phase two drains the latched state highest priority level
//! first, running each handler with interrupts re-enabled, then unblocks the
//! delivered lines per controller in one batch.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::bitset::{lowest_bit, AtomicBitset};
use crate::pic::Pic;
use crate::registry::IntrRegistry;
use crate::source::{Handled, IntrFrame, IntrSource};
use crate::{IPL_HIGH, IPL_NONE};

/// Per-CPU dispatch state.
///
/// `intr_enabled` models the CPU interrupt-enable flag: delivery keeps it
/// clear except for the window around each handler call, which is the only
/// time nested interrupts may be taken.
pub struct CpuState {
    pub(crate) index: usize,
    cpl: AtomicU8,
    /// Priority levels with at least one latched line, across controllers.
    pub(crate) pending_ipls: AtomicBitset,
    /// Controllers with latched pending lines.
    pub(crate) pending_pics: AtomicBitset,
    /// Controllers with lines still blocked in hardware.
    pub(crate) blocked_pics: AtomicBitset,
    ast_pending: AtomicBool,
    intr_enabled: AtomicBool,
    asts: AtomicU64,
}

impl CpuState {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            cpl: AtomicU8::new(IPL_NONE),
            pending_ipls: AtomicBitset::new(),
            pending_pics: AtomicBitset::new(),
            blocked_pics: AtomicBitset::new(),
            ast_pending: AtomicBool::new(false),
            intr_enabled: AtomicBool::new(false),
            asts: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Current priority level; handlers at or below it are held pending.
    pub fn cpl(&self) -> u8 {
        self.cpl.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpl(&self, ipl: u8) {
        self.cpl.store(ipl, Ordering::Release);
    }

    /// Whether delivery currently has interrupts enabled (true only inside a
    /// handler call).
    pub fn interrupts_enabled(&self) -> bool {
        self.intr_enabled.load(Ordering::Acquire)
    }

    /// Requests an asynchronous software trap; run by the next drain that
    /// returns to `IPL_NONE`.
    pub fn post_ast(&self) {
        self.ast_pending.store(true, Ordering::Release);
    }

    pub fn ast_count(&self) -> u64 {
        self.asts.load(Ordering::Relaxed)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_ipls.is_empty()
    }

    pub(crate) fn note_pending(&self, pic: &Pic, ipl_mask: u32) {
        self.pending_pics.set(pic.id as u32);
        self.pending_ipls.or(ipl_mask);
    }

    pub(crate) fn note_blocked(&self, pic: &Pic) {
        self.blocked_pics.set(pic.id as u32);
    }

    fn take_ast(&self) -> bool {
        self.ast_pending.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for CpuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuState")
            .field("index", &self.index)
            .field("cpl", &self.cpl())
            .field("pending_ipls", &self.pending_ipls.load())
            .finish_non_exhaustive()
    }
}

impl IntrRegistry {
    /// Interrupt entry for one controller: reads its pending lines, latches
    /// them, and drains everything above the current priority level.
    pub fn handle_intr(&self, cpu_index: usize, pic: &Arc<Pic>) {
        let cpu = self.cpu(cpu_index);
        let mask = pic.ops().find_pending_irqs();
        if mask != 0 {
            pic.mark_pending_sources(cpu, mask);
            cpu.note_blocked(pic);
        }
        self.do_pending_interrupts(cpu_index, cpu.cpl());
    }

    /// Latches one line pending without a hardware round-trip (software
    /// interrupt). Delivery happens at the next drain.
    pub fn mark_pending(&self, cpu_index: usize, pic: &Arc<Pic>, irq: u32) {
        pic.mark_pending(self.cpu(cpu_index), irq);
    }

    /// Raises the priority level, returning the previous one. Never delivers.
    pub fn raise_ipl(&self, cpu_index: usize, ipl: u8) -> u8 {
        let cpu = self.cpu(cpu_index);
        let old = cpu.cpl();
        if ipl > old {
            cpu.set_cpl(ipl);
            self.hw_set_priority(ipl);
        }
        old
    }

    /// Restores a saved priority level, draining anything that latched above
    /// it while it was raised.
    pub fn restore_ipl(&self, cpu_index: usize, ipl: u8) {
        self.do_pending_interrupts(cpu_index, ipl);
    }

    /// Drains latched interrupts down to `newipl`, highest level first.
    ///
    /// At `IPL_HIGH` nothing can be pending by construction; the drain is a
    /// no-op until the level is lowered. Controllers are visited in
    /// registration order and lines within a controller in ascending order,
    /// so equal-priority sources have a fixed service order.
    pub fn do_pending_interrupts(&self, cpu_index: usize, newipl: u8) {
        let cpu = self.cpu(cpu_index);
        if newipl == IPL_HIGH {
            debug_assert_eq!(cpu.cpl(), IPL_HIGH);
            return;
        }

        loop {
            let Some(hipl) = cpu.pending_ipls.highest_set() else {
                break;
            };
            let hipl = hipl as u8;
            if hipl <= newipl {
                break;
            }
            // A re-mark during delivery sets this again and we go around.
            cpu.pending_ipls.clear(hipl as u32);
            cpu.set_cpl(hipl);
            self.deliver_irqs(cpu, hipl);
            debug_assert_eq!(cpu.cpl(), hipl);
        }

        if cpu.cpl() != newipl {
            self.hw_set_priority(newipl);
            cpu.set_cpl(newipl);
        }

        if newipl == IPL_NONE && cpu.take_ast() {
            cpu.asts.fetch_add(1, Ordering::Relaxed);
            let hook = self.lock_ast_hook();
            if let Some(hook) = hook.as_ref() {
                hook(cpu.index);
            }
        }
    }

    /// One delivery pass over every controller with lines latched at `ipl`.
    fn deliver_irqs(&self, cpu: &CpuState, ipl: u8) {
        let mut pics_mask = cpu.pending_pics.load();
        while let Some(pic_id) = lowest_bit(pics_mask) {
            pics_mask &= !(1 << pic_id);
            let Ok(pic) = self.pic_by_id(pic_id as usize) else {
                continue;
            };
            if !pic.pending_ipls.test(ipl as u32) {
                continue;
            }
            pic.pending_ipls.clear(ipl as u32);
            self.deliver_pic_irqs(cpu, &pic, ipl);
            if pic.pending_ipls.is_empty() && pic.pending_irqs.is_empty() {
                cpu.pending_pics.clear(pic.id as u32);
            }
        }
    }

    /// Drains one controller's lines at `ipl`, then unblocks what was
    /// delivered in a single batch.
    fn deliver_pic_irqs(&self, cpu: &CpuState, pic: &Arc<Pic>, ipl: u8) {
        let at_ipl = self.ipl_irq_mask(pic.id, ipl);
        let mut delivered = 0u32;

        loop {
            let mut pending = pic.pending_irqs.load() & at_ipl;
            if pending == 0 {
                break;
            }
            while let Some(irq) = lowest_bit(pending) {
                pending &= !(1 << irq);
                pic.pending_irqs.clear(irq);
                delivered |= 1 << irq;
                if let Some(src) = pic.source(irq) {
                    self.dispatch(cpu, pic, &src, ipl);
                } else {
                    pic.strays.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(pic = pic.name(), irq, "pending line with no source");
                }
            }
        }

        let unblock = pic.blocked_irqs.load() & delivered;
        if unblock != 0 {
            pic.blocked_irqs.and_not(unblock);
            pic.ops().unblock_irqs(unblock);
        }
        if pic.blocked_irqs.is_empty() {
            cpu.blocked_pics.clear(pic.id as u32);
        }
    }

    /// Runs one handler. Interrupts are re-enabled for the duration of the
    /// call; handlers not marked multiprocessor-safe run under the big lock,
    /// and must not still hold it when they return.
    fn dispatch(&self, cpu: &CpuState, pic: &Arc<Pic>, src: &Arc<IntrSource>, ipl: u8) {
        let frame = IntrFrame {
            cpu: cpu.index,
            ipl,
        };
        src.record_event(cpu.index);

        cpu.intr_enabled.store(true, Ordering::Release);
        let handled = if !src.is_mpsafe() {
            let _big = self.kernel_lock.lock().unwrap_or_else(|e| e.into_inner());
            let depth = self.kernel_lock_depth.fetch_add(1, Ordering::AcqRel);
            debug_assert_eq!(depth, 0);
            let handled = (src.handler)(&frame);
            let depth = self.kernel_lock_depth.fetch_sub(1, Ordering::AcqRel);
            debug_assert_eq!(depth, 1);
            handled
        } else {
            (src.handler)(&frame)
        };
        cpu.intr_enabled.store(false, Ordering::Release);

        if handled == Handled::No {
            pic.strays.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                pic = pic.name(),
                irq = src.irq(),
                "handler reported nothing outstanding"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_state_defaults() {
        let cpu = CpuState::new(0);
        assert_eq!(cpu.cpl(), IPL_NONE);
        assert!(!cpu.has_pending());
        assert!(!cpu.interrupts_enabled());
    }
}
