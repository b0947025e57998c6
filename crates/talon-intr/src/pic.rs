//! Controller object and the capability trait a hardware model implements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::bitset::AtomicBitset;
use crate::dispatch::CpuState;
use crate::registry::{Error, Result};
use crate::source::IntrSource;

/// Most lines a single controller can own; all per-controller bitmaps are one
/// 32-bit word.
pub const PIC_MAX_SOURCES: u32 = 32;

/// Backend operations for one interrupt controller.
///
/// `find_pending_irqs`, `block_irqs` and `unblock_irqs` are the required
/// core; everything else is an optional capability probed at runtime. Masks
/// are in controller-local line numbering.
pub trait PicOps: Send {
    /// Reads and acknowledges the hardware pending state, returning the mask
    /// of lines that fired. The dispatcher blocks and latches them; the
    /// implementation must not re-report a line until it is unblocked.
    fn find_pending_irqs(&mut self) -> u32;

    /// Masks the given lines at the controller.
    fn block_irqs(&mut self, mask: u32);

    /// Unmasks the given lines. A level-triggered line still asserted will be
    /// reported again by the next `find_pending_irqs`.
    fn unblock_irqs(&mut self, mask: u32);

    /// Programs per-line hardware state when a source is established.
    fn establish_irq(&mut self, _src: &IntrSource) {}

    /// Controller-specific name for a line, used in `intr_string` output.
    fn source_name(&self, irq: u32) -> String {
        format!("irq {irq}")
    }

    /// Whether this controller can raise/lower the CPU priority threshold.
    /// Only the primary controller (slot 0) may report true.
    fn supports_set_priority(&self) -> bool {
        false
    }

    fn set_priority(&mut self, _ipl: u8) {}

    /// Routes a line to a CPU set.
    fn set_affinity(&mut self, _irq: u32, _cpus: u32) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// CPU set a line is routed to.
    fn get_affinity(&self, _irq: u32) -> Result<u32> {
        Err(Error::NotSupported)
    }

    fn cpu_init(&mut self, _cpu: usize) {}

    fn ipi_send(&mut self, _cpus: u32, _ipi: u32) -> Result<()> {
        Err(Error::NotSupported)
    }
}

/// One registered interrupt controller.
///
/// The hardware backend lives behind `ops`; pending/blocked line state is
/// kept here so marking from an interrupt path and delivery from another CPU
/// can both touch it without taking the backend lock.
pub struct Pic {
    name: String,
    pub(crate) id: usize,
    pub(crate) irqbase: u32,
    pub(crate) max_sources: u32,
    pub(crate) ops: Mutex<Box<dyn PicOps>>,
    pub(crate) sources: RwLock<Vec<Option<Arc<IntrSource>>>>,
    /// Lines that fired and await delivery.
    pub(crate) pending_irqs: AtomicBitset,
    /// Lines masked in hardware until their delivery completes.
    pub(crate) blocked_irqs: AtomicBitset,
    /// Priority levels with at least one pending line.
    pub(crate) pending_ipls: AtomicBitset,
    /// Deliveries whose handler reported nothing outstanding.
    pub(crate) strays: AtomicU64,
}

impl Pic {
    pub fn new(name: &str, max_sources: u32, ops: Box<dyn PicOps>) -> Self {
        assert!(
            max_sources <= PIC_MAX_SOURCES,
            "{name}: {max_sources} sources exceeds the per-controller limit"
        );
        Self {
            name: name.to_owned(),
            id: usize::MAX,
            irqbase: 0,
            max_sources,
            ops: Mutex::new(ops),
            sources: RwLock::new((0..max_sources).map(|_| None).collect()),
            pending_irqs: AtomicBitset::new(),
            blocked_irqs: AtomicBitset::new(),
            pending_ipls: AtomicBitset::new(),
            strays: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// First global IRQ number owned by this controller.
    pub fn irqbase(&self) -> u32 {
        self.irqbase
    }

    pub fn max_sources(&self) -> u32 {
        self.max_sources
    }

    pub fn stray_count(&self) -> u64 {
        self.strays.load(Ordering::Relaxed)
    }

    pub(crate) fn ops(&self) -> MutexGuard<'_, Box<dyn PicOps>> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn source(&self, irq: u32) -> Option<Arc<IntrSource>> {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(irq as usize)
            .and_then(Clone::clone)
    }

    /// Latches `mask` pending: blocks the lines in hardware first, then
    /// publishes them, so a level line cannot re-fire before delivery. The
    /// per-CPU bookkeeping is layered on by the dispatcher.
    ///
    /// Returns the mask of priority levels that became pending.
    pub(crate) fn mark_pending_sources(&self, cpu: &CpuState, mask: u32) -> u32 {
        self.ops().block_irqs(mask);
        self.blocked_irqs.or(mask);

        let mut ipl_mask = 0;
        let mut known = 0;
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        for src in sources.iter().flatten() {
            if mask & (1 << src.irq) != 0 {
                ipl_mask |= 1 << src.ipl;
                known |= 1 << src.irq;
            }
        }
        drop(sources);

        // A line with no source stays blocked and is counted stray rather
        // than latched.
        if mask & !known != 0 {
            self.strays.fetch_add((mask & !known).count_ones() as u64, Ordering::Relaxed);
            tracing::warn!(pic = %self.name, mask = mask & !known, "pending bits for unestablished lines");
        }

        if ipl_mask != 0 {
            self.pending_irqs.or(mask & known);
            self.pending_ipls.or(ipl_mask);
            cpu.note_pending(self, ipl_mask);
        }
        ipl_mask
    }

    /// Latches a single line pending without touching the hardware mask;
    /// used for software-raised interrupts.
    pub(crate) fn mark_pending(&self, cpu: &CpuState, irq: u32) -> u32 {
        debug_assert!(irq < self.max_sources);
        let Some(src) = self.source(irq) else {
            self.strays.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(pic = %self.name, irq, "pending mark on unestablished line");
            return 0;
        };
        self.pending_irqs.set(irq);
        let ipl_mask = 1u32 << src.ipl;
        self.pending_ipls.or(ipl_mask);
        cpu.note_pending(self, ipl_mask);
        ipl_mask
    }

}

impl std::fmt::Debug for Pic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pic")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("irqbase", &self.irqbase)
            .field("max_sources", &self.max_sources)
            .finish_non_exhaustive()
    }
}
