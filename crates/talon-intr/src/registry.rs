//! Registration of controllers and sources.
//!
//! The registry owns the controller arena and the flat per-IPL source table
//! the dispatcher walks. Sources established at the same priority level sit
//! in one contiguous run of the table; `ipl_offset[ipl]..ipl_offset[ipl + 1]`
//! bounds the run for `ipl`. Establishing at a level whose run is full shifts
//! every higher run up by one slot, which is O(total sources) but only ever
//! runs at attach time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use thiserror::Error;

use crate::dispatch::CpuState;
use crate::pic::{Pic, PicOps};
use crate::source::{IntrHandler, IntrSource, Trigger};
use crate::NIPL;

/// Most controllers one registry can hold; per-CPU controller bitmaps are one
/// 32-bit word.
pub const PIC_MAX_PICS: usize = 32;

/// Passed as `irqbase` to [`IntrRegistry::register`] to let the registry pick
/// the global IRQ range.
pub const IRQBASE_ALLOC: u32 = u32::MAX;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no controller owns irq {0}")]
    NoController(u32),

    #[error("irq {irq} on {pic} is already established")]
    AlreadyEstablished { pic: String, irq: u32 },

    #[error("irq {irq} out of range for {pic}")]
    InvalidIrq { pic: String, irq: u32 },

    #[error("invalid priority level {0}")]
    InvalidIpl(u8),

    #[error("source is not established")]
    NotEstablished,

    #[error("no source matches \"{0}\"")]
    NotFound(String),

    #[error("operation not supported by this controller")]
    NotSupported,
}

pub(crate) struct RegistryInner {
    /// Next global IRQ number handed to an allocating controller.
    lastbase: u32,
    /// All established sources, grouped contiguously by IPL.
    pub(crate) ipl_sources: Vec<Option<Arc<IntrSource>>>,
    /// Run boundaries into `ipl_sources`, one extra entry for the end.
    pub(crate) ipl_offset: [usize; NIPL as usize + 1],
}

pub struct IntrRegistry {
    ncpu: usize,
    cpus: Vec<CpuState>,
    pub(crate) pics: RwLock<Vec<Arc<Pic>>>,
    pub(crate) inner: Mutex<RegistryInner>,
    /// Big lock serializing handlers that are not marked multiprocessor-safe.
    pub(crate) kernel_lock: Mutex<()>,
    pub(crate) kernel_lock_depth: AtomicU32,
    ast_hook: Mutex<Option<Box<dyn Fn(usize) + Send + Sync>>>,
}

impl IntrRegistry {
    pub fn new(ncpu: usize) -> Self {
        assert!(ncpu > 0);
        Self {
            ncpu,
            cpus: (0..ncpu).map(CpuState::new).collect(),
            pics: RwLock::new(Vec::new()),
            inner: Mutex::new(RegistryInner {
                lastbase: 0,
                ipl_sources: Vec::new(),
                ipl_offset: [0; NIPL as usize + 1],
            }),
            kernel_lock: Mutex::new(()),
            kernel_lock_depth: AtomicU32::new(0),
            ast_hook: Mutex::new(None),
        }
    }

    pub fn ncpu(&self) -> usize {
        self.ncpu
    }

    pub fn cpu(&self, index: usize) -> &CpuState {
        &self.cpus[index]
    }

    /// Hook run when dispatch drops back to `IPL_NONE` with an AST posted.
    pub fn set_ast_hook(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.lock_ast_hook() = Some(Box::new(hook));
    }

    pub(crate) fn lock_ast_hook(
        &self,
    ) -> MutexGuard<'_, Option<Box<dyn Fn(usize) + Send + Sync>>> {
        self.ast_hook.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a controller. `irqbase` is its first global IRQ number, or
    /// [`IRQBASE_ALLOC`] to have one assigned past every existing range.
    ///
    /// # Panics
    ///
    /// Panics if the requested range overlaps a registered controller or the
    /// controller arena is full. Both are unrecoverable wiring mistakes.
    pub fn register(&self, name: &str, max_sources: u32, irqbase: u32, ops: Box<dyn PicOps>) -> Arc<Pic> {
        let mut pic = Pic::new(name, max_sources, ops);
        let mut pics = self.pics.write().unwrap_or_else(|e| e.into_inner());
        assert!(
            pics.len() < PIC_MAX_PICS,
            "controller arena full registering {name}"
        );

        let mut inner = self.lock_inner();
        let irqbase = if irqbase == IRQBASE_ALLOC {
            inner.lastbase
        } else {
            for other in pics.iter() {
                let lo = other.irqbase;
                let hi = lo + other.max_sources();
                if irqbase < hi && lo < irqbase + max_sources {
                    panic!(
                        "{name} irqs {}..{} overlap {} irqs {}..{}",
                        irqbase,
                        irqbase + max_sources,
                        other.name(),
                        lo,
                        hi
                    );
                }
            }
            irqbase
        };
        inner.lastbase = inner.lastbase.max(irqbase + max_sources);
        drop(inner);

        pic.id = pics.len();
        pic.irqbase = irqbase;
        let pic = Arc::new(pic);
        pics.push(Arc::clone(&pic));
        tracing::debug!(pic = name, irqbase, max_sources, "controller registered");
        pic
    }

    pub fn pic_for_irq(&self, irq: u32) -> Option<Arc<Pic>> {
        let pics = self.pics.read().unwrap_or_else(|e| e.into_inner());
        pics.iter()
            .find(|p| irq >= p.irqbase && irq < p.irqbase + p.max_sources())
            .cloned()
    }

    /// Binds `handler` to a line. `irq` is controller-local.
    pub fn establish(
        &self,
        pic: &Arc<Pic>,
        irq: u32,
        ipl: u8,
        trigger: Trigger,
        mpsafe: bool,
        xname: &str,
        handler: IntrHandler,
    ) -> Result<Arc<IntrSource>> {
        if irq >= pic.max_sources() {
            return Err(Error::InvalidIrq {
                pic: pic.name().to_owned(),
                irq,
            });
        }
        if ipl >= NIPL {
            return Err(Error::InvalidIpl(ipl));
        }

        let mut sources = pic.sources.write().unwrap_or_else(|e| e.into_inner());
        if sources[irq as usize].is_some() {
            return Err(Error::AlreadyEstablished {
                pic: pic.name().to_owned(),
                irq,
            });
        }

        let src = Arc::new(IntrSource::new(
            pic.id, irq, ipl, trigger, mpsafe, xname, handler, self.ncpu,
        ));
        self.insert_ipl_source(&src);
        pic.ops().establish_irq(&src);
        sources[irq as usize] = Some(Arc::clone(&src));
        tracing::debug!(
            pic = pic.name(),
            irq,
            ipl,
            xname,
            "interrupt established"
        );
        Ok(src)
    }

    /// Unbinds a source. The line is blocked in hardware and any latched
    /// pending state is dropped.
    ///
    /// # Panics
    ///
    /// Panics when called from a handler: teardown must not race the
    /// delivery that could be holding the source.
    pub fn disestablish(&self, src: &Arc<IntrSource>) -> Result<()> {
        assert!(
            self.cpus.iter().all(|c| !c.interrupts_enabled()),
            "disestablish from interrupt context"
        );
        let pic = self.pic_by_id(src.pic_id)?;
        let mut sources = pic.sources.write().unwrap_or_else(|e| e.into_inner());
        let slot = &mut sources[src.irq as usize];
        match slot {
            Some(cur) if Arc::ptr_eq(cur, src) => *slot = None,
            _ => return Err(Error::NotEstablished),
        }
        drop(sources);

        let mask = 1u32 << src.irq;
        pic.ops().block_irqs(mask);
        pic.pending_irqs.and_not(mask);
        pic.blocked_irqs.and_not(mask);

        let mut inner = self.lock_inner();
        let idx = src.ipl_idx();
        debug_assert!(matches!(&inner.ipl_sources[idx], Some(s) if Arc::ptr_eq(s, src)));
        inner.ipl_sources[idx] = None;
        src.set_ipl_idx(usize::MAX);
        tracing::debug!(pic = pic.name(), irq = src.irq, "interrupt disestablished");
        Ok(())
    }

    /// Masks a source, nesting. The hardware line is blocked on the 0 -> 1
    /// edge only.
    pub fn mask(&self, src: &Arc<IntrSource>) -> Result<()> {
        let pic = self.pic_by_id(src.pic_id)?;
        if src.mask_count.fetch_add(1, Ordering::AcqRel) == 0 {
            pic.ops().block_irqs(1 << src.irq);
        }
        Ok(())
    }

    /// Unmasks a source. The hardware line is unblocked on the 1 -> 0 edge; a
    /// level line still asserted will simply fire again.
    pub fn unmask(&self, src: &Arc<IntrSource>) -> Result<()> {
        let pic = self.pic_by_id(src.pic_id)?;
        let prev = src.mask_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "unmask without matching mask");
        if prev == 1 {
            pic.ops().unblock_irqs(1 << src.irq);
        }
        Ok(())
    }

    /// "`<controller> <line>`" description for attach messages.
    pub fn intr_string(&self, src: &Arc<IntrSource>) -> Result<String> {
        let pic = self.pic_by_id(src.pic_id)?;
        let line = pic.ops().source_name(src.irq);
        Ok(format!("{} {}", pic.name(), line))
    }

    /// Rebinds the reported device name without re-establishing.
    pub fn set_xname(&self, src: &Arc<IntrSource>, xname: &str) {
        src.set_xname(xname);
    }

    /// Established sources at `ipl`, in per-IPL table order. Slots freed by
    /// disestablish stay in place until reused.
    pub fn sources_at_ipl(&self, ipl: u8) -> Vec<Option<Arc<IntrSource>>> {
        let inner = self.lock_inner();
        let run = inner.ipl_offset[ipl as usize]..inner.ipl_offset[ipl as usize + 1];
        inner.ipl_sources[run].to_vec()
    }

    /// Mask of `pic_id`'s lines established at `ipl`, read from the per-IPL
    /// table.
    pub(crate) fn ipl_irq_mask(&self, pic_id: usize, ipl: u8) -> u32 {
        let inner = self.lock_inner();
        let run = inner.ipl_offset[ipl as usize]..inner.ipl_offset[ipl as usize + 1];
        let mut mask = 0;
        for src in inner.ipl_sources[run].iter().flatten() {
            if src.pic_id == pic_id {
                mask |= 1 << src.irq;
            }
        }
        mask
    }

    /// Finds an established source by its `intr_string` identifier.
    pub fn lookup(&self, intrid: &str) -> Result<Arc<IntrSource>> {
        self.intrids()
            .into_iter()
            .find(|src| {
                self.intr_string(src)
                    .map(|s| s == intrid)
                    .unwrap_or(false)
            })
            .ok_or_else(|| Error::NotFound(intrid.to_owned()))
    }

    /// Every currently-established source, in global IRQ order.
    pub fn intrids(&self) -> Vec<Arc<IntrSource>> {
        let pics = self.pics.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for pic in pics.iter() {
            let sources = pic.sources.read().unwrap_or_else(|e| e.into_inner());
            out.extend(sources.iter().flatten().cloned());
        }
        out
    }

    pub fn set_affinity(&self, src: &Arc<IntrSource>, cpus: u32) -> Result<()> {
        let pic = self.pic_by_id(src.pic_id)?;
        let mut ops = pic.ops();
        ops.set_affinity(src.irq, cpus)
    }

    pub fn get_affinity(&self, src: &Arc<IntrSource>) -> Result<u32> {
        let pic = self.pic_by_id(src.pic_id)?;
        let ops = pic.ops();
        ops.get_affinity(src.irq)
    }

    pub fn ipi_send(&self, pic: &Arc<Pic>, cpus: u32, ipi: u32) -> Result<()> {
        pic.ops().ipi_send(cpus, ipi)
    }

    pub(crate) fn pic_by_id(&self, id: usize) -> Result<Arc<Pic>> {
        let pics = self.pics.read().unwrap_or_else(|e| e.into_inner());
        pics.get(id).cloned().ok_or(Error::NoController(id as u32))
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Asks the primary controller to move the CPU priority threshold. A
    /// no-op when the primary has no threshold support.
    pub(crate) fn hw_set_priority(&self, ipl: u8) {
        let pics = self.pics.read().unwrap_or_else(|e| e.into_inner());
        if let Some(primary) = pics.first() {
            let mut ops = primary.ops();
            if ops.supports_set_priority() {
                ops.set_priority(ipl);
            }
        }
    }

    /// Places `src` in the contiguous per-IPL table: a free slot inside its
    /// level's run is reused, otherwise every higher run shifts up one slot
    /// to open a hole at the end of the run.
    fn insert_ipl_source(&self, src: &Arc<IntrSource>) {
        let ipl = src.ipl as usize;
        let mut inner = self.lock_inner();

        let free = (inner.ipl_offset[ipl]..inner.ipl_offset[ipl + 1])
            .find(|&i| inner.ipl_sources[i].is_none());
        if let Some(idx) = free {
            inner.ipl_sources[idx] = Some(Arc::clone(src));
            src.set_ipl_idx(idx);
            return;
        }

        inner.ipl_sources.push(None);
        for lvl in (ipl + 1..NIPL as usize).rev() {
            let first = inner.ipl_offset[lvl];
            let dest = inner.ipl_offset[lvl + 1];
            if first != dest {
                if let Some(moved) = inner.ipl_sources[first].take() {
                    moved.set_ipl_idx(dest);
                    inner.ipl_sources[dest] = Some(moved);
                }
            }
        }
        for lvl in ipl + 1..=NIPL as usize {
            inner.ipl_offset[lvl] += 1;
        }
        let idx = inner.ipl_offset[ipl + 1] - 1;
        inner.ipl_sources[idx] = Some(Arc::clone(src));
        src.set_ipl_idx(idx);
    }
}

impl std::fmt::Debug for IntrRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntrRegistry")
            .field("ncpu", &self.ncpu)
            .finish_non_exhaustive()
    }
}
