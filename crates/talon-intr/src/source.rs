//! An established interrupt source: one line on one controller, bound to a
//! handler at a fixed priority level.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::IPL_VM;

/// How the line signals: held level until acknowledged, or a one-shot edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Level,
    Edge,
}

/// What a handler reports back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Yes,
    /// The device had nothing outstanding; counted as a stray delivery.
    No,
}

/// Context handed to a handler while it runs.
#[derive(Debug, Clone, Copy)]
pub struct IntrFrame {
    /// CPU the handler is running on.
    pub cpu: usize,
    /// Priority level the handler was delivered at.
    pub ipl: u8,
}

pub type IntrHandler = Box<dyn Fn(&IntrFrame) -> Handled + Send + Sync>;

pub struct IntrSource {
    pub(crate) pic_id: usize,
    /// Line number local to the owning controller.
    pub(crate) irq: u32,
    pub(crate) ipl: u8,
    pub(crate) trigger: Trigger,
    /// Handlers below are run under the big lock unless this is set. A
    /// handler is implicitly safe when its level is not [`IPL_VM`].
    pub(crate) mpsafe: bool,
    pub(crate) handler: IntrHandler,
    /// Nested mask depth; the line is blocked in hardware while nonzero.
    pub(crate) mask_count: AtomicU32,
    /// Slot in the registry's per-IPL source table.
    pub(crate) ipl_idx: AtomicUsize,
    /// Device name the line was established with.
    pub(crate) xname: Mutex<String>,
    /// Per-CPU delivery counts.
    pub(crate) events: Vec<AtomicU64>,
}

impl IntrSource {
    pub(crate) fn new(
        pic_id: usize,
        irq: u32,
        ipl: u8,
        trigger: Trigger,
        mpsafe: bool,
        xname: &str,
        handler: IntrHandler,
        ncpu: usize,
    ) -> Self {
        Self {
            pic_id,
            irq,
            ipl,
            trigger,
            mpsafe: mpsafe || ipl != IPL_VM,
            handler,
            mask_count: AtomicU32::new(0),
            ipl_idx: AtomicUsize::new(usize::MAX),
            xname: Mutex::new(xname.to_owned()),
            events: (0..ncpu).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn ipl(&self) -> u8 {
        self.ipl
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    pub fn is_mpsafe(&self) -> bool {
        self.mpsafe
    }

    pub fn xname(&self) -> String {
        self.xname.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_xname(&self, xname: &str) {
        *self.xname.lock().unwrap_or_else(|e| e.into_inner()) = xname.to_owned();
    }

    /// Total deliveries across all CPUs.
    pub fn count(&self) -> u64 {
        self.events.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn count_on(&self, cpu: usize) -> u64 {
        self.events[cpu].load(Ordering::Relaxed)
    }

    pub(crate) fn record_event(&self, cpu: usize) {
        self.events[cpu].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn ipl_idx(&self) -> usize {
        self.ipl_idx.load(Ordering::Relaxed)
    }

    pub(crate) fn set_ipl_idx(&self, idx: usize) {
        self.ipl_idx.store(idx, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for IntrSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntrSource")
            .field("pic_id", &self.pic_id)
            .field("irq", &self.irq)
            .field("ipl", &self.ipl)
            .field("trigger", &self.trigger)
            .field("mpsafe", &self.mpsafe)
            .field("xname", &self.xname())
            .finish_non_exhaustive()
    }
}
