//! Per-port channel state: slot queue, request block arena, deadline timer.

use bitflags::bitflags;

use crate::prb::PRB_SIZE;
use crate::queue::SlotQueue;
use crate::regs::MAX_SLOTS;
use crate::xfer::Xfer;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChanFlags: u32 {
        /// Attached device accepts native queued commands.
        const NCQ = 1 << 0;
        /// A command error is being drained; completions fold into the
        /// recovery pass.
        const RECOVERING = 1 << 1;
    }
}

/// Deadline timer for the port, modeled explicitly: arming records the slot
/// and its budget, the owner fires it by hand.
#[derive(Debug, Default)]
pub struct Callout {
    armed: Option<(u8, u32)>,
}

impl Callout {
    pub fn arm(&mut self, slot: u8, timeout_ms: u32) {
        self.armed = Some((slot, timeout_ms));
    }

    pub fn disarm(&mut self) {
        self.armed = None;
    }

    pub fn armed_slot(&self) -> Option<u8> {
        self.armed.map(|(slot, _)| slot)
    }

    pub fn timeout_ms(&self) -> Option<u32> {
        self.armed.map(|(_, ms)| ms)
    }
}

pub(crate) struct SataChannel {
    pub ndrives: usize,
    pub flags: ChanFlags,
    pub queue: SlotQueue,
    /// One request block per slot, written in place before activation.
    pub prb: Vec<Box<[u8; PRB_SIZE]>>,
    /// Bus address of each block, as handed to the activation registers.
    pub prb_bus: Vec<u64>,
    pub callout: Callout,
    /// Taskfile synthesized when the current recovery began.
    pub recovery_tfd: u32,
    /// Drive the faulting transfer addressed, for the recovery hook.
    pub recovery_drive: usize,
    /// Retired transfers awaiting harvest by the owner.
    pub completed: Vec<Xfer>,
}

impl SataChannel {
    pub fn new(prb_base: u64) -> Self {
        Self {
            ndrives: 0,
            flags: ChanFlags::empty(),
            queue: SlotQueue::new(MAX_SLOTS),
            prb: (0..MAX_SLOTS).map(|_| Box::new([0u8; PRB_SIZE])).collect(),
            prb_bus: (0..MAX_SLOTS)
                .map(|slot| prb_base + u64::from(slot) * PRB_SIZE as u64)
                .collect(),
            callout: Callout::default(),
            recovery_tfd: 0,
            recovery_drive: 0,
            completed: Vec::new(),
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.flags.contains(ChanFlags::RECOVERING)
    }
}
