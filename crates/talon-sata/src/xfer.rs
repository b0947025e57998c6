//! In-flight command objects and the per-flavor operation table.
//!
//! Three command flavors share one slot queue and one completion funnel:
//! raw register commands, block transfers, and packet commands. Each carries
//! its flavor's operations as a static vtable so queue code can start,
//! complete, poll, abort, or kill any transfer without knowing its flavor.

use bitflags::bitflags;

use crate::controller::SataController;
use crate::dma::DmaDirection;
use crate::error::Result;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XferFlags: u32 {
        /// Complete by polling instead of interrupts.
        const POLL = 1 << 0;
        /// Deadline expired; the completion path reports a timeout.
        const TIMEOUT = 1 << 1;
        /// Native queued command (tagged, device-reordered).
        const NCQ = 1 << 2;
        /// Packet-protocol transfer.
        const ATAPI = 1 << 3;
        /// Payload moves by DMA.
        const DMA = 1 << 4;
    }
}

/// Why outstanding transfers are being killed rather than completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// Device detached; deactivate the slot and fail the transfer.
    Gone,
    /// Device detached but the slot was never activated in hardware.
    GoneInactive,
    /// Port went through a reset; fail the transfer as reset.
    Reset,
    /// Put the transfer back on the pending queue (block transfers only).
    Requeue,
}

/// Raw taskfile command.
#[derive(Debug, Clone)]
pub struct AtaCommand {
    pub command: u8,
    pub features: u16,
    pub count: u16,
    pub lba: u64,
    pub device: u8,
    /// Payload bytes; 0 for a non-data command.
    pub bcount: usize,
    pub dir: Option<DmaDirection>,
    pub timeout_ms: u32,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmdResultFlags: u32 {
        const DONE = 1 << 0;
        const TIMEOUT = 1 << 1;
        const ERROR = 1 << 2;
        const DEVICE_FAULT = 1 << 3;
        /// Lost to a port or device reset.
        const RESET = 1 << 4;
        /// Device went away underneath the command.
        const GONE = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CmdResult {
    pub flags: CmdResultFlags,
    /// Packed taskfile: error register in bits 15:8, status in bits 7:0.
    pub tfd: u32,
}

/// Block read or write.
#[derive(Debug, Clone)]
pub struct AtaBio {
    pub blkno: u64,
    pub nblks: u32,
    pub bcount: usize,
    pub write: bool,
    pub lba48: bool,
    pub timeout_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BioError {
    #[default]
    None,
    Timeout,
    /// Device reported an error; `tfd` holds the taskfile.
    Error,
    /// The DMA mapping could not be set up; the transfer never started.
    Dma,
    /// Lost to a port or device reset.
    Reset,
    NoDevice,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BioResult {
    pub error: BioError,
    /// Bytes not transferred.
    pub residual: usize,
    pub tfd: u32,
}

/// Packet command.
#[derive(Debug, Clone)]
pub struct AtapiXfer {
    pub cdb: [u8; 16],
    pub cdb_len: usize,
    pub bcount: usize,
    pub write: bool,
    pub timeout_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XsError {
    #[default]
    None,
    Timeout,
    Reset,
    /// Device reported check condition; `tfd` holds the taskfile.
    ShortSense,
    /// The request could not be set up; it never reached the device.
    DriverError,
    NoDevice,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AtapiResult {
    pub error: XsError,
    pub residual: usize,
    pub tfd: u32,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Cmd(AtaCommand),
    Bio(AtaBio),
    Atapi(AtapiXfer),
}

#[derive(Debug, Clone, Copy)]
pub enum XferResult {
    Cmd(CmdResult),
    Bio(BioResult),
    Atapi(AtapiResult),
}

/// One queued or in-flight transfer.
pub struct Xfer {
    pub(crate) slot: u8,
    pub drive: usize,
    pub flags: XferFlags,
    pub payload: Payload,
    pub(crate) result: Option<XferResult>,
    pub(crate) ops: &'static dyn XferOps,
}

impl Xfer {
    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn result(&self) -> Option<XferResult> {
        self.result
    }

    pub fn bcount(&self) -> usize {
        match &self.payload {
            Payload::Cmd(c) => c.bcount,
            Payload::Bio(b) => b.bcount,
            Payload::Atapi(a) => a.bcount,
        }
    }

    pub(crate) fn timeout_ms(&self) -> u32 {
        match &self.payload {
            Payload::Cmd(c) => c.timeout_ms,
            Payload::Bio(b) => b.timeout_ms,
            Payload::Atapi(a) => a.timeout_ms,
        }
    }

    pub(crate) fn dma_direction(&self) -> Option<DmaDirection> {
        match &self.payload {
            Payload::Cmd(c) => c.dir,
            Payload::Bio(b) => Some(if b.write {
                DmaDirection::ToDevice
            } else {
                DmaDirection::FromDevice
            }),
            Payload::Atapi(a) => {
                if a.bcount == 0 {
                    None
                } else if a.write {
                    Some(DmaDirection::ToDevice)
                } else {
                    Some(DmaDirection::FromDevice)
                }
            }
        }
    }
}

impl std::fmt::Debug for Xfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Xfer")
            .field("slot", &self.slot)
            .field("drive", &self.drive)
            .field("flags", &self.flags)
            .field("payload", &self.payload)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// Flavor-specific steps of the transfer lifecycle. The queue and interrupt
/// code only ever go through this table.
pub(crate) trait XferOps: Sync {
    /// Builds and activates the request block for an allocated slot.
    fn start(&self, ctlr: &mut SataController, port: usize, xfer: &mut Xfer) -> Result<()>;

    /// Completion funnel: every retirement (interrupt, poll, timeout) lands
    /// here with the packed taskfile.
    fn intr(&self, ctlr: &mut SataController, port: usize, xfer: &mut Xfer, tfd: u32);

    /// Busy-waits for the started slot to retire, then completes it. Runs
    /// after the transfer is queued, so it is addressed by slot.
    fn poll(&self, ctlr: &mut SataController, port: usize, slot: u8) -> Result<()>;

    /// Tears down an in-flight transfer that cannot be allowed to finish.
    fn abort(&self, ctlr: &mut SataController, port: usize, xfer: &mut Xfer);

    /// Fails (or requeues) a transfer on behalf of reset/detach handling.
    fn kill(&self, ctlr: &mut SataController, port: usize, xfer: &mut Xfer, reason: KillReason);
}
