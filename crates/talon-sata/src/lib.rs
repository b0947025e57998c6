//! Command-queue state machine for a modeled SATA host controller.
//!
//! The controller drives up to 31 command slots per port: requests are
//! serialized into per-slot request blocks ([`Prb`]) carrying a register FIS
//! and a terminated scatter/gather table, activated through the port's
//! activation registers, and retired through one completion funnel whether
//! they finish by interrupt, by polling, or by deadline. Command errors split
//! into a recoverable drain-and-resume path and a fatal device-reset path.
//!
//! Hardware access goes through two seams: [`HostBus`] for registers and
//! [`DmaMapper`] for payload mappings, so the same state machine runs against
//! tests and emulated devices.

mod bus;
mod channel;
mod controller;
mod dma;
mod error;
mod fis;
mod prb;
mod queue;
mod regs;
mod xfer;

pub use bus::HostBus;
pub use channel::{Callout, ChanFlags};
pub use controller::{DriveKind, NullRecovery, RecoveryResume, SataController};
pub use dma::{DmaDirection, DmaError, DmaMapper, DmaSegment};
pub use error::{Result, SataError};
pub use fis::{
    construct_atapi, construct_bio, construct_cmd, parse_d2h, signature, tfd_err_st, tfd_error,
    tfd_status, FIS_LEN, SIG_ATA, SIG_ATAPI, SIG_PMP, WDCC_READDMA_EXT, WDCC_READ_FPDMA_QUEUED,
    WDCC_WRITEDMA_EXT, WDCC_WRITE_FPDMA_QUEUED, WDCE_ABRT, WDCE_ICRC, WDCE_UNC, WDCS_BSY,
    WDCS_DRDY, WDCS_DRQ, WDCS_ERR,
};
pub use prb::{Prb, PrbControl, PRB_MAX_SGE, PRB_SIZE, SGE_FLAG_TRM};
pub use queue::SlotQueue;
pub use regs::*;
pub use xfer::{
    AtaBio, AtaCommand, AtapiResult, AtapiXfer, BioError, BioResult, CmdResult, CmdResultFlags,
    KillReason, Payload, Xfer, XferFlags, XferResult, XsError,
};
