//! Prioritized interrupt routing for modeled hardware.
//!
//! A [`IntrRegistry`] owns up to 32 controllers ([`Pic`]), each exposing up
//! to 32 lines through a [`PicOps`] backend. Drivers bind handlers to lines
//! at one of eight priority levels; the dispatcher latches pending lines into
//! atomic bitmaps and drains them strictly highest level first, blocking each
//! line in hardware from the moment it fires until its handler has run.
//!
//! - [`IntrRegistry::register`] / [`IntrRegistry::establish`]: wiring
//! - [`IntrRegistry::handle_intr`]: interrupt entry for one controller
//! - [`IntrRegistry::do_pending_interrupts`]: priority-ordered drain
//! - [`IntrRegistry::mask`] / [`IntrRegistry::unmask`]: nested line masking

mod bitset;
mod dispatch;
mod pic;
mod registry;
mod source;

pub use bitset::AtomicBitset;
pub use dispatch::CpuState;
pub use pic::{Pic, PicOps, PIC_MAX_SOURCES};
pub use registry::{Error, IntrRegistry, Result, IRQBASE_ALLOC, PIC_MAX_PICS};
pub use source::{Handled, IntrFrame, IntrHandler, IntrSource, Trigger};

/// Priority levels, lowest to highest. A handler established at level `n`
/// holds off every line at or below `n` while it runs.
pub const IPL_NONE: u8 = 0;
pub const IPL_SOFTCLOCK: u8 = 1;
pub const IPL_SOFTBIO: u8 = 2;
pub const IPL_SOFTNET: u8 = 3;
pub const IPL_VM: u8 = 4;
pub const IPL_SCHED: u8 = 5;
pub const IPL_DDB: u8 = 6;
pub const IPL_HIGH: u8 = 7;

/// Number of priority levels.
pub const NIPL: u8 = 8;
