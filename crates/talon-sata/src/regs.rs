//! Register map of the modeled host controller.
//!
//! One global window plus one window per port. Port control is write-one
//! split across a set register and a clear register; interrupt status is
//! write-one-to-clear. Each command slot additionally has a small region
//! holding the last received FIS and the received transfer count.

/// Command slots per port.
pub const MAX_SLOTS: u8 = 31;

// Global registers.
pub const GR_GC: u64 = 0x00;
pub const GR_GIS: u64 = 0x04;

pub const GR_GC_GLBL_RESET: u32 = 1 << 31;

#[inline]
pub fn gr_gc_pxie(port: usize) -> u32 {
    1 << port
}

#[inline]
pub fn gr_gis_pxis(port: usize) -> u32 {
    1 << port
}

// Port registers, relative to the port window.
pub const PRO_PCS: u64 = 0x00;
pub const PRO_PCC: u64 = 0x04;
pub const PRO_PIS: u64 = 0x08;
pub const PRO_PIES: u64 = 0x0c;
pub const PRO_PIEC: u64 = 0x10;
pub const PRO_PS: u64 = 0x14;
pub const PRO_PSS: u64 = 0x18;
pub const PRO_PCE: u64 = 0x1c;
pub const PRO_SSTATUS: u64 = 0x24;
pub const PRO_SCONTROL: u64 = 0x28;
pub const PRO_SERROR: u64 = 0x2c;
pub const PRO_PMPSTS: u64 = 0x40;
pub const PRO_PMPQACT: u64 = 0x44;

/// Command activation register pair for `slot`; writing the high half hands
/// the slot's request block to the device.
#[inline]
pub fn pro_car(slot: u8) -> u64 {
    0x80 + u64::from(slot) * 8
}

// Port control bits (write to PRO_PCS to set, PRO_PCC to clear).
pub const PR_PC_PORT_RESET: u32 = 1 << 0;
pub const PR_PC_DEVICE_RESET: u32 = 1 << 1;
pub const PR_PC_PORT_INITIALIZE: u32 = 1 << 2;
pub const PR_PC_RESUME: u32 = 1 << 6;
pub const PR_PC_PMP_ENABLE: u32 = 1 << 13;

// Port interrupt bits (PIS / PIES / PIEC).
pub const PR_PIS_CMDCMPL: u32 = 1 << 0;
pub const PR_PIS_CMDERRR: u32 = 1 << 1;

// Port status.
pub const PR_PS_PORT_READY: u32 = 1 << 31;
pub const PR_PS_ACTIVE_SLOT_MASK: u32 = 0x1f;

// Port slot status.
pub const PR_PSS_ATTENTION: u32 = 1 << 31;

#[inline]
pub fn pr_pxss(slot: u8) -> u32 {
    1 << slot
}

/// Mask of all slot-busy bits.
pub const PR_PSS_SLOT_MASK: u32 = (1 << MAX_SLOTS) - 1;

// Port command error codes, as read from PRO_PCE after a CMDERRR interrupt.
pub const PORT_CERR_DEV: u32 = 1;
pub const PORT_CERR_SDB: u32 = 2;
pub const PORT_CERR_DATA_FIS: u32 = 3;
pub const PORT_CERR_SEND_FIS: u32 = 4;
pub const PORT_CERR_INCONSISTENT: u32 = 5;
pub const PORT_CERR_DIRECTION: u32 = 6;
pub const PORT_CERR_UNDERRUN: u32 = 7;
pub const PORT_CERR_OVERRUN: u32 = 8;
pub const PORT_CERR_PKT_PROTOCOL: u32 = 11;

/// Codes at or below this describe a failed command on a live port; the
/// channel drains and resumes. Anything above is a port-level fault that
/// forces a device reset.
pub const PORT_CERR_RECOVERABLE_MAX: u32 = PORT_CERR_DATA_FIS;

// Per-slot region inside the port window.
pub const PRS_BASE: u64 = 0x1000;
pub const PRS_STRIDE: u64 = 0x80;
/// Received FIS, 5 dwords.
pub const PRSO_FIS: u64 = 0x00;
/// Received transfer count.
pub const PRSO_RTC: u64 = 0x20;

#[inline]
pub fn prs_reg(slot: u8, offset: u64) -> u64 {
    PRS_BASE + u64::from(slot) * PRS_STRIDE + offset
}

// SStatus / SControl device detection fields.
pub const SS_DET_MASK: u32 = 0xf;
pub const SS_DET_NODEV: u32 = 0x0;
pub const SS_DET_DEV_NE: u32 = 0x1;
pub const SS_DET_DEV: u32 = 0x3;
pub const SS_DET_OFFLINE: u32 = 0x4;

pub const SC_DET_NONE: u32 = 0x0;
pub const SC_DET_RESET: u32 = 0x1;
