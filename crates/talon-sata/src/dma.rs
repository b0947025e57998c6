//! Scatter/gather mapping seam.
//!
//! The state machine never touches payload memory; it asks the mapper for a
//! segment list to encode into the request block and releases the mapping
//! when the slot retires, on success and on every error path alike.

use thiserror::Error;

use crate::prb::PRB_MAX_SGE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
}

/// One physically contiguous run of a mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    pub addr: u64,
    pub len: u32,
}

#[derive(Debug, Error)]
pub enum DmaError {
    #[error("mapping of {len} bytes needs {segments} segments, limit {PRB_MAX_SGE}")]
    TooManySegments { len: usize, segments: usize },

    #[error("no mapping loaded for port {port} slot {slot}")]
    NotLoaded { port: usize, slot: u8 },

    #[error("mapping failed: {0}")]
    MapFailed(&'static str),
}

/// Maps transfer payloads for one controller.
///
/// A mapping is keyed by (port, slot) and stays loaded until `unload`; a slot
/// is never reused while its mapping is live.
pub trait DmaMapper: Send {
    fn load(
        &mut self,
        port: usize,
        slot: u8,
        len: usize,
        dir: DmaDirection,
    ) -> Result<Vec<DmaSegment>, DmaError>;

    fn unload(&mut self, port: usize, slot: u8);
}
