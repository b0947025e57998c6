use thiserror::Error;

use crate::dma::DmaError;

pub type Result<T> = std::result::Result<T, SataError>;

#[derive(Debug, Error)]
pub enum SataError {
    #[error("port {0} out of range")]
    BadPort(usize),

    #[error("drive {0} out of range")]
    BadDrive(usize),

    #[error("port {port} not ready after {what}")]
    PortNotReady { port: usize, what: &'static str },

    #[error("port {port} slot {slot} did not complete (polled)")]
    PollTimeout { port: usize, slot: u8 },

    #[error("no free command slot on port {0}")]
    NoSlot(usize),

    #[error("channel {0} is draining and cannot accept commands")]
    ChannelFrozen(usize),

    #[error(transparent)]
    Dma(#[from] DmaError),
}
