//! ISO-TP errors

use std::time::Duration;

use thiserror::Error;

use super::pci::FlowStatus;
use crate::frame::FrameError;
use crate::transport::TransportError;

#[derive(Debug, Error, Clone)]
pub enum IsoTpError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Payload of {len} bytes exceeds the ISO-TP limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("No flow control received within {waited:?}")]
    FlowControlTimeout { waited: Duration },

    #[error("Receiver rejected the transfer ({status:?})")]
    FlowControlRejected { status: FlowStatus },

    #[error("Invalid PCI byte 0x{0:02X}")]
    InvalidPci(u8),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Consecutive frame out of sequence: expected {expected}, got {got}")]
    SequenceMismatch { expected: u8, got: u8 },

    #[error("Incoming message of {len} bytes exceeds the receive buffer of {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("No consecutive frame received within {waited:?}")]
    ConsecutiveFrameTimeout { waited: Duration },

    #[error("No message received before the deadline")]
    Timeout,
}
