//! ISO 15765-2 transport protocol (normal addressing, classic CAN)
//!
//! Payloads up to 4095 bytes are carried as a Single Frame or as a First
//! Frame followed by Consecutive Frames, paced by the receiver's Flow
//! Control. The pure [`Segmenter`]/[`Reassembler`] pair does the framing,
//! [`IsoTpLayer`] runs it against a [`FrameTransport`](crate::transport::FrameTransport).

mod codec;
mod error;
mod layer;
pub mod pci;

pub use codec::{Reassembler, RxEvent, Segmenter};
pub use error::IsoTpError;
pub use layer::IsoTpLayer;
pub use pci::{FlowControl, FlowStatus, Pci, StMin};

/// Largest payload a 12-bit First Frame length can announce
pub const MAX_PAYLOAD_LEN: usize = 4095;

/// Payload bytes in a Single Frame
pub const SF_MAX_DATA: usize = 7;

/// Payload bytes in a First Frame
pub const FF_MAX_DATA: usize = 6;

/// Payload bytes in a Consecutive Frame
pub const CF_MAX_DATA: usize = 7;
