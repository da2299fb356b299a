//! Flash errors

use std::time::Duration;

use thiserror::Error;

use super::FlashState;
use crate::frame::FrameError;
use crate::transport::TransportError;
use crate::uds::{NegativeResponseCode, UdsError};

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Timed out after {waited:?} waiting for {stage}")]
    Timeout { stage: &'static str, waited: Duration },

    #[error("Data packet {sequence} not acknowledged after {retries} retries")]
    AckTimeout { sequence: u8, retries: u32 },

    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        source: UdsError,
    },

    #[error(
        "Device rejected the image: host CRC 0x{host_crc:08X}{}",
        device_crc_suffix(.device_crc)
    )]
    IntegrityMismatch {
        host_crc: u32,
        device_crc: Option<u32>,
    },

    #[error("Flash cancelled")]
    Cancelled,
}

fn device_crc_suffix(device_crc: &Option<u32>) -> String {
    match device_crc {
        Some(crc) => format!(", device CRC 0x{:08X}", crc),
        None => String::new(),
    }
}

/// A failed flash run with the context needed to diagnose it
#[derive(Debug, Error)]
#[error("Flash failed while {state} (image {size} bytes, CRC 0x{crc32:08X}): {source}")]
pub struct FlashFailure {
    /// State the session was in when the error occurred
    pub state: FlashState,
    pub size: u32,
    pub crc32: u32,
    /// Most recent negative response code seen during the run
    pub last_nrc: Option<NegativeResponseCode>,
    pub source: FlashError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_message_includes_device_crc() {
        let err = FlashError::IntegrityMismatch {
            host_crc: 0x2144_DF1C,
            device_crc: Some(0x1234_5678),
        };
        assert_eq!(
            err.to_string(),
            "Device rejected the image: host CRC 0x2144DF1C, device CRC 0x12345678"
        );

        let err = FlashError::IntegrityMismatch {
            host_crc: 0x2144_DF1C,
            device_crc: None,
        };
        assert_eq!(
            err.to_string(),
            "Device rejected the image: host CRC 0x2144DF1C"
        );
    }
}
