//! UDS protocol errors

use std::time::Duration;

use thiserror::Error;

use super::NegativeResponseCode;
use crate::isotp::IsoTpError;

#[derive(Debug, Error, Clone)]
pub enum UdsError {
    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service_id:02X}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
        /// Diagnostic bytes following the NRC, if any
        data: Vec<u8>,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No response to service 0x{service_id:02X} within {waited:?}")]
    Timeout { service_id: u8, waited: Duration },

    #[error("Service 0x{service_id:02X} still pending after {waited:?}")]
    PendingLimitExceeded { service_id: u8, waited: Duration },

    #[error("Transport error: {0}")]
    Transport(#[from] IsoTpError),
}

impl UdsError {
    /// The NRC carried by a negative response
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::NegativeResponse { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }
}
