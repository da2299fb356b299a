//! UDS (Unified Diagnostic Services) protocol implementation
//!
//! Only the services needed to reprogram a device are covered: session
//! control, routine control, request download, transfer data and request
//! transfer exit.

mod client;
mod error;
mod nrc;

pub use client::UdsClient;
pub use error::UdsError;
pub use nrc::NegativeResponseCode;

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
}

/// DiagnosticSessionControl (0x10) session types
pub mod session_type {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
}

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Added to the request SID in a positive response
    pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
}
