//! UDS Negative Response Codes (NRC)

use std::fmt;

/// UDS Negative Response Codes (NRC) relevant to reprogramming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeResponseCode {
    // General NRCs
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    ResponseTooLong,

    // Condition NRCs
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    FailurePreventsExecution,

    // Request NRCs
    RequestOutOfRange,
    SecurityAccessDenied,

    // Upload/Download NRCs
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,

    // Response Pending
    ResponsePending,

    // Session NRCs
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,

    VoltageTooHigh,
    VoltageTooLow,

    /// Unknown/reserved NRC
    Unknown(u8),
}

impl NegativeResponseCode {
    pub fn is_response_pending(self) -> bool {
        self == Self::ResponsePending
    }

    /// Short explanation suitable for an operator
    pub fn description(self) -> &'static str {
        match self {
            Self::GeneralReject => "request rejected without a specific reason",
            Self::ServiceNotSupported => "service is not implemented by the device",
            Self::SubFunctionNotSupported => "sub-function is not implemented by the device",
            Self::IncorrectMessageLengthOrFormat => "request length or format is wrong",
            Self::ResponseTooLong => "response would exceed the transport limit",
            Self::BusyRepeatRequest => "device is busy, repeat the request",
            Self::ConditionsNotCorrect => "device preconditions are not met",
            Self::RequestSequenceError => "request arrived out of the expected order",
            Self::FailurePreventsExecution => "an internal failure prevents execution",
            Self::RequestOutOfRange => "a parameter is out of range",
            Self::SecurityAccessDenied => "security access is required",
            Self::UploadDownloadNotAccepted => "download request was not accepted",
            Self::TransferDataSuspended => "data transfer was suspended",
            Self::GeneralProgrammingFailure => "flash programming or verification failed",
            Self::WrongBlockSequenceCounter => "block sequence counter does not match",
            Self::ResponsePending => "request received, response pending",
            Self::SubFunctionNotSupportedInActiveSession => {
                "sub-function is not available in the active session"
            }
            Self::ServiceNotSupportedInActiveSession => {
                "service is not available in the active session"
            }
            Self::VoltageTooHigh => "supply voltage too high",
            Self::VoltageTooLow => "supply voltage too low",
            Self::Unknown(_) => "unknown or manufacturer-specific code",
        }
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrFormat,
            0x14 => Self::ResponseTooLong,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x26 => Self::FailurePreventsExecution,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x70 => Self::UploadDownloadNotAccepted,
            0x71 => Self::TransferDataSuspended,
            0x72 => Self::GeneralProgrammingFailure,
            0x73 => Self::WrongBlockSequenceCounter,
            0x78 => Self::ResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            0x92 => Self::VoltageTooHigh,
            0x93 => Self::VoltageTooLow,
            other => Self::Unknown(other),
        }
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        match nrc {
            NegativeResponseCode::GeneralReject => 0x10,
            NegativeResponseCode::ServiceNotSupported => 0x11,
            NegativeResponseCode::SubFunctionNotSupported => 0x12,
            NegativeResponseCode::IncorrectMessageLengthOrFormat => 0x13,
            NegativeResponseCode::ResponseTooLong => 0x14,
            NegativeResponseCode::BusyRepeatRequest => 0x21,
            NegativeResponseCode::ConditionsNotCorrect => 0x22,
            NegativeResponseCode::RequestSequenceError => 0x24,
            NegativeResponseCode::FailurePreventsExecution => 0x26,
            NegativeResponseCode::RequestOutOfRange => 0x31,
            NegativeResponseCode::SecurityAccessDenied => 0x33,
            NegativeResponseCode::UploadDownloadNotAccepted => 0x70,
            NegativeResponseCode::TransferDataSuspended => 0x71,
            NegativeResponseCode::GeneralProgrammingFailure => 0x72,
            NegativeResponseCode::WrongBlockSequenceCounter => 0x73,
            NegativeResponseCode::ResponsePending => 0x78,
            NegativeResponseCode::SubFunctionNotSupportedInActiveSession => 0x7E,
            NegativeResponseCode::ServiceNotSupportedInActiveSession => 0x7F,
            NegativeResponseCode::VoltageTooHigh => 0x92,
            NegativeResponseCode::VoltageTooLow => 0x93,
            NegativeResponseCode::Unknown(v) => v,
        }
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(v) => write!(f, "Unknown(0x{:02X})", v),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_round_trip_through_u8() {
        for raw in [0x22u8, 0x72, 0x73, 0x78] {
            let nrc = NegativeResponseCode::from(raw);
            assert!(!matches!(nrc, NegativeResponseCode::Unknown(_)));
            assert_eq!(u8::from(nrc), raw);
        }
    }

    #[test]
    fn test_unknown_code_keeps_value() {
        let nrc = NegativeResponseCode::from(0xF0);
        assert_eq!(nrc, NegativeResponseCode::Unknown(0xF0));
        assert_eq!(nrc.to_string(), "Unknown(0xF0)");
        assert_eq!(format!("{:02X}", nrc), "F0");
    }

    #[test]
    fn test_display_and_description() {
        let nrc = NegativeResponseCode::ConditionsNotCorrect;
        assert_eq!(nrc.to_string(), "ConditionsNotCorrect");
        assert_eq!(nrc.description(), "device preconditions are not met");
        assert!(NegativeResponseCode::from(0x78).is_response_pending());
    }
}
