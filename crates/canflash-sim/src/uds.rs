//! UDS response helpers for the simulated ECU

use canflash::uds::service_id;

/// UDS Negative Response Codes sent by the simulator
pub mod nrc {
    pub const SERVICE_NOT_SUPPORTED: u8 = 0x11;
    pub const SUB_FUNCTION_NOT_SUPPORTED: u8 = 0x12;
    pub const INCORRECT_MESSAGE_LENGTH: u8 = 0x13;
    pub const CONDITIONS_NOT_CORRECT: u8 = 0x22;
    pub const REQUEST_SEQUENCE_ERROR: u8 = 0x24;
    pub const REQUEST_OUT_OF_RANGE: u8 = 0x31;
    pub const UPLOAD_DOWNLOAD_NOT_ACCEPTED: u8 = 0x70;
    pub const GENERAL_PROGRAMMING_FAILURE: u8 = 0x72;
    pub const WRONG_BLOCK_SEQUENCE_COUNTER: u8 = 0x73;
    pub const RESPONSE_PENDING: u8 = 0x78;
}

/// Create a positive response for a service
pub fn positive_response(sid: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + data.len());
    response.push(sid + service_id::POSITIVE_RESPONSE_OFFSET);
    response.extend_from_slice(data);
    response
}

/// Create a negative response
pub fn negative_response(sid: u8, nrc: u8) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, sid, nrc]
}

/// Negative response followed by diagnostic bytes
pub fn negative_response_with_data(sid: u8, nrc: u8, data: &[u8]) -> Vec<u8> {
    let mut response = negative_response(sid, nrc);
    response.extend_from_slice(data);
    response
}
