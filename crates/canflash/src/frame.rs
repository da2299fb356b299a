//! Classic CAN data frame with an 11-bit identifier

use std::fmt;

use thiserror::Error;

/// Largest standard (11-bit) identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Classic CAN payload capacity
pub const MAX_DLC: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("CAN identifier 0x{0:X} exceeds the 11-bit range")]
    InvalidId(u32),

    #[error("CAN payload of {0} bytes exceeds 8")]
    PayloadTooLong(usize),
}

/// An immutable CAN frame: identifier, DLC and exactly DLC payload bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; MAX_DLC],
}

impl CanFrame {
    pub fn new(id: u32, data: &[u8]) -> Result<Self, FrameError> {
        if id > MAX_STANDARD_ID {
            return Err(FrameError::InvalidId(id));
        }
        if data.len() > MAX_DLC {
            return Err(FrameError::PayloadTooLong(data.len()));
        }

        let mut buf = [0u8; MAX_DLC];
        buf[..data.len()].copy_from_slice(data);

        Ok(Self {
            id,
            dlc: data.len() as u8,
            data: buf,
        })
    }

    /// Build a full 8-byte frame.
    pub fn full(id: u32, data: [u8; MAX_DLC]) -> Result<Self, FrameError> {
        Self::new(id, &data)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// First payload byte, if any
    pub fn first_byte(&self) -> Option<u8> {
        self.data().first().copied()
    }

    /// True when the frame is a full 8-byte frame made of a single repeated byte.
    pub fn is_pattern(&self, byte: u8) -> bool {
        self.dlc as usize == MAX_DLC && self.data.iter().all(|&b| b == byte)
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanFrame(0x{:03X} [{}] {})", self.id, self.dlc, hex::encode_upper(self.data()))
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03X} [{}]", self.id, self.dlc)?;
        for byte in self.data() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_keeps_exact_dlc() {
        let frame = CanFrame::new(0x7E0, &[0x02, 0x10, 0x03]).unwrap();
        assert_eq!(frame.dlc(), 3);
        assert_eq!(frame.data(), &[0x02, 0x10, 0x03]);
        assert_eq!(frame.first_byte(), Some(0x02));
    }

    #[test]
    fn test_frame_rejects_extended_id() {
        assert_eq!(
            CanFrame::new(0x800, &[]),
            Err(FrameError::InvalidId(0x800))
        );
    }

    #[test]
    fn test_frame_rejects_long_payload() {
        assert_eq!(
            CanFrame::new(0x100, &[0; 9]),
            Err(FrameError::PayloadTooLong(9))
        );
    }

    #[test]
    fn test_pattern_requires_full_frame() {
        let ready = CanFrame::full(0xB0, [0x22; 8]).unwrap();
        assert!(ready.is_pattern(0x22));

        let short = CanFrame::new(0xB0, &[0x22; 7]).unwrap();
        assert!(!short.is_pattern(0x22));
    }

    #[test]
    fn test_display_format() {
        let frame = CanFrame::new(0x0C3, &[0xBB, 0x00]).unwrap();
        assert_eq!(frame.to_string(), "0x0C3 [2] BB 00");
    }
}
