//! Firmware image as sent to the bootloader
//!
//! The raw application binary is padded with `0xFF` (erased flash) to the
//! 4-byte flash write alignment. Size and CRC-32 are taken over the padded
//! bytes once, when the image is built, and both flash protocols announce
//! exactly those values.
//!
//! ```text
//! ┌──────────────────────────────┬──────────┐
//! │  application binary (L)      │ 0xFF * p │   p = (4 - L % 4) % 4
//! └──────────────────────────────┴──────────┘
//!  size = L + p, crc32 = CRC-32/ISO-HDLC(all bytes)
//! ```

use std::path::Path;

use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

/// Reflected 0xEDB88320 polynomial, as used by zip and Ethernet
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Flash write alignment of the target
pub const WRITE_ALIGNMENT: usize = 4;

/// Value of erased flash, used for padding
pub const PAD_BYTE: u8 = 0xFF;

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Firmware image is empty")]
    Empty,

    #[error("Firmware image of {size} bytes exceeds the partition size of {max} bytes")]
    TooLarge { size: usize, max: u32 },

    #[error("Failed to read firmware {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

// ── Image ──────────────────────────────────────────────────────────────────

/// Padded firmware with its size and CRC-32
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    original_len: usize,
    crc32: u32,
}

impl FirmwareImage {
    /// Pad `raw` and compute its CRC; `max_size` bounds the padded size.
    pub fn from_bytes(mut raw: Vec<u8>, max_size: u32) -> Result<Self, ImageError> {
        if raw.is_empty() {
            return Err(ImageError::Empty);
        }

        let original_len = raw.len();
        let padded_len = original_len.div_ceil(WRITE_ALIGNMENT) * WRITE_ALIGNMENT;
        if padded_len > max_size as usize {
            return Err(ImageError::TooLarge {
                size: padded_len,
                max: max_size,
            });
        }
        raw.resize(padded_len, PAD_BYTE);

        let crc32 = CRC32.checksum(&raw);
        Ok(Self {
            data: raw,
            original_len,
            crc32,
        })
    }

    pub fn load(path: impl AsRef<Path>, max_size: u32) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ImageError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_bytes(raw, max_size)
    }

    /// Padded bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Padded size, as announced to the device
    pub fn size(&self) -> u32 {
        // Bounded by max_size at construction
        self.data.len() as u32
    }

    pub fn original_len(&self) -> usize {
        self.original_len
    }

    pub fn padding_len(&self) -> usize {
        self.data.len() - self.original_len
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Size then CRC-32, both little-endian
    pub fn metadata_le(&self) -> [u8; 8] {
        let mut metadata = [0u8; 8];
        metadata[..4].copy_from_slice(&self.size().to_le_bytes());
        metadata[4..].copy_from_slice(&self.crc32.to_le_bytes());
        metadata
    }

    pub fn chunks(&self, chunk_size: usize) -> std::slice::Chunks<'_, u8> {
        self.data.chunks(chunk_size)
    }
}
