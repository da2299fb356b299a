//! Simulated raw-frame IAP bootloader
//!
//! Frames sent by the device:
//!
//! | id   | data                        | when                         |
//! |------|-----------------------------|------------------------------|
//! | 0xA0 | `11 x8`                     | application accepted reset   |
//! | 0xB0 | `22 x8` (or `00 x8`)        | bootloader ready (plain boot)|
//! | 0xB1 | `33 x8`                     | flash erased                 |
//! | 0xB2 | `seq 00 x7`                 | data packet stored           |
//! | 0xB3 | `crc LE, size LE`           | image verified               |
//! | 0xB4 | `code 00 x3, crc LE`        | rejected or CRC mismatch     |

use std::collections::HashMap;

use canflash::config::IapConfig;
use canflash::flash::raw_iap::{
    DATA_HEADER, EOT_HEADER, ERASE_DONE_BYTE, PACKET_PAYLOAD, PLAIN_BOOT_BYTE, READY_BYTE,
    RESET_BYTE,
};
use canflash::frame::CanFrame;
use canflash::image::{CRC32, WRITE_ALIGNMENT};
use tracing::{debug, info, warn};

use crate::SimDevice;

/// Error codes carried in byte 0 of an 0xB4 frame
pub mod error_code {
    pub const BAD_METADATA: u8 = 0x01;
    pub const BAD_SEQUENCE: u8 = 0x02;
    pub const CRC_MISMATCH: u8 = 0x03;
    pub const SIZE_MISMATCH: u8 = 0x04;
}

/// Misbehaviour to inject into a run
#[derive(Debug, Clone, Default)]
pub struct IapFaults {
    /// Number of ACKs to swallow per data sequence number
    pub drop_acks: HashMap<u8, u32>,
    /// Report a plain boot before the ready frame
    pub plain_boot_first: bool,
    /// Ignore reset requests entirely
    pub unresponsive: bool,
    /// Flip a bit of the computed CRC at end of transmission
    pub corrupt_crc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IapPhase {
    /// Running the application, waiting for a reset request
    Application,
    /// Bootloader waiting for size and CRC
    AwaitingMetadata,
    /// Erased, storing data packets
    Receiving,
}

/// Bootloader state
pub struct IapBootloader {
    ids: IapConfig,
    faults: IapFaults,
    max_size: u32,
    phase: IapPhase,
    expected_size: u32,
    expected_crc: u32,
    buffer: Vec<u8>,
    next_sequence: u8,
    flashed: Option<Vec<u8>>,
}

impl IapBootloader {
    pub fn new(ids: IapConfig, max_size: u32) -> Self {
        Self::with_faults(ids, max_size, IapFaults::default())
    }

    pub fn with_faults(ids: IapConfig, max_size: u32, faults: IapFaults) -> Self {
        Self {
            ids,
            faults,
            max_size,
            phase: IapPhase::Application,
            expected_size: 0,
            expected_crc: 0,
            buffer: Vec::new(),
            next_sequence: 0,
            flashed: None,
        }
    }

    pub fn phase(&self) -> IapPhase {
        self.phase
    }

    /// Application image written by the last successful update
    pub fn flashed(&self) -> Option<&[u8]> {
        self.flashed.as_deref()
    }

    fn frame(&self, id: u32, data: [u8; 8]) -> Vec<CanFrame> {
        match CanFrame::full(id, data) {
            Ok(frame) => vec![frame],
            Err(e) => {
                warn!(error = %e, "Cannot build reply frame");
                Vec::new()
            }
        }
    }

    fn error_frame(&self, code: u8, crc: u32) -> Vec<CanFrame> {
        let mut data = [0u8; 8];
        data[0] = code;
        data[4..].copy_from_slice(&crc.to_le_bytes());
        self.frame(self.ids.error_id, data)
    }

    fn handle_reset(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        if !frame.is_pattern(RESET_BYTE) {
            debug!(%frame, "Ignoring malformed reset request");
            return Vec::new();
        }
        if self.faults.unresponsive {
            debug!("Reset request ignored");
            return Vec::new();
        }

        info!(phase = ?self.phase, "Reset requested, entering bootloader");
        self.phase = IapPhase::AwaitingMetadata;
        self.buffer.clear();

        let mut replies = self.frame(self.ids.app_ack_id, [RESET_BYTE; 8]);
        if self.faults.plain_boot_first {
            replies.extend(self.frame(self.ids.ready_id, [PLAIN_BOOT_BYTE; 8]));
        }
        replies.extend(self.frame(self.ids.ready_id, [READY_BYTE; 8]));
        replies
    }

    fn handle_metadata(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        if self.phase != IapPhase::AwaitingMetadata {
            debug!(phase = ?self.phase, "Metadata outside bootloader, ignored");
            return Vec::new();
        }
        let data = frame.data();
        if data.len() != 8 {
            return self.error_frame(error_code::BAD_METADATA, 0);
        }

        let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let crc = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if size == 0 || size > self.max_size || size % WRITE_ALIGNMENT as u32 != 0 {
            warn!(size, max = self.max_size, "Rejecting image size");
            return self.error_frame(error_code::BAD_METADATA, 0);
        }

        info!(
            size,
            crc32 = format!("0x{:08X}", crc),
            "Metadata received, erasing application area"
        );
        self.expected_size = size;
        self.expected_crc = crc;
        self.buffer = Vec::with_capacity(size as usize);
        self.next_sequence = 0;
        self.phase = IapPhase::Receiving;
        self.frame(self.ids.erase_done_id, [ERASE_DONE_BYTE; 8])
    }

    fn handle_data(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        let data = frame.data();
        if self.phase != IapPhase::Receiving || data.len() != 8 || data[0] != DATA_HEADER {
            debug!(%frame, "Unexpected data packet, ignored");
            return Vec::new();
        }

        let sequence = data[1];
        if let Some(drops) = self.faults.drop_acks.get_mut(&sequence) {
            if *drops > 0 {
                *drops -= 1;
                debug!(sequence, "Dropping packet without ACK");
                return Vec::new();
            }
        }

        if sequence == self.next_sequence {
            let remaining = self.expected_size as usize - self.buffer.len();
            let take = remaining.min(PACKET_PAYLOAD);
            self.buffer.extend_from_slice(&data[2..2 + take]);
            self.next_sequence = self.next_sequence.wrapping_add(1);
            debug!(sequence, stored = self.buffer.len(), "Packet stored");
        } else if sequence == self.next_sequence.wrapping_sub(1) {
            // Host missed our ACK and resent the previous packet
            debug!(sequence, "Duplicate packet acknowledged again");
        } else {
            warn!(
                expected = self.next_sequence,
                received = sequence,
                "Wrong packet sequence"
            );
            return self.error_frame(error_code::BAD_SEQUENCE, 0);
        }

        let mut ack = [0u8; 8];
        ack[0] = sequence;
        self.frame(self.ids.data_ack_id, ack)
    }

    fn handle_eot(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        if self.phase != IapPhase::Receiving || frame.first_byte() != Some(EOT_HEADER) {
            debug!(%frame, "Unexpected end of transmission, ignored");
            return Vec::new();
        }

        let mut crc = CRC32.checksum(&self.buffer);
        if self.faults.corrupt_crc {
            crc ^= 1;
        }

        if self.buffer.len() != self.expected_size as usize {
            warn!(
                received = self.buffer.len(),
                expected = self.expected_size,
                "Image incomplete"
            );
            self.phase = IapPhase::AwaitingMetadata;
            return self.error_frame(error_code::SIZE_MISMATCH, crc);
        }
        if crc != self.expected_crc {
            warn!(
                host_crc = format!("0x{:08X}", self.expected_crc),
                device_crc = format!("0x{:08X}", crc),
                "CRC mismatch, staying in bootloader"
            );
            self.phase = IapPhase::AwaitingMetadata;
            return self.error_frame(error_code::CRC_MISMATCH, crc);
        }

        info!(
            size = self.expected_size,
            crc32 = format!("0x{:08X}", crc),
            "Image verified, starting application"
        );
        self.flashed = Some(std::mem::take(&mut self.buffer));
        self.phase = IapPhase::Application;

        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&crc.to_le_bytes());
        data[4..].copy_from_slice(&self.expected_size.to_le_bytes());
        self.frame(self.ids.verify_ok_id, data)
    }
}

impl SimDevice for IapBootloader {
    fn name(&self) -> &'static str {
        "iap-bootloader"
    }

    fn on_frame(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        let id = frame.id();
        if id == self.ids.reset_id {
            self.handle_reset(frame)
        } else if id == self.ids.metadata_id {
            self.handle_metadata(frame)
        } else if id == self.ids.data_id {
            self.handle_data(frame)
        } else if id == self.ids.eot_id {
            self.handle_eot(frame)
        } else {
            Vec::new()
        }
    }
}
