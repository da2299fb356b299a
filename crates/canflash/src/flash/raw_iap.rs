//! Raw IAP protocol: fixed 8-byte frames with one CAN ID per message type
//!
//! ```text
//! host                                   device
//!  0xC0  11 11 11 11 11 11 11 11  ──►            application resets
//!                                 ◄──  0xA0      (optional) reset acknowledged
//!                                 ◄──  0xB0  22 22 22 22 22 22 22 22
//!  0xC1  size(LE32) crc32(LE32)   ──►
//!                                 ◄──  0xB1  33 33 33 33 33 33 33 33
//!  0xC2  AA seq d0..d5 FF..       ──►
//!                                 ◄──  0xB2  seq
//!  ...
//!  0xC3  BB 00 00 00 00 00 00 00  ──►
//!                                 ◄──  0xB3 (verified) | 0xB4 / 0xB0 (rejected)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{FlashError, FlashStrategy};
use crate::config::IapConfig;
use crate::frame::CanFrame;
use crate::image::FirmwareImage;
use crate::transport::{wait_for, FrameTransport};

/// Fill byte of the reset request
pub const RESET_BYTE: u8 = 0x11;
/// Fill byte of the bootloader-ready frame
pub const READY_BYTE: u8 = 0x22;
/// Fill byte of the erase-done frame
pub const ERASE_DONE_BYTE: u8 = 0x33;
/// Leading byte of a ready-id frame sent on a plain boot
pub const PLAIN_BOOT_BYTE: u8 = 0x00;
/// Header of a data packet
pub const DATA_HEADER: u8 = 0xAA;
/// Header of the end-of-transmission frame
pub const EOT_HEADER: u8 = 0xBB;
/// Image bytes per data packet
pub const PACKET_PAYLOAD: usize = 6;
/// Fill for the unused tail of the last data packet
pub const PACKET_PAD: u8 = 0xFF;

/// Build the data packet for `chunk` (at most 6 bytes)
pub fn data_packet(sequence: u8, chunk: &[u8]) -> [u8; 8] {
    let mut packet = [PACKET_PAD; 8];
    packet[0] = DATA_HEADER;
    packet[1] = sequence;
    let len = chunk.len().min(PACKET_PAYLOAD);
    packet[2..2 + len].copy_from_slice(&chunk[..len]);
    packet
}

pub fn eot_packet() -> [u8; 8] {
    let mut packet = [0u8; 8];
    packet[0] = EOT_HEADER;
    packet
}

enum Verdict {
    Verified,
    Rejected(CanFrame),
}

/// Flash strategy for the raw IAP bootloader
pub struct RawIapStrategy {
    transport: Arc<dyn FrameTransport>,
    config: IapConfig,
}

impl RawIapStrategy {
    pub fn new(transport: Arc<dyn FrameTransport>, config: IapConfig) -> Self {
        Self { transport, config }
    }

    async fn send(&self, id: u32, data: [u8; 8]) -> Result<(), FlashError> {
        let frame = CanFrame::full(id, data)?;
        self.transport.transmit(&frame).await?;
        Ok(())
    }
}

#[async_trait]
impl FlashStrategy for RawIapStrategy {
    fn name(&self) -> &'static str {
        "raw-iap"
    }

    #[instrument(level = "debug", skip(self))]
    async fn enter_bootloader(&mut self) -> Result<(), FlashError> {
        info!(id = format!("0x{:03X}", self.config.reset_id), "Requesting reset into bootloader");
        self.send(self.config.reset_id, [RESET_BYTE; 8]).await?;

        let ready_id = self.config.ready_id;
        let app_ack_id = self.config.app_ack_id;
        let mut app_acked = false;
        let deadline = Instant::now() + self.config.ready_timeout();

        let ready = wait_for(
            self.transport.as_ref(),
            deadline,
            self.config.poll_interval(),
            |frame| {
                if frame.id() == app_ack_id && !app_acked {
                    info!("Application acknowledged reset, device restarting");
                    app_acked = true;
                } else if frame.id() == ready_id {
                    if frame.is_pattern(READY_BYTE) {
                        return Some(());
                    }
                    if frame.first_byte() == Some(PLAIN_BOOT_BYTE) {
                        warn!("Bootloader started normally, update request may not have been received");
                    }
                }
                None
            },
        )
        .await?;

        ready.ok_or(FlashError::Timeout {
            stage: "bootloader ready",
            waited: self.config.ready_timeout(),
        })
    }

    async fn send_metadata(&mut self, image: &FirmwareImage) -> Result<(), FlashError> {
        info!(
            size = image.size(),
            crc32 = format!("0x{:08X}", image.crc32()),
            "Sending firmware metadata"
        );
        self.send(self.config.metadata_id, image.metadata_le()).await
    }

    async fn erase(&mut self) -> Result<(), FlashError> {
        let erase_done_id = self.config.erase_done_id;
        let deadline = Instant::now() + self.config.erase_timeout();

        let done = wait_for(
            self.transport.as_ref(),
            deadline,
            self.config.poll_interval(),
            |frame| (frame.id() == erase_done_id && frame.is_pattern(ERASE_DONE_BYTE)).then_some(()),
        )
        .await?;

        done.ok_or(FlashError::Timeout {
            stage: "erase done",
            waited: self.config.erase_timeout(),
        })
    }

    fn block_size(&self) -> usize {
        PACKET_PAYLOAD
    }

    fn first_sequence(&self) -> u8 {
        0
    }

    async fn transfer_block(&mut self, sequence: u8, block: &[u8]) -> Result<(), FlashError> {
        let packet = data_packet(sequence, block);
        let ack_id = self.config.data_ack_id;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                warn!(
                    sequence,
                    attempt,
                    max_retries = self.config.max_retries,
                    "No ACK, retransmitting data packet"
                );
            }
            self.send(self.config.data_id, packet).await?;

            let deadline = Instant::now() + self.config.ack_timeout();
            let acked = wait_for(
                self.transport.as_ref(),
                deadline,
                self.config.poll_interval(),
                |frame| (frame.id() == ack_id && frame.first_byte() == Some(sequence)).then_some(()),
            )
            .await?;

            if acked.is_some() {
                return Ok(());
            }
        }

        Err(FlashError::AckTimeout {
            sequence,
            retries: self.config.max_retries,
        })
    }

    async fn verify(&mut self, image: &FirmwareImage) -> Result<(), FlashError> {
        info!("Sending end of transmission, waiting for device verification");
        self.send(self.config.eot_id, eot_packet()).await?;

        let ok_id = self.config.verify_ok_id;
        let reject_ids = [self.config.error_id, self.config.ready_id];
        let deadline = Instant::now() + self.config.verify_timeout();

        let verdict = wait_for(
            self.transport.as_ref(),
            deadline,
            self.config.poll_interval(),
            |frame| {
                if frame.id() == ok_id {
                    Some(Verdict::Verified)
                } else if reject_ids.contains(&frame.id()) {
                    Some(Verdict::Rejected(*frame))
                } else {
                    None
                }
            },
        )
        .await?;

        match verdict {
            Some(Verdict::Verified) => Ok(()),
            Some(Verdict::Rejected(frame)) => {
                debug!(%frame, "Device rejected the image");
                Err(FlashError::IntegrityMismatch {
                    host_crc: image.crc32(),
                    device_crc: None,
                })
            }
            None => Err(FlashError::Timeout {
                stage: "verification",
                waited: self.config.verify_timeout(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashSession, FlashState};
    use crate::transport::MockTransport;
    use pretty_assertions::assert_eq;

    fn frame(id: u32, data: &[u8]) -> CanFrame {
        CanFrame::new(id, data).unwrap()
    }

    /// Well-behaved bootloader; `drop_acks` swallows that many ACKs per packet
    fn bootloader(drop_acks: usize) -> impl FnMut(&CanFrame) -> Vec<CanFrame> + Send {
        let mut dropped = 0;
        move |f| match f.id() {
            0xC0 => vec![frame(0xA0, &[0x01]), frame(0xB0, &[0x22; 8])],
            0xC1 => vec![frame(0xB1, &[0x33; 8])],
            0xC2 => {
                if dropped < drop_acks {
                    dropped += 1;
                    Vec::new()
                } else {
                    dropped = 0;
                    vec![frame(0xB2, &[f.data()[1]])]
                }
            }
            0xC3 => vec![frame(0xB3, &[0x00; 8])],
            _ => Vec::new(),
        }
    }

    fn strategy(mock: &Arc<MockTransport>) -> RawIapStrategy {
        RawIapStrategy::new(mock.clone(), IapConfig::default())
    }

    #[test]
    fn test_packet_layout() {
        assert_eq!(
            data_packet(7, &[1, 2, 3, 4]),
            [0xAA, 7, 1, 2, 3, 4, 0xFF, 0xFF]
        );
        assert_eq!(eot_packet(), [0xBB, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_byte_image_sends_two_packets_then_eot() {
        let mock = Arc::new(MockTransport::with_responder(bootloader(0)));
        let image = FirmwareImage::from_bytes((1..=10).collect(), 1024).unwrap();
        let crc = image.crc32();

        let mut session = FlashSession::new(strategy(&mock), image);
        session.run().await.unwrap();

        let sent = mock.sent_frames();
        let ids: Vec<u32> = sent.iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec![0xC0, 0xC1, 0xC2, 0xC2, 0xC3]);

        let mut metadata = vec![12, 0, 0, 0];
        metadata.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(sent[1].data(), metadata.as_slice());

        assert_eq!(sent[2].data(), &[0xAA, 0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(sent[3].data(), &[0xAA, 1, 7, 8, 9, 10, 0xFF, 0xFF]);
        assert_eq!(sent[4].data(), &[0xBB, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_ack_is_retransmitted_with_same_sequence() {
        let mock = Arc::new(MockTransport::with_responder(bootloader(2)));
        let mut iap = strategy(&mock);

        iap.transfer_block(5, &[9; 6]).await.unwrap();

        let packets = mock.sent_on(0xC2);
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.data() == packets[0].data()));
        assert_eq!(packets[0].data()[1], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_retries_exhausted() {
        let mock = Arc::new(MockTransport::with_responder(bootloader(usize::MAX)));
        let mut iap = strategy(&mock);

        let start = Instant::now();
        let err = iap.transfer_block(3, &[0; 6]).await.unwrap_err();

        assert!(matches!(err, FlashError::AckTimeout { sequence: 3, retries: 3 }));
        // Original transmission plus three retries
        assert_eq!(mock.sent_on(0xC2).len(), 4);
        assert!(start.elapsed() >= std::time::Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_for_other_sequence_is_not_accepted() {
        let mock = Arc::new(MockTransport::with_responder(|f| {
            if f.id() == 0xC2 {
                vec![frame(0xB2, &[f.data()[1].wrapping_add(1)])]
            } else {
                Vec::new()
            }
        }));

        let err = strategy(&mock).transfer_block(0, &[0; 6]).await.unwrap_err();
        assert!(matches!(err, FlashError::AckTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_boot_is_only_a_warning() {
        let mock = Arc::new(MockTransport::with_responder(|f| {
            if f.id() == 0xC0 {
                vec![frame(0xB0, &[0x00; 8]), frame(0xB0, &[0x22; 8])]
            } else {
                Vec::new()
            }
        }));

        strategy(&mock).enter_bootloader().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ready_times_out() {
        let mock = Arc::new(MockTransport::new());
        let mut session = FlashSession::new(
            strategy(&mock),
            FirmwareImage::from_bytes(vec![0; 4], 1024).unwrap(),
        );

        let failure = session.run().await.unwrap_err();
        assert_eq!(failure.state, FlashState::AwaitingBootloaderReady);
        assert!(matches!(
            failure.source,
            FlashError::Timeout {
                stage: "bootloader ready",
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_during_verify_is_integrity_failure() {
        let mock = Arc::new(MockTransport::with_responder(|f| {
            if f.id() == 0xC3 {
                vec![frame(0xB0, &[0x00; 8])]
            } else {
                Vec::new()
            }
        }));
        let image = FirmwareImage::from_bytes(vec![0; 4], 1024).unwrap();

        let err = strategy(&mock).verify(&image).await.unwrap_err();
        assert!(matches!(
            err,
            FlashError::IntegrityMismatch {
                host_crc: 0x2144_DF1C,
                device_crc: None
            }
        ));
    }
}
