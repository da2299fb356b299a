//! UDS download sequence over ISO-TP
//!
//! | step | request            | in        | failure        |
//! |------|--------------------|-----------|----------------|
//! | 1    | `10 03`            | app       | tolerated      |
//! | 2    | `31 01 FF 00`      | app       | tolerated      |
//! | 3    | `10 02`            | app       | tolerated      |
//! | 4    | `10 02`            | bootloader| fatal          |
//! | 5    | `34 size crc`      | bootloader| fatal          |
//! | 6    | `31 01 FF 00`      | bootloader| fatal (erase)  |
//! | 7    | `36 seq data`      | bootloader| fatal          |
//! | 8    | `37`               | bootloader| CRC mismatch   |
//!
//! Steps 1-3 fail harmlessly when the device already runs its bootloader.

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::{FlashError, FlashStrategy};
use crate::config::UdsFlashConfig;
use crate::image::FirmwareImage;
use crate::uds::{session_type, NegativeResponseCode, UdsClient, UdsError};

/// Flash strategy for a UDS bootloader
pub struct UdsFlashStrategy {
    client: UdsClient,
    config: UdsFlashConfig,
    last_nrc: Option<NegativeResponseCode>,
}

impl UdsFlashStrategy {
    pub fn new(client: UdsClient, config: UdsFlashConfig) -> Self {
        Self {
            client,
            config,
            last_nrc: None,
        }
    }

    fn record(&mut self, error: &UdsError) {
        if let Some(nrc) = error.nrc() {
            self.last_nrc = Some(nrc);
        }
    }

    /// Map a failed request of a required step
    fn required(
        &mut self,
        step: &'static str,
        result: Result<Vec<u8>, UdsError>,
    ) -> Result<Vec<u8>, FlashError> {
        result.map_err(|source| {
            self.record(&source);
            FlashError::Step { step, source }
        })
    }

    /// Log a failed request of an optional step; true when it succeeded
    fn tolerated(&mut self, step: &'static str, result: Result<Vec<u8>, UdsError>) -> bool {
        match result {
            Ok(_) => {
                info!(step, "Step accepted");
                true
            }
            Err(e) => {
                self.record(&e);
                warn!(step, error = %e, "Step failed, continuing");
                false
            }
        }
    }
}

#[async_trait]
impl FlashStrategy for UdsFlashStrategy {
    fn name(&self) -> &'static str {
        "uds"
    }

    #[instrument(level = "debug", skip(self))]
    async fn enter_bootloader(&mut self) -> Result<(), FlashError> {
        let result = self
            .client
            .diagnostic_session_control(session_type::EXTENDED)
            .await;
        self.tolerated("extended session", result);
        tokio::time::sleep(self.config.step_gap()).await;

        let result = self
            .client
            .routine_control_start(self.config.flash_routine, self.client.default_timeout())
            .await;
        self.tolerated("pre-programming check", result);
        tokio::time::sleep(self.config.step_gap()).await;

        let result = self
            .client
            .diagnostic_session_control(session_type::PROGRAMMING)
            .await;
        if self.tolerated("programming session", result) {
            info!(
                settle_ms = self.config.settle_ms,
                "Device resetting into bootloader"
            );
            tokio::time::sleep(self.config.settle()).await;
        }

        let result = self
            .client
            .diagnostic_session_control(session_type::PROGRAMMING)
            .await;
        self.required("bootloader handshake", result)?;
        Ok(())
    }

    async fn send_metadata(&mut self, image: &FirmwareImage) -> Result<(), FlashError> {
        info!(
            size = image.size(),
            crc32 = format!("0x{:08X}", image.crc32()),
            "Requesting download"
        );
        let result = self
            .client
            .request_download(image.size(), image.crc32())
            .await;
        self.required("request download", result)?;
        Ok(())
    }

    async fn erase(&mut self) -> Result<(), FlashError> {
        let result = self
            .client
            .routine_control_start(self.config.flash_routine, self.config.erase_timeout())
            .await;
        self.required("erase", result)?;
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.config.max_block_size
    }

    fn first_sequence(&self) -> u8 {
        1
    }

    async fn transfer_block(&mut self, sequence: u8, block: &[u8]) -> Result<(), FlashError> {
        let result = self.client.transfer_data(sequence, block).await;
        self.required("transfer data", result)?;
        tokio::time::sleep(self.config.block_gap()).await;
        Ok(())
    }

    async fn verify(&mut self, image: &FirmwareImage) -> Result<(), FlashError> {
        info!("Requesting transfer exit, device verifies CRC");
        match self.client.request_transfer_exit().await {
            Ok(_) => Ok(()),
            Err(UdsError::NegativeResponse { nrc, data, .. }) => {
                self.last_nrc = Some(nrc);
                let device_crc = data
                    .get(..4)
                    .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
                    .map(u32::from_le_bytes);
                Err(FlashError::IntegrityMismatch {
                    host_crc: image.crc32(),
                    device_crc,
                })
            }
            Err(source) => Err(FlashError::Step {
                step: "transfer exit",
                source,
            }),
        }
    }

    fn last_nrc(&self) -> Option<NegativeResponseCode> {
        self.last_nrc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IsoTpConfig, UdsClientConfig};
    use crate::frame::CanFrame;
    use crate::isotp::IsoTpLayer;
    use crate::transport::MockTransport;
    use std::sync::Arc;

    fn reply(bytes: &[u8]) -> CanFrame {
        let mut data = [0u8; 8];
        data[0] = bytes.len() as u8;
        data[1..1 + bytes.len()].copy_from_slice(bytes);
        CanFrame::full(0x7E8, data).unwrap()
    }

    fn strategy(mock: &Arc<MockTransport>) -> UdsFlashStrategy {
        let client = UdsClient::new(
            IsoTpLayer::new(mock.clone(), IsoTpConfig::default()),
            UdsClientConfig::default(),
        );
        UdsFlashStrategy::new(client, UdsFlashConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_app_side_refusals_are_tolerated() {
        // Already in the bootloader: only the handshake is answered positively
        let mut handshakes = 0;
        let mock = Arc::new(MockTransport::with_responder(move |f| {
            match f.data()[1..3] {
                [0x10, 0x03] => vec![reply(&[0x7F, 0x10, 0x12])],
                [0x31, _] => vec![reply(&[0x7F, 0x31, 0x22])],
                [0x10, 0x02] => {
                    handshakes += 1;
                    if handshakes == 1 {
                        vec![reply(&[0x7F, 0x10, 0x22])]
                    } else {
                        vec![reply(&[0x50, 0x02])]
                    }
                }
                _ => Vec::new(),
            }
        }));

        let mut uds = strategy(&mock);
        uds.enter_bootloader().await.unwrap();

        assert_eq!(mock.sent_frames().len(), 4);
        assert_eq!(uds.last_nrc(), Some(NegativeResponseCode::ConditionsNotCorrect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handshake_is_fatal() {
        let mock = Arc::new(MockTransport::new());
        let err = strategy(&mock).enter_bootloader().await.unwrap_err();
        assert!(matches!(
            err,
            FlashError::Step {
                step: "bootloader handshake",
                source: UdsError::Timeout { .. }
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_transfer_exit_reports_device_crc() {
        let mock = Arc::new(MockTransport::with_responder(|_| {
            vec![reply(&[0x7F, 0x37, 0x72, 0x78, 0x56, 0x34, 0x12])]
        }));
        let image = FirmwareImage::from_bytes(vec![0; 4], 1024).unwrap();

        let mut uds = strategy(&mock);
        let err = uds.verify(&image).await.unwrap_err();

        assert!(matches!(
            err,
            FlashError::IntegrityMismatch {
                host_crc: 0x2144_DF1C,
                device_crc: Some(0x1234_5678)
            }
        ));
        assert_eq!(
            uds.last_nrc(),
            Some(NegativeResponseCode::GeneralProgrammingFailure)
        );
    }
}
