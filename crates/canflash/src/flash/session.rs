//! Flash session state machine

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{FlashError, FlashFailure, FlashState, FlashStrategy, TransferProgress};
use crate::image::FirmwareImage;

type ProgressCallback = Box<dyn Fn(&TransferProgress) + Send + Sync>;

/// One firmware update of one device
pub struct FlashSession<S: FlashStrategy> {
    strategy: S,
    image: FirmwareImage,
    state: FlashState,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl<S: FlashStrategy> FlashSession<S> {
    pub fn new(strategy: S, image: FirmwareImage) -> Self {
        Self {
            strategy,
            image,
            state: FlashState::Idle,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Abort the run when `token` is cancelled
    ///
    /// The token is checked between steps and between blocks. A step
    /// already on the bus always runs to completion.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Called after every acknowledged block
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TransferProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> FlashState {
        self.state
    }

    pub fn image(&self) -> &FirmwareImage {
        &self.image
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Flash the image. Success means the device verified the CRC itself.
    #[instrument(
        skip(self),
        fields(
            protocol = self.strategy.name(),
            size = self.image.size(),
            crc32 = format!("0x{:08X}", self.image.crc32())
        )
    )]
    pub async fn run(&mut self) -> Result<TransferProgress, FlashFailure> {
        match self.execute().await {
            Ok(progress) => {
                self.state = FlashState::Success;
                info!(blocks = progress.blocks, "Firmware update verified by device");
                Ok(progress)
            }
            Err(source) => {
                let state = self.state;
                self.state = FlashState::Failed;
                warn!(%state, error = %source, "Firmware update failed");
                Err(FlashFailure {
                    state,
                    size: self.image.size(),
                    crc32: self.image.crc32(),
                    last_nrc: self.strategy.last_nrc(),
                    source,
                })
            }
        }
    }

    fn enter(&mut self, state: FlashState) -> Result<(), FlashError> {
        if self.cancel.is_cancelled() {
            return Err(FlashError::Cancelled);
        }
        debug!(from = %self.state, to = %state, "State change");
        self.state = state;
        Ok(())
    }

    async fn execute(&mut self) -> Result<TransferProgress, FlashError> {
        self.enter(FlashState::AwaitingBootloaderReady)?;
        self.strategy.enter_bootloader().await?;
        info!("Bootloader ready");

        self.enter(FlashState::MetadataSent)?;
        self.strategy.send_metadata(&self.image).await?;

        self.enter(FlashState::AwaitingEraseDone)?;
        self.strategy.erase().await?;
        info!("Flash erased");

        self.enter(FlashState::Transferring)?;
        let progress = self.transfer().await?;
        info!(bytes = progress.offset, blocks = progress.blocks, "Transfer complete");

        self.enter(FlashState::AwaitingVerify)?;
        self.strategy.verify(&self.image).await?;

        Ok(progress)
    }

    async fn transfer(&mut self) -> Result<TransferProgress, FlashError> {
        let block_size = self.strategy.block_size();
        let mut sequence = self.strategy.first_sequence();
        let mut progress = TransferProgress {
            offset: 0,
            total: self.image.size(),
            sequence,
            blocks: 0,
        };

        for block in self.image.chunks(block_size) {
            if self.cancel.is_cancelled() {
                return Err(FlashError::Cancelled);
            }

            debug!(sequence, offset = progress.offset, len = block.len(), "Sending block");
            self.strategy.transfer_block(sequence, block).await?;

            progress.offset += block.len() as u32;
            progress.sequence = sequence;
            progress.blocks += 1;
            if let Some(callback) = &self.progress {
                callback(&progress);
            }

            sequence = sequence.wrapping_add(1);
        }
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uds::NegativeResponseCode;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    /// Strategy recording every call, optionally failing at one step
    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail_at: Option<&'static str>,
        slow_transfer: bool,
    }

    impl Recorder {
        fn step(&mut self, name: &'static str) -> Result<(), FlashError> {
            self.calls.push(name.to_string());
            if self.fail_at == Some(name) {
                return Err(FlashError::Timeout {
                    stage: name,
                    waited: Duration::from_secs(1),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl FlashStrategy for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn enter_bootloader(&mut self) -> Result<(), FlashError> {
            self.step("enter")
        }

        async fn send_metadata(&mut self, _image: &FirmwareImage) -> Result<(), FlashError> {
            self.step("metadata")
        }

        async fn erase(&mut self) -> Result<(), FlashError> {
            self.step("erase")
        }

        fn block_size(&self) -> usize {
            4
        }

        fn first_sequence(&self) -> u8 {
            254
        }

        async fn transfer_block(&mut self, sequence: u8, block: &[u8]) -> Result<(), FlashError> {
            if self.slow_transfer {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            self.calls.push(format!("block {} len {}", sequence, block.len()));
            Ok(())
        }

        async fn verify(&mut self, _image: &FirmwareImage) -> Result<(), FlashError> {
            self.step("verify")
        }

        fn last_nrc(&self) -> Option<NegativeResponseCode> {
            Some(NegativeResponseCode::ConditionsNotCorrect)
        }
    }

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::from_bytes(vec![0x5A; len], 1024).unwrap()
    }

    #[tokio::test]
    async fn test_runs_steps_in_order_with_wrapping_sequence() {
        let mut session = FlashSession::new(Recorder::default(), image(10));

        let progress = session.run().await.unwrap();

        assert_eq!(session.state(), FlashState::Success);
        assert_eq!(
            session.strategy().calls,
            vec![
                "enter",
                "metadata",
                "erase",
                "block 254 len 4",
                "block 255 len 4",
                "block 0 len 4",
                "verify"
            ]
        );
        assert_eq!(progress.offset, 12);
        assert_eq!(progress.blocks, 3);
        assert_eq!(progress.sequence, 0);
    }

    #[tokio::test]
    async fn test_failure_reports_state_and_image() {
        let strategy = Recorder {
            fail_at: Some("erase"),
            ..Default::default()
        };
        let mut session = FlashSession::new(strategy, image(8));

        let failure = session.run().await.unwrap_err();

        assert_eq!(failure.state, FlashState::AwaitingEraseDone);
        assert_eq!(failure.size, 8);
        assert_eq!(failure.crc32, session.image().crc32());
        assert_eq!(failure.last_nrc, Some(NegativeResponseCode::ConditionsNotCorrect));
        assert_eq!(session.state(), FlashState::Failed);
        assert!(!session.strategy().calls.iter().any(|c| c.starts_with("block")));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut session = FlashSession::new(Recorder::default(), image(16))
            .with_progress(move |p| sink.lock().push(p.offset));

        session.run().await.unwrap();

        assert_eq!(*seen.lock(), vec![4, 8, 12, 16]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_lets_block_in_flight_finish() {
        let strategy = Recorder {
            slow_transfer: true,
            ..Default::default()
        };
        let token = CancellationToken::new();
        let mut session = FlashSession::new(strategy, image(12)).with_cancellation(token.clone());

        // Fires while the first block is still being sent
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let failure = session.run().await.unwrap_err();
        assert!(matches!(failure.source, FlashError::Cancelled));
        assert_eq!(failure.state, FlashState::Transferring);
        assert_eq!(
            session.strategy().calls,
            vec!["enter", "metadata", "erase", "block 254 len 4"]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start_touches_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let mut session =
            FlashSession::new(Recorder::default(), image(8)).with_cancellation(token);

        let failure = session.run().await.unwrap_err();
        assert!(matches!(failure.source, FlashError::Cancelled));
        assert_eq!(failure.state, FlashState::Idle);
        assert!(session.strategy().calls.is_empty());
    }
}
