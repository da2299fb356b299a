//! Firmware update orchestration
//!
//! A [`FlashSession`] walks one [`FirmwareImage`](crate::image::FirmwareImage)
//! through the update states and delegates each protocol step to a
//! [`FlashStrategy`]:
//!
//! ```text
//! Idle ─► AwaitingBootloaderReady ─► MetadataSent ─► AwaitingEraseDone
//!                                                          │
//!          Success ◄─ AwaitingVerify ◄─ Transferring ◄─────┘
//!
//!  any step failing ─► Failed
//! ```
//!
//! Two strategies exist: [`RawIapStrategy`] speaks the bespoke 8-byte
//! frame protocol directly on the transport, [`UdsFlashStrategy`] runs the
//! UDS download sequence over ISO-TP.

mod error;
pub mod raw_iap;
mod session;
pub mod uds_flash;

use std::fmt;

use async_trait::async_trait;

pub use error::{FlashError, FlashFailure};
pub use raw_iap::RawIapStrategy;
pub use session::FlashSession;
pub use uds_flash::UdsFlashStrategy;

use crate::image::FirmwareImage;
use crate::uds::NegativeResponseCode;

/// Where a flash session currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    AwaitingBootloaderReady,
    MetadataSent,
    AwaitingEraseDone,
    Transferring,
    AwaitingVerify,
    Success,
    Failed,
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::AwaitingBootloaderReady => "awaiting bootloader ready",
            Self::MetadataSent => "sending metadata",
            Self::AwaitingEraseDone => "awaiting erase",
            Self::Transferring => "transferring",
            Self::AwaitingVerify => "awaiting verification",
            Self::Success => "done",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Acknowledged transfer position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes the device has acknowledged
    pub offset: u32,
    pub total: u32,
    /// Sequence number of the last acknowledged block
    pub sequence: u8,
    pub blocks: u32,
}

/// Protocol half of a flash session
///
/// The session calls these in order and owns the state machine, the
/// transfer loop and the image.
#[async_trait]
pub trait FlashStrategy: Send {
    /// Short protocol name for logs
    fn name(&self) -> &'static str;

    /// Get the device into its bootloader, ready to accept an image
    async fn enter_bootloader(&mut self) -> Result<(), FlashError>;

    /// Announce the image size and CRC-32
    async fn send_metadata(&mut self, image: &FirmwareImage) -> Result<(), FlashError>;

    /// Erase the application partition and wait for completion
    async fn erase(&mut self) -> Result<(), FlashError>;

    /// Image bytes per transferred block
    fn block_size(&self) -> usize;

    /// Sequence number of the first block; later blocks wrap mod 256
    fn first_sequence(&self) -> u8;

    /// Send one block and wait for the device to acknowledge it
    async fn transfer_block(&mut self, sequence: u8, block: &[u8]) -> Result<(), FlashError>;

    /// End the transfer and wait for the device's integrity verdict
    async fn verify(&mut self, image: &FirmwareImage) -> Result<(), FlashError>;

    /// Most recent negative response code, for protocols that have them
    fn last_nrc(&self) -> Option<NegativeResponseCode> {
        None
    }
}
