//! canflash - firmware flashing over CAN
//!
//! This crate reprograms a microcontroller's application firmware over a
//! classic CAN bus, either through a bespoke raw-frame IAP bootloader
//! protocol or through UDS services carried by ISO-TP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      FlashSession                           │
//! │  state machine, transfer loop, cancellation, progress       │
//! │                                                             │
//! │        ┌──────────────────┐     ┌──────────────────┐        │
//! │        │ RawIapStrategy   │     │ UdsFlashStrategy │        │
//! │        │ (8-byte frames)  │     └────────┬─────────┘        │
//! │        └────────┬─────────┘              │                  │
//! │                 │                 ┌──────┴──────┐           │
//! │                 │                 │  UdsClient  │           │
//! │                 │                 └──────┬──────┘           │
//! │                 │                 ┌──────┴──────┐           │
//! │                 │                 │ IsoTpLayer  │           │
//! │                 │                 └──────┬──────┘           │
//! │              ┌──┴────────────────────────┴──┐               │
//! │              │  Arc<dyn FrameTransport>     │               │
//! │              │  (SocketCAN / mock / tap)    │               │
//! │              └──────────────────────────────┘               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use canflash::{create_transport, FirmwareImage, FlashSession, FlasherConfig, RawIapStrategy};
//!
//! let config = FlasherConfig::default();
//! let transport = create_transport(&config.channel)?;
//! let image = FirmwareImage::load("app.bin", config.image.max_size)?;
//! let strategy = RawIapStrategy::new(transport, config.iap.clone());
//! FlashSession::new(strategy, image).run().await?;
//! ```

pub mod config;
pub mod error;
pub mod flash;
pub mod frame;
pub mod image;
pub mod isotp;
pub mod transport;
pub mod uds;

pub use config::{ConfigError, FlasherConfig};
pub use flash::{
    FlashError, FlashFailure, FlashSession, FlashState, FlashStrategy, RawIapStrategy,
    TransferProgress, UdsFlashStrategy,
};
pub use frame::{CanFrame, FrameError};
pub use image::{FirmwareImage, ImageError};
pub use isotp::{IsoTpError, IsoTpLayer};
pub use transport::{create_transport, FrameTransport, MockTransport, TransportError};
pub use uds::{NegativeResponseCode, UdsClient, UdsError};

/// Build the UDS strategy stack (ISO-TP, client, strategy) on one transport
pub fn uds_strategy(
    transport: std::sync::Arc<dyn FrameTransport>,
    config: &FlasherConfig,
) -> UdsFlashStrategy {
    let isotp = IsoTpLayer::new(transport, config.isotp.clone());
    let client = UdsClient::new(isotp, config.uds.clone());
    UdsFlashStrategy::new(client, config.uds_flash.clone())
}

/// Build the raw IAP strategy on one transport
pub fn raw_iap_strategy(
    transport: std::sync::Arc<dyn FrameTransport>,
    config: &FlasherConfig,
) -> RawIapStrategy {
    RawIapStrategy::new(transport, config.iap.clone())
}
