//! Error types of every layer, collected in one place
//!
//! Each layer owns its error enum and converts the one below it with
//! `#[from]`:
//!
//! ```text
//! FrameError ─► TransportError ─► IsoTpError ─► UdsError ─► FlashError ─► FlashFailure
//! ```
//!
//! `ImageError` stands apart: images are loaded and checked before a
//! session exists.

pub use crate::config::ConfigError;
pub use crate::flash::{FlashError, FlashFailure};
pub use crate::frame::FrameError;
pub use crate::image::ImageError;
pub use crate::isotp::IsoTpError;
pub use crate::transport::TransportError;
pub use crate::uds::UdsError;
