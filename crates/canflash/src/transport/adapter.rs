//! Frame transport trait and types

use std::time::Instant;

use async_trait::async_trait;

use super::TransportError;
use crate::frame::CanFrame;

/// Description of an opened CAN channel
#[derive(Debug, Clone, Default)]
pub struct ChannelInfo {
    /// Interface or device name (e.g., "can0")
    pub name: String,
    /// Configured bus bit rate, when known
    pub bitrate: Option<u32>,
}

/// Direction of a frame relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// A frame observed on the channel, as published to passive listeners
#[derive(Debug, Clone)]
pub struct FrameEvent {
    /// When the frame crossed the transport boundary
    pub timestamp: Instant,
    pub direction: Direction,
    pub frame: CanFrame,
}

/// Raw CAN frame access over an opened and started channel
///
/// Implementations are the only place hardware is touched. Everything above
/// (ISO-TP, UDS, the flash strategies) receives the transport as an explicit
/// `Arc<dyn FrameTransport>` handle.
///
/// Receiving is destructive: a frame returned by [`receive`](Self::receive)
/// is gone for every other consumer, so only one active consumer may read a
/// channel at a time.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Queue one frame for transmission
    async fn transmit(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Number of received frames waiting to be read
    async fn pending_count(&self) -> Result<usize, TransportError>;

    /// Take up to `max` received frames, oldest first. Never blocks.
    async fn receive(&self, max: usize) -> Result<Vec<CanFrame>, TransportError>;

    /// Release the channel
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Get the channel description
    fn channel_info(&self) -> ChannelInfo;
}
