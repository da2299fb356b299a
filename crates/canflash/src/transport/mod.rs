//! Frame transport for CAN communication
//!
//! This module provides the raw frame boundary the protocol layers run on:
//! - SocketCAN adapter for real or virtual CAN interfaces (Linux only)
//! - Mock adapter for testing, with a scriptable device responder
//! - Monitoring wrapper that publishes all traffic to passive listeners
//!
//! Waiting for traffic is always expressed as [`recv_until`] or
//! [`wait_for`] with an explicit deadline, so no receive blocks forever.
//!
//! # Example
//!
//! ```ignore
//! use canflash::transport::{create_transport, wait_for};
//! use canflash::config::ChannelConfig;
//!
//! let transport = create_transport(&ChannelConfig::default())?;
//! let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
//! let ready = wait_for(transport.as_ref(), deadline, Duration::from_millis(10), |frame| {
//!     (frame.id() == 0xB0).then_some(())
//! })
//! .await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;
pub mod monitor;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::{ChannelInfo, Direction, FrameEvent, FrameTransport};
pub use error::TransportError;
pub use mock::MockTransport;
pub use monitor::MonitoredTransport;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::config::ChannelConfig;
use crate::frame::CanFrame;

/// Open a frame transport for the configured channel
pub fn create_transport(
    config: &ChannelConfig,
) -> Result<Arc<dyn FrameTransport>, TransportError> {
    #[cfg(all(target_os = "linux", feature = "socketcan"))]
    {
        let adapter = socketcan::SocketCanTransport::open(config)?;
        Ok(Arc::new(adapter))
    }
    #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
    {
        Err(TransportError::Unsupported(format!(
            "cannot open '{}': SocketCAN requires Linux and the 'socketcan' feature",
            config.interface
        )))
    }
}

/// Take the next received frame, polling until `deadline`.
///
/// Only the returned frame is drained from the transport. Returns `None`
/// once the deadline passes without traffic.
pub async fn recv_until(
    transport: &dyn FrameTransport,
    deadline: Instant,
    poll_interval: Duration,
) -> Result<Option<CanFrame>, TransportError> {
    loop {
        if let Some(frame) = transport.receive(1).await?.pop() {
            return Ok(Some(frame));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

/// Consume frames until `matcher` accepts one or `deadline` passes.
///
/// Frames the matcher rejects are consumed and dropped.
pub async fn wait_for<T, F>(
    transport: &dyn FrameTransport,
    deadline: Instant,
    poll_interval: Duration,
    mut matcher: F,
) -> Result<Option<T>, TransportError>
where
    F: FnMut(&CanFrame) -> Option<T> + Send,
{
    while let Some(frame) = recv_until(transport, deadline, poll_interval).await? {
        if let Some(value) = matcher(&frame) {
            return Ok(Some(value));
        }
        trace!(%frame, "Discarded unmatched frame");
    }
    Ok(None)
}
