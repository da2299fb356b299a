//! Traffic tap for passive listeners

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ChannelInfo, Direction, FrameEvent, FrameTransport, TransportError};
use crate::frame::CanFrame;

/// Wraps a transport and publishes every frame crossing it
///
/// Listeners get copies through [`subscribe`](Self::subscribe) and never
/// consume inbound traffic, so a monitoring view can run alongside the one
/// active consumer of the channel.
pub struct MonitoredTransport {
    inner: Arc<dyn FrameTransport>,
    events: broadcast::Sender<FrameEvent>,
}

impl MonitoredTransport {
    pub fn new(inner: Arc<dyn FrameTransport>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { inner, events }
    }

    /// Subscribe to transmitted and received frames
    pub fn subscribe(&self) -> broadcast::Receiver<FrameEvent> {
        self.events.subscribe()
    }

    fn publish(&self, direction: Direction, frame: CanFrame) {
        // No receivers is fine
        let _ = self.events.send(FrameEvent {
            timestamp: Instant::now(),
            direction,
            frame,
        });
    }
}

#[async_trait]
impl FrameTransport for MonitoredTransport {
    async fn transmit(&self, frame: &CanFrame) -> Result<(), TransportError> {
        self.inner.transmit(frame).await?;
        self.publish(Direction::Tx, *frame);
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, TransportError> {
        self.inner.pending_count().await
    }

    async fn receive(&self, max: usize) -> Result<Vec<CanFrame>, TransportError> {
        let frames = self.inner.receive(max).await?;
        for frame in &frames {
            self.publish(Direction::Rx, *frame);
        }
        Ok(frames)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    fn channel_info(&self) -> ChannelInfo {
        self.inner.channel_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[tokio::test]
    async fn test_tap_sees_both_directions() {
        let mock = Arc::new(MockTransport::with_responder(|_| {
            vec![CanFrame::new(0xB2, &[0]).unwrap()]
        }));
        let monitored = MonitoredTransport::new(mock);
        let mut rx = monitored.subscribe();

        monitored
            .transmit(&CanFrame::new(0xC2, &[0xAA, 0]).unwrap())
            .await
            .unwrap();
        monitored.receive(4).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.direction, Direction::Tx);
        assert_eq!(first.frame.id(), 0xC2);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.direction, Direction::Rx);
        assert_eq!(second.frame.id(), 0xB2);
    }
}
