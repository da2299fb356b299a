//! Mock frame transport for testing

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ChannelInfo, FrameTransport, TransportError};
use crate::frame::CanFrame;

type Responder = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame> + Send>;

/// Mock transport adapter for testing
///
/// Every transmitted frame is recorded and handed to an optional responder,
/// whose returned frames are queued as received traffic. A simulated device
/// plugs in as the responder.
pub struct MockTransport {
    connected: AtomicBool,
    inbound: Mutex<VecDeque<CanFrame>>,
    sent: Mutex<Vec<CanFrame>>,
    responder: Mutex<Option<Responder>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            inbound: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        }
    }

    /// Create a mock whose responder is called for each transmitted frame
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static,
    {
        let mock = Self::new();
        mock.set_responder(responder);
        mock
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Inject a received frame (simulates unsolicited device traffic)
    pub fn inject(&self, frame: CanFrame) {
        self.inbound.lock().push_back(frame);
    }

    /// All frames transmitted so far, in order
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }

    /// Transmitted frames with the given identifier
    pub fn sent_on(&self, id: u32) -> Vec<CanFrame> {
        self.sent
            .lock()
            .iter()
            .filter(|f| f.id() == id)
            .copied()
            .collect()
    }

    /// Set connection state; a disconnected mock fails every transmit
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameTransport for MockTransport {
    async fn transmit(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        tracing::trace!(%frame, "Mock transport: sent frame");
        self.sent.lock().push(*frame);

        let replies = match self.responder.lock().as_mut() {
            Some(responder) => responder(frame),
            None => Vec::new(),
        };
        self.inbound.lock().extend(replies);
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, TransportError> {
        Ok(self.inbound.lock().len())
    }

    async fn receive(&self, max: usize) -> Result<Vec<CanFrame>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut inbound = self.inbound.lock();
        let count = max.min(inbound.len());
        Ok(inbound.drain(..count).collect())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn channel_info(&self) -> ChannelInfo {
        ChannelInfo {
            name: "mock".to_string(),
            bitrate: None,
        }
    }
}
