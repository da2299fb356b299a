//! Raw SocketCAN adapter for classic CAN frames

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::{CanFrame as RawFrame, CanSocket, EmbeddedFrame, Frame, Socket, StandardId};
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::frame::CanFrame;
use crate::transport::{ChannelInfo, FrameTransport, TransportError};

/// Frame transport over a raw SocketCAN socket
///
/// The socket is non-blocking. Frames read from the kernel are parked in a
/// local queue until a consumer takes them, so `pending_count` never loses
/// traffic. Extended-id, remote and error frames are dropped on arrival.
pub struct SocketCanTransport {
    config: ChannelConfig,
    socket: Mutex<CanSocket>,
    pending: Mutex<VecDeque<CanFrame>>,
    connected: AtomicBool,
}

impl SocketCanTransport {
    pub fn open(config: &ChannelConfig) -> Result<Self, TransportError> {
        let socket = CanSocket::open(&config.interface).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to open CAN socket on {}: {}",
                config.interface, e
            ))
        })?;

        socket.set_nonblocking(true).map_err(|e| {
            TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e))
        })?;

        Self::drain_socket(&socket);

        info!(
            interface = %config.interface,
            bitrate = config.bitrate,
            "CAN channel opened (bit rate is configured on the interface)"
        );

        Ok(Self {
            config: config.clone(),
            socket: Mutex::new(socket),
            pending: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(true),
        })
    }

    /// Drop frames queued before we opened the channel
    fn drain_socket(socket: &CanSocket) {
        while let Ok(frame) = socket.read_frame() {
            debug!(id = format!("0x{:X}", frame.raw_id()), "Drained stale frame");
        }
    }

    /// Move everything the kernel has buffered into the local queue
    fn fill_pending(&self) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let socket = self.socket.lock();
        let mut pending = self.pending.lock();
        loop {
            match socket.read_frame() {
                Ok(raw) => {
                    if let Some(frame) = convert_frame(&raw) {
                        pending.push_back(frame);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    return Err(TransportError::ReceiveFailed(format!(
                        "SocketCAN read error: {}",
                        e
                    )))
                }
            }
        }
    }
}

fn convert_frame(raw: &RawFrame) -> Option<CanFrame> {
    if raw.is_extended() || raw.is_remote_frame() || raw.is_error_frame() {
        return None;
    }
    match CanFrame::new(raw.raw_id(), raw.data()) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed frame");
            None
        }
    }
}

#[async_trait]
impl FrameTransport for SocketCanTransport {
    async fn transmit(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let id = StandardId::new(frame.id() as u16).ok_or_else(|| {
            TransportError::InvalidConfig(format!("Invalid standard CAN ID: 0x{:X}", frame.id()))
        })?;
        let raw = RawFrame::new(id, frame.data()).ok_or_else(|| {
            TransportError::SendFailed(format!("Cannot build frame from {}", frame))
        })?;

        self.socket
            .lock()
            .write_frame(&raw)
            .map_err(|e| TransportError::SendFailed(format!("{}: {}", frame, e)))
    }

    async fn pending_count(&self) -> Result<usize, TransportError> {
        self.fill_pending()?;
        Ok(self.pending.lock().len())
    }

    async fn receive(&self, max: usize) -> Result<Vec<CanFrame>, TransportError> {
        self.fill_pending()?;
        let mut pending = self.pending.lock();
        let count = max.min(pending.len());
        Ok(pending.drain(..count).collect())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().clear();
        debug!(interface = %self.config.interface, "CAN channel closed");
        Ok(())
    }

    fn channel_info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.config.interface.clone(),
            bitrate: Some(self.config.bitrate),
        }
    }
}
