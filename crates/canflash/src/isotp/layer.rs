//! Async ISO-TP endpoint on a shared frame transport

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use super::codec::{Reassembler, RxEvent, Segmenter};
use super::pci::{FlowControl, FlowStatus, Pci};
use super::{IsoTpError, MAX_PAYLOAD_LEN};
use crate::config::IsoTpConfig;
use crate::frame::CanFrame;
use crate::transport::{recv_until, wait_for, FrameTransport};

/// One ISO-TP connection (normal addressing, one tx/rx id pair)
///
/// Cloning is cheap and clones share the transport.
#[derive(Clone)]
pub struct IsoTpLayer {
    transport: Arc<dyn FrameTransport>,
    config: IsoTpConfig,
}

impl IsoTpLayer {
    pub fn new(transport: Arc<dyn FrameTransport>, config: IsoTpConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &IsoTpConfig {
        &self.config
    }

    async fn transmit(&self, data: [u8; 8]) -> Result<(), IsoTpError> {
        let frame = CanFrame::full(self.config.tx_id, data)?;
        self.transport.transmit(&frame).await?;
        Ok(())
    }

    /// Send one payload, segmenting and honouring the peer's flow control
    #[instrument(level = "debug", skip(self, payload), fields(len = payload.len()))]
    pub async fn send(&self, payload: &[u8]) -> Result<(), IsoTpError> {
        let mut segmenter = Segmenter::new(payload, self.config.padding)?;
        let first = segmenter.first_frame();

        if segmenter.is_single_frame() {
            trace!("Sending single frame");
            return self.transmit(first).await;
        }

        self.transmit(first).await?;
        let mut fc = self.await_flow_control().await?;
        let mut sent_in_block: u8 = 0;

        while let Some(cf) = segmenter.next_consecutive() {
            self.transmit(cf).await?;
            if segmenter.is_complete() {
                break;
            }

            sent_in_block += 1;
            if fc.block_size > 0 && sent_in_block >= fc.block_size {
                trace!(remaining = segmenter.remaining(), "Block complete, awaiting flow control");
                fc = self.await_flow_control().await?;
                sent_in_block = 0;
                continue;
            }

            let gap = fc.st_min.duration();
            if !gap.is_zero() {
                tokio::time::sleep(gap).await;
            }
        }

        debug!("Multi-frame message sent");
        Ok(())
    }

    /// Wait for FC(CTS), tolerating up to `wft_max` FC(Wait) frames
    async fn await_flow_control(&self) -> Result<FlowControl, IsoTpError> {
        let rx_id = self.config.rx_id;
        let mut waits: u8 = 0;

        loop {
            let deadline = Instant::now() + self.config.n_bs();
            let fc = wait_for(
                self.transport.as_ref(),
                deadline,
                self.config.poll_interval(),
                |frame| {
                    if frame.id() != rx_id {
                        return None;
                    }
                    match Pci::parse(frame.data()) {
                        Ok(Pci::FlowControl(fc)) => Some(fc),
                        _ => None,
                    }
                },
            )
            .await?;

            let Some(fc) = fc else {
                return Err(IsoTpError::FlowControlTimeout {
                    waited: self.config.n_bs(),
                });
            };

            match fc.status {
                FlowStatus::ContinueToSend => {
                    trace!(block_size = fc.block_size, st_min = fc.st_min.0, "Flow control CTS");
                    return Ok(fc);
                }
                FlowStatus::Wait => {
                    waits += 1;
                    if waits > self.config.wft_max {
                        warn!(waits, "Receiver kept the transfer waiting");
                        return Err(IsoTpError::FlowControlRejected {
                            status: FlowStatus::Wait,
                        });
                    }
                    trace!(waits, "Flow control WAIT");
                }
                FlowStatus::Overflow => {
                    return Err(IsoTpError::FlowControlRejected {
                        status: FlowStatus::Overflow,
                    });
                }
            }
        }
    }

    async fn send_flow_control(&self, fc: FlowControl) -> Result<(), IsoTpError> {
        self.transmit(fc.encode(self.config.padding)).await
    }

    /// Receive one complete message within `timeout`
    pub async fn receive(&self, timeout: Duration) -> Result<Vec<u8>, IsoTpError> {
        self.receive_until(Instant::now() + timeout).await
    }

    /// Receive one complete message
    ///
    /// `deadline` bounds the wait for the message to start. Once a First
    /// Frame arrives, each Consecutive Frame must follow within N_Cr.
    #[instrument(level = "debug", skip(self))]
    pub async fn receive_until(&self, deadline: Instant) -> Result<Vec<u8>, IsoTpError> {
        let mut reassembler = Reassembler::new(self.config.block_size, MAX_PAYLOAD_LEN);
        let mut frame_deadline = deadline;

        loop {
            let frame = match recv_until(
                self.transport.as_ref(),
                frame_deadline,
                self.config.poll_interval(),
            )
            .await?
            {
                Some(frame) => frame,
                None if reassembler.is_idle() => return Err(IsoTpError::Timeout),
                None => {
                    return Err(IsoTpError::ConsecutiveFrameTimeout {
                        waited: self.config.n_cr(),
                    })
                }
            };

            if frame.id() != self.config.rx_id {
                trace!(%frame, "Ignoring frame for another identifier");
                continue;
            }

            match reassembler.feed(frame.data()) {
                Ok(RxEvent::Complete(message)) => {
                    trace!(len = message.len(), "Message received");
                    return Ok(message);
                }
                Ok(RxEvent::FlowControlNeeded) => {
                    self.send_flow_control(FlowControl::continue_to_send(
                        self.config.block_size,
                        self.config.st_min,
                    ))
                    .await?;
                    frame_deadline = Instant::now() + self.config.n_cr();
                }
                Ok(RxEvent::Progress) => {
                    frame_deadline = Instant::now() + self.config.n_cr();
                }
                Ok(RxEvent::Ignored) => {}
                Err(e @ IsoTpError::MessageTooLarge { .. }) => {
                    self.send_flow_control(FlowControl::overflow()).await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    const TX: u32 = 0x7E0;
    const RX: u32 = 0x7E8;

    fn fc(data: &[u8]) -> CanFrame {
        CanFrame::new(RX, data).unwrap()
    }

    fn layer(mock: &Arc<MockTransport>) -> IsoTpLayer {
        IsoTpLayer::new(mock.clone(), IsoTpConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_frame_send() {
        let mock = Arc::new(MockTransport::new());
        layer(&mock).send(&[0x10, 0x03]).await.unwrap();

        let sent = mock.sent_on(TX);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data(), &[0x02, 0x10, 0x03, 0, 0, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_frame_send_after_clear_to_send() {
        let mock = Arc::new(MockTransport::with_responder(|frame| {
            if frame.data()[0] & 0xF0 == 0x10 {
                vec![fc(&[0x30, 0x00, 0x00])]
            } else {
                Vec::new()
            }
        }));

        let payload: Vec<u8> = (0..20).collect();
        layer(&mock).send(&payload).await.unwrap();

        let sent = mock.sent_on(TX);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].data()[..2], [0x10, 20]);
        assert_eq!(sent[1].data()[0], 0x21);
        assert_eq!(sent[2].data()[0], 0x22);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_flow_control_times_out() {
        let mock = Arc::new(MockTransport::new());
        let start = Instant::now();

        let err = layer(&mock).send(&[0u8; 10]).await.unwrap_err();

        assert!(matches!(err, IsoTpError::FlowControlTimeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(2000));
        // Only the first frame went out
        assert_eq!(mock.sent_on(TX).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_then_continue() {
        let mock = Arc::new(MockTransport::with_responder(|frame| {
            if frame.data()[0] & 0xF0 == 0x10 {
                vec![fc(&[0x31, 0, 0]), fc(&[0x31, 0, 0]), fc(&[0x30, 0, 0])]
            } else {
                Vec::new()
            }
        }));

        layer(&mock).send(&[7u8; 12]).await.unwrap();
        assert_eq!(mock.sent_on(TX).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_waits_abort() {
        let mock = Arc::new(MockTransport::with_responder(|frame| {
            if frame.data()[0] & 0xF0 == 0x10 {
                vec![fc(&[0x31, 0, 0]); 10]
            } else {
                Vec::new()
            }
        }));

        let err = layer(&mock).send(&[7u8; 12]).await.unwrap_err();
        assert!(matches!(
            err,
            IsoTpError::FlowControlRejected {
                status: FlowStatus::Wait
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_aborts_transfer() {
        let mock = Arc::new(MockTransport::with_responder(|frame| {
            if frame.data()[0] & 0xF0 == 0x10 {
                vec![fc(&[0x32, 0, 0])]
            } else {
                Vec::new()
            }
        }));

        let err = layer(&mock).send(&[7u8; 100]).await.unwrap_err();
        assert!(matches!(
            err,
            IsoTpError::FlowControlRejected {
                status: FlowStatus::Overflow
            }
        ));
        assert_eq!(mock.sent_on(TX).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_size_waits_for_each_block() {
        let mut consecutive = 0;
        let mock = Arc::new(MockTransport::with_responder(move |frame| {
            match frame.data()[0] & 0xF0 {
                0x10 => vec![fc(&[0x30, 0x02, 0x00])],
                0x20 => {
                    consecutive += 1;
                    if consecutive % 2 == 0 {
                        vec![fc(&[0x30, 0x02, 0x00])]
                    } else {
                        Vec::new()
                    }
                }
                _ => Vec::new(),
            }
        }));

        // FF + 5 CFs
        layer(&mock).send(&[1u8; 6 + 35]).await.unwrap();
        assert_eq!(mock.sent_on(TX).len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_st_min_spaces_consecutive_frames() {
        let mock = Arc::new(MockTransport::with_responder(|frame| {
            if frame.data()[0] & 0xF0 == 0x10 {
                vec![fc(&[0x30, 0x00, 0x0A])]
            } else {
                Vec::new()
            }
        }));

        let start = Instant::now();
        // FF + 3 CFs: two gaps between the CFs
        layer(&mock).send(&[1u8; 6 + 21]).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_multi_frame_sends_flow_control() {
        let mock = Arc::new(MockTransport::with_responder(|frame| {
            if frame.data()[0] == 0x30 {
                vec![
                    fc(&[0x21, 7, 8, 9, 10, 11, 12, 13]),
                    fc(&[0x22, 14, 0, 0, 0, 0, 0, 0]),
                ]
            } else {
                Vec::new()
            }
        }));
        mock.inject(fc(&[0x10, 14, 1, 2, 3, 4, 5, 6]));

        let message = layer(&mock)
            .receive(Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(message, (1..=14).collect::<Vec<u8>>());
        let sent = mock.sent_on(TX);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data()[..3], [0x30, 0x00, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_reports_stalled_reception() {
        let mock = Arc::new(MockTransport::new());
        mock.inject(fc(&[0x10, 20, 1, 2, 3, 4, 5, 6]));

        let err = layer(&mock)
            .receive(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, IsoTpError::ConsecutiveFrameTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_skips_other_identifiers() {
        let mock = Arc::new(MockTransport::new());
        mock.inject(CanFrame::new(0x123, &[0x02, 0xFF, 0xFF]).unwrap());
        mock.inject(fc(&[0x02, 0x50, 0x03]));

        let message = layer(&mock)
            .receive(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(message, vec![0x50, 0x03]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_when_silent() {
        let mock = Arc::new(MockTransport::new());
        let err = layer(&mock)
            .receive(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, IsoTpError::Timeout));
    }
}
