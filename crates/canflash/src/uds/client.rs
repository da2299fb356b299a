//! UDS client for the reprogramming services

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::{routine_sub_function, service_id, NegativeResponseCode, UdsError};
use crate::config::UdsClientConfig;
use crate::isotp::{IsoTpError, IsoTpLayer};

/// How one received message relates to the outstanding request
enum Reply {
    Positive,
    Pending,
    Negative {
        nrc: NegativeResponseCode,
        data: Vec<u8>,
    },
    Unrelated,
}

fn classify(sid: u8, response: &[u8]) -> Result<Reply, UdsError> {
    match response.first() {
        None => Err(UdsError::InvalidResponse("empty response".to_string())),
        Some(&service_id::NEGATIVE_RESPONSE) => {
            if response.len() < 3 {
                return Err(UdsError::InvalidResponse(
                    "Negative response too short".to_string(),
                ));
            }
            if response[1] != sid {
                return Ok(Reply::Unrelated);
            }
            let nrc = NegativeResponseCode::from(response[2]);
            if nrc.is_response_pending() {
                Ok(Reply::Pending)
            } else {
                Ok(Reply::Negative {
                    nrc,
                    data: response[3..].to_vec(),
                })
            }
        }
        Some(&first) if first == sid.wrapping_add(service_id::POSITIVE_RESPONSE_OFFSET) => {
            Ok(Reply::Positive)
        }
        Some(_) => Ok(Reply::Unrelated),
    }
}

/// Request/response client on top of an [`IsoTpLayer`]
///
/// One request is outstanding at a time; the client keeps no state between
/// requests.
#[derive(Clone)]
pub struct UdsClient {
    isotp: IsoTpLayer,
    config: UdsClientConfig,
}

impl UdsClient {
    pub fn new(isotp: IsoTpLayer, config: UdsClientConfig) -> Self {
        Self { isotp, config }
    }

    pub fn isotp(&self) -> &IsoTpLayer {
        &self.isotp
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Send a request with the configured default timeout
    pub async fn request(&self, request: &[u8]) -> Result<Vec<u8>, UdsError> {
        self.request_with_timeout(request, self.config.timeout())
            .await
    }

    /// Send a request and wait for its positive response
    ///
    /// Each "response pending" reply restarts the `timeout` window, up to
    /// the configured overall pending limit. The request itself is sent
    /// exactly once.
    #[instrument(level = "debug", skip(self, request), fields(sid = format!("0x{:02X}", request.first().copied().unwrap_or_default())))]
    pub async fn request_with_timeout(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, UdsError> {
        let Some(&sid) = request.first() else {
            return Err(UdsError::InvalidResponse(
                "cannot send an empty request".to_string(),
            ));
        };

        self.isotp.send(request).await?;

        let started = Instant::now();
        let mut deadline = started + timeout;
        loop {
            let response = match self.isotp.receive_until(deadline).await {
                Ok(response) => response,
                Err(IsoTpError::Timeout) => {
                    return Err(UdsError::Timeout {
                        service_id: sid,
                        waited: timeout,
                    })
                }
                Err(
                    e @ (IsoTpError::InvalidPci(_)
                    | IsoTpError::MalformedFrame(_)
                    | IsoTpError::SequenceMismatch { .. }),
                ) => {
                    debug!(error = %e, "Dropping unusable frame, still waiting");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match classify(sid, &response)? {
                Reply::Positive => {
                    debug!(len = response.len(), "Positive response");
                    return Ok(response);
                }
                Reply::Pending => {
                    let waited = started.elapsed();
                    if waited > self.config.pending_limit() {
                        return Err(UdsError::PendingLimitExceeded {
                            service_id: sid,
                            waited,
                        });
                    }
                    debug!("Response pending, extending deadline");
                    deadline = Instant::now() + timeout;
                }
                Reply::Negative { nrc, data } => {
                    return Err(UdsError::NegativeResponse {
                        service_id: sid,
                        nrc,
                        data,
                    });
                }
                Reply::Unrelated => {
                    warn!(
                        response = %hex::encode_upper(&response),
                        "Ignoring response that does not belong to the request"
                    );
                }
            }
        }
    }

    /// DiagnosticSessionControl (0x10)
    pub async fn diagnostic_session_control(&self, session: u8) -> Result<Vec<u8>, UdsError> {
        self.request(&[service_id::DIAGNOSTIC_SESSION_CONTROL, session])
            .await
    }

    /// RoutineControl (0x31) start routine
    pub async fn routine_control_start(
        &self,
        routine_id: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, UdsError> {
        let [hi, lo] = routine_id.to_be_bytes();
        let request = [
            service_id::ROUTINE_CONTROL,
            routine_sub_function::START_ROUTINE,
            hi,
            lo,
        ];
        self.request_with_timeout(&request, timeout).await
    }

    /// RequestDownload (0x34) announcing image size and CRC-32, both little-endian
    pub async fn request_download(&self, size: u32, crc32: u32) -> Result<Vec<u8>, UdsError> {
        let mut request = Vec::with_capacity(9);
        request.push(service_id::REQUEST_DOWNLOAD);
        request.extend_from_slice(&size.to_le_bytes());
        request.extend_from_slice(&crc32.to_le_bytes());
        self.request(&request).await
    }

    /// TransferData (0x36)
    pub async fn transfer_data(&self, sequence: u8, chunk: &[u8]) -> Result<Vec<u8>, UdsError> {
        let mut request = Vec::with_capacity(chunk.len() + 2);
        request.push(service_id::TRANSFER_DATA);
        request.push(sequence);
        request.extend_from_slice(chunk);

        let response = self.request(&request).await?;
        if let Some(&echoed) = response.get(1) {
            if echoed != sequence {
                return Err(UdsError::InvalidResponse(format!(
                    "TransferData acknowledged block {} instead of {}",
                    echoed, sequence
                )));
            }
        }
        Ok(response)
    }

    /// RequestTransferExit (0x37)
    pub async fn request_transfer_exit(&self) -> Result<Vec<u8>, UdsError> {
        self.request(&[service_id::REQUEST_TRANSFER_EXIT]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsoTpConfig;
    use crate::frame::CanFrame;
    use crate::transport::MockTransport;
    use std::sync::Arc;

    fn reply(bytes: &[u8]) -> CanFrame {
        let mut data = [0u8; 8];
        data[0] = bytes.len() as u8;
        data[1..1 + bytes.len()].copy_from_slice(bytes);
        CanFrame::full(0x7E8, data).unwrap()
    }

    fn client(mock: &Arc<MockTransport>) -> UdsClient {
        UdsClient::new(
            IsoTpLayer::new(mock.clone(), IsoTpConfig::default()),
            UdsClientConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_positive_response() {
        let mock = Arc::new(MockTransport::with_responder(|_| vec![reply(&[0x50, 0x03])]));

        let response = client(&mock).diagnostic_session_control(0x03).await.unwrap();

        assert_eq!(response, vec![0x50, 0x03]);
        assert_eq!(
            mock.sent_on(0x7E0)[0].data(),
            &[0x02, 0x10, 0x03, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_responses_end_in_success_without_resend() {
        let mock = Arc::new(MockTransport::with_responder(|_| {
            vec![
                reply(&[0x7F, 0x31, 0x78]),
                reply(&[0x7F, 0x31, 0x78]),
                reply(&[0x71, 0x01, 0xFF, 0x00]),
            ]
        }));

        let response = client(&mock)
            .routine_control_start(0xFF00, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(response, vec![0x71, 0x01, 0xFF, 0x00]);
        assert_eq!(mock.sent_frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_extends_past_nominal_timeout() {
        let mock = Arc::new(MockTransport::new());
        let device = mock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            device.inject(reply(&[0x7F, 0x37, 0x78]));
            tokio::time::sleep(Duration::from_millis(2500)).await;
            device.inject(reply(&[0x77]));
        });

        let start = Instant::now();
        let response = client(&mock).request_transfer_exit().await.unwrap();

        assert_eq!(response, vec![0x77]);
        assert!(start.elapsed() >= Duration::from_millis(5000));
        assert_eq!(mock.sent_frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endless_pending_hits_limit() {
        let mock = Arc::new(MockTransport::new());
        let device = mock.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                device.inject(reply(&[0x7F, 0x31, 0x78]));
            }
        });

        let err = client(&mock)
            .routine_control_start(0xFF00, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, UdsError::PendingLimitExceeded { service_id: 0x31, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_response_keeps_diagnostic_bytes() {
        let mock = Arc::new(MockTransport::with_responder(|_| {
            vec![reply(&[0x7F, 0x37, 0x72, 0x78, 0x56, 0x34, 0x12])]
        }));

        let err = client(&mock).request_transfer_exit().await.unwrap_err();
        match err {
            UdsError::NegativeResponse {
                service_id,
                nrc,
                data,
            } => {
                assert_eq!(service_id, 0x37);
                assert_eq!(nrc, NegativeResponseCode::GeneralProgrammingFailure);
                assert_eq!(data, vec![0x78, 0x56, 0x34, 0x12]);
            }
            other => panic!("Expected NegativeResponse, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_for_other_service_is_ignored() {
        let mock = Arc::new(MockTransport::with_responder(|_| {
            vec![reply(&[0x7F, 0x22, 0x31]), reply(&[0x50, 0x02])]
        }));

        let response = client(&mock).diagnostic_session_control(0x02).await.unwrap();
        assert_eq!(response, vec![0x50, 0x02]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbled_frames_are_skipped() {
        let mock = Arc::new(MockTransport::with_responder(|frame| {
            if frame.data()[0] & 0xF0 == 0x30 {
                // Out of sequence after the first frame, then the real answer
                return vec![
                    CanFrame::new(0x7E8, &[0x23, 0, 0, 0, 0, 0, 0, 0]).unwrap(),
                    reply(&[0x50, 0x03]),
                ];
            }
            vec![
                CanFrame::new(0x7E8, &[0x45, 0x50, 0x03]).unwrap(),
                CanFrame::new(0x7E8, &[0x10, 0x0A, 0, 0, 0, 0, 0, 0]).unwrap(),
            ]
        }));

        let response = client(&mock).diagnostic_session_control(0x03).await.unwrap();
        assert_eq!(response, vec![0x50, 0x03]);
        // Request plus our flow control for the stray first frame
        assert_eq!(mock.sent_on(0x7E0).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let mock = Arc::new(MockTransport::new());
        let err = client(&mock).diagnostic_session_control(0x02).await.unwrap_err();
        assert!(matches!(err, UdsError::Timeout { service_id: 0x10, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_download_layout() {
        let mock = Arc::new(MockTransport::with_responder(|frame| match frame.data()[0] {
            0x10 => vec![CanFrame::new(0x7E8, &[0x30, 0x00, 0x00]).unwrap()],
            _ => vec![reply(&[0x74, 0x20, 0x10, 0x00])],
        }));

        client(&mock)
            .request_download(0x0000_0C00, 0x2144_DF1C)
            .await
            .unwrap();

        let sent = mock.sent_on(0x7E0);
        assert_eq!(sent[0].data(), &[0x10, 0x09, 0x34, 0x00, 0x0C, 0x00, 0x00, 0x1C]);
        assert_eq!(sent[1].data(), &[0x21, 0xDF, 0x44, 0x21, 0x00, 0x00, 0x00, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_data_checks_echoed_block() {
        let mock = Arc::new(MockTransport::with_responder(|_| vec![reply(&[0x76, 0x02])]));
        let err = client(&mock).transfer_data(0x01, &[0xAA; 4]).await.unwrap_err();
        assert!(matches!(err, UdsError::InvalidResponse(_)));
    }
}
