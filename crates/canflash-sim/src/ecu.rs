//! Simulated UDS ECU
//!
//! The application accepts the jump into the bootloader only after the
//! pre-programming check ran in the extended session. The bootloader then
//! takes a download (`34`), erases (`31 01 FF 00`), stores blocks (`36`) and
//! verifies the CRC on transfer exit (`37`).
//!
//! ISO-TP is handled on the device side with the same segmenter and
//! reassembler the host uses.

use canflash::config::IsoTpConfig;
use canflash::frame::CanFrame;
use canflash::image::{CRC32, WRITE_ALIGNMENT};
use canflash::isotp::{
    FlowControl, FlowStatus, IsoTpError, Pci, Reassembler, RxEvent, Segmenter, MAX_PAYLOAD_LEN,
};
use canflash::uds::{routine_sub_function, service_id, session_type};
use tracing::{debug, info, warn};

use crate::uds::{negative_response, negative_response_with_data, nrc, positive_response};
use crate::SimDevice;

/// Routine id of both the pre-programming check and the erase
pub const FLASH_ROUTINE: u16 = 0xFF00;

/// Misbehaviour to inject into a run
#[derive(Debug, Clone, Default)]
pub struct UdsFaults {
    /// Response-pending frames sent before the erase completes
    pub erase_pending: u32,
    /// Flip a bit of the computed CRC on transfer exit
    pub corrupt_crc: bool,
    /// Power up in the bootloader instead of the application
    pub start_in_bootloader: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcuMode {
    Application,
    Bootloader,
}

#[derive(Debug)]
struct DownloadState {
    total_size: u32,
    crc32: u32,
    buffer: Vec<u8>,
    expected_block: u8,
    erased: bool,
}

/// A long response waiting for the host's flow control
#[derive(Debug)]
struct PendingReply {
    payload: Vec<u8>,
    consecutive_sent: usize,
}

/// Application plus bootloader of one ECU
pub struct UdsEcu {
    rx_id: u32,
    tx_id: u32,
    padding: u8,
    block_size: u8,
    st_min: u8,
    max_size: u32,
    faults: UdsFaults,

    mode: EcuMode,
    session: u8,
    pre_checked: bool,
    download: Option<DownloadState>,
    flashed: Option<Vec<u8>>,

    reassembler: Reassembler,
    pending_reply: Option<PendingReply>,
}

impl UdsEcu {
    /// Device addressed with the host's ISO-TP settings, so it listens on
    /// the host's `tx_id` and answers on its `rx_id`
    pub fn new(isotp: &IsoTpConfig, max_size: u32) -> Self {
        Self::with_faults(isotp, max_size, UdsFaults::default())
    }

    pub fn with_faults(isotp: &IsoTpConfig, max_size: u32, faults: UdsFaults) -> Self {
        let mode = if faults.start_in_bootloader {
            EcuMode::Bootloader
        } else {
            EcuMode::Application
        };
        Self {
            rx_id: isotp.tx_id,
            tx_id: isotp.rx_id,
            padding: isotp.padding,
            block_size: 0,
            st_min: 0,
            max_size,
            faults,
            mode,
            session: session_type::DEFAULT,
            pre_checked: false,
            download: None,
            flashed: None,
            reassembler: Reassembler::new(0, MAX_PAYLOAD_LEN),
            pending_reply: None,
        }
    }

    /// Block size and raw STmin advertised in our flow control frames
    pub fn with_flow_control(mut self, block_size: u8, st_min: u8) -> Self {
        self.block_size = block_size;
        self.st_min = st_min;
        self.reassembler = Reassembler::new(block_size, MAX_PAYLOAD_LEN);
        self
    }

    pub fn mode(&self) -> EcuMode {
        self.mode
    }

    pub fn session(&self) -> u8 {
        self.session
    }

    /// Application image written by the last successful download
    pub fn flashed(&self) -> Option<&[u8]> {
        self.flashed.as_deref()
    }

    /// Handle one complete UDS request. Returns every response in order;
    /// all but the last are response-pending.
    pub fn process_request(&mut self, request: &[u8]) -> Vec<Vec<u8>> {
        let Some(&sid) = request.first() else {
            return vec![negative_response(0x00, nrc::INCORRECT_MESSAGE_LENGTH)];
        };

        let response = match (self.mode, sid) {
            (_, service_id::DIAGNOSTIC_SESSION_CONTROL) => self.handle_session_control(request),
            (EcuMode::Application, service_id::ROUTINE_CONTROL) => {
                self.handle_pre_programming_check(request)
            }
            (EcuMode::Bootloader, service_id::ROUTINE_CONTROL) => {
                return self.handle_erase(request);
            }
            (EcuMode::Bootloader, service_id::REQUEST_DOWNLOAD) => {
                self.handle_request_download(request)
            }
            (EcuMode::Bootloader, service_id::TRANSFER_DATA) => self.handle_transfer_data(request),
            (EcuMode::Bootloader, service_id::REQUEST_TRANSFER_EXIT) => {
                self.handle_request_transfer_exit()
            }
            _ => {
                debug!(
                    service_id = format!("0x{:02X}", sid),
                    mode = ?self.mode,
                    "Unsupported service"
                );
                negative_response(sid, nrc::SERVICE_NOT_SUPPORTED)
            }
        };
        vec![response]
    }

    fn handle_session_control(&mut self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::DIAGNOSTIC_SESSION_CONTROL;
        if request.len() != 2 {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        }

        let session = request[1];
        info!(
            session = format!("0x{:02X}", session),
            mode = ?self.mode,
            "Session control request"
        );

        match (self.mode, session) {
            (_, session_type::DEFAULT) => {
                self.session = session;
                self.pre_checked = false;
                positive_response(sid, &[session])
            }
            (_, session_type::EXTENDED) => {
                self.session = session;
                positive_response(sid, &[session])
            }
            (EcuMode::Application, session_type::PROGRAMMING) => {
                if !self.pre_checked {
                    debug!("Programming session denied: pre-programming check not run");
                    return negative_response(sid, nrc::CONDITIONS_NOT_CORRECT);
                }
                info!("Resetting into bootloader");
                self.mode = EcuMode::Bootloader;
                self.session = session_type::DEFAULT;
                self.pre_checked = false;
                positive_response(sid, &[session])
            }
            (EcuMode::Bootloader, session_type::PROGRAMMING) => {
                self.session = session;
                positive_response(sid, &[session])
            }
            _ => negative_response(sid, nrc::SUB_FUNCTION_NOT_SUPPORTED),
        }
    }

    /// Parse `31 01 rid_hi rid_lo`
    fn routine_request(request: &[u8]) -> Result<u16, u8> {
        if request.len() != 4 {
            return Err(nrc::INCORRECT_MESSAGE_LENGTH);
        }
        if request[1] != routine_sub_function::START_ROUTINE {
            return Err(nrc::SUB_FUNCTION_NOT_SUPPORTED);
        }
        let routine_id = u16::from_be_bytes([request[2], request[3]]);
        if routine_id != FLASH_ROUTINE {
            return Err(nrc::REQUEST_OUT_OF_RANGE);
        }
        Ok(routine_id)
    }

    fn handle_pre_programming_check(&mut self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::ROUTINE_CONTROL;
        let routine_id = match Self::routine_request(request) {
            Ok(id) => id,
            Err(code) => return negative_response(sid, code),
        };
        if self.session != session_type::EXTENDED {
            debug!(
                session = format!("0x{:02X}", self.session),
                "Pre-programming check denied: requires extended session"
            );
            return negative_response(sid, nrc::CONDITIONS_NOT_CORRECT);
        }

        info!("Pre-programming conditions satisfied");
        self.pre_checked = true;
        let [hi, lo] = routine_id.to_be_bytes();
        positive_response(sid, &[routine_sub_function::START_ROUTINE, hi, lo])
    }

    fn handle_erase(&mut self, request: &[u8]) -> Vec<Vec<u8>> {
        let sid = service_id::ROUTINE_CONTROL;
        let routine_id = match Self::routine_request(request) {
            Ok(id) => id,
            Err(code) => return vec![negative_response(sid, code)],
        };
        let Some(download) = self.download.as_mut() else {
            debug!("Erase denied: no download requested");
            return vec![negative_response(sid, nrc::REQUEST_SEQUENCE_ERROR)];
        };

        info!(
            size = download.total_size,
            pending = self.faults.erase_pending,
            "Erasing application area"
        );
        download.erased = true;

        let mut responses: Vec<Vec<u8>> = (0..self.faults.erase_pending)
            .map(|_| negative_response(sid, nrc::RESPONSE_PENDING))
            .collect();
        let [hi, lo] = routine_id.to_be_bytes();
        responses.push(positive_response(
            sid,
            &[routine_sub_function::START_ROUTINE, hi, lo],
        ));
        responses
    }

    fn handle_request_download(&mut self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::REQUEST_DOWNLOAD;
        if request.len() != 9 {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        if self.session != session_type::PROGRAMMING {
            debug!("Download denied: requires programming session");
            return negative_response(sid, nrc::CONDITIONS_NOT_CORRECT);
        }

        let total_size = u32::from_le_bytes([request[1], request[2], request[3], request[4]]);
        let crc32 = u32::from_le_bytes([request[5], request[6], request[7], request[8]]);
        if total_size == 0
            || total_size > self.max_size
            || total_size as usize % WRITE_ALIGNMENT != 0
        {
            warn!(size = total_size, max = self.max_size, "Rejecting image size");
            return negative_response(sid, nrc::UPLOAD_DOWNLOAD_NOT_ACCEPTED);
        }

        info!(
            size = total_size,
            crc32 = format!("0x{:08X}", crc32),
            "RequestDownload: initiating download"
        );
        self.download = Some(DownloadState {
            total_size,
            crc32,
            buffer: Vec::with_capacity(total_size as usize),
            expected_block: 1,
            erased: false,
        });

        // lengthFormatIdentifier, then maxNumberOfBlockLength (SID + counter + data)
        let max_block = (MAX_PAYLOAD_LEN as u16).to_be_bytes();
        positive_response(sid, &[0x20, max_block[0], max_block[1]])
    }

    fn handle_transfer_data(&mut self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::TRANSFER_DATA;
        if request.len() < 3 {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        let block_counter = request[1];
        let data = &request[2..];

        let Some(download) = self.download.as_mut().filter(|d| d.erased) else {
            return negative_response(sid, nrc::REQUEST_SEQUENCE_ERROR);
        };

        if block_counter != download.expected_block {
            debug!(
                expected = download.expected_block,
                received = block_counter,
                "TransferData: wrong block sequence counter"
            );
            return negative_response(sid, nrc::WRONG_BLOCK_SEQUENCE_COUNTER);
        }
        if download.buffer.len() + data.len() > download.total_size as usize {
            debug!(
                received = download.buffer.len(),
                data_len = data.len(),
                total = download.total_size,
                "TransferData: data exceeds announced size"
            );
            return negative_response(sid, nrc::UPLOAD_DOWNLOAD_NOT_ACCEPTED);
        }

        download.buffer.extend_from_slice(data);
        download.expected_block = download.expected_block.wrapping_add(1);
        debug!(
            block = block_counter,
            bytes = data.len(),
            total_received = download.buffer.len(),
            total_expected = download.total_size,
            "TransferData: block stored"
        );

        positive_response(sid, &[block_counter])
    }

    fn handle_request_transfer_exit(&mut self) -> Vec<u8> {
        let sid = service_id::REQUEST_TRANSFER_EXIT;
        let Some(download) = self.download.take() else {
            debug!("RequestTransferExit denied: no active transfer");
            return negative_response(sid, nrc::REQUEST_SEQUENCE_ERROR);
        };

        let mut crc = CRC32.checksum(&download.buffer);
        if self.faults.corrupt_crc {
            crc ^= 1;
        }

        let complete = download.buffer.len() == download.total_size as usize;
        if !complete || crc != download.crc32 {
            warn!(
                received = download.buffer.len(),
                expected = download.total_size,
                host_crc = format!("0x{:08X}", download.crc32),
                device_crc = format!("0x{:08X}", crc),
                "Image rejected"
            );
            return negative_response_with_data(
                sid,
                nrc::GENERAL_PROGRAMMING_FAILURE,
                &crc.to_le_bytes(),
            );
        }

        info!(
            size = download.total_size,
            crc32 = format!("0x{:08X}", crc),
            "Image verified, starting application"
        );
        self.flashed = Some(download.buffer);
        self.mode = EcuMode::Application;
        self.session = session_type::DEFAULT;

        let mut data = crc.to_le_bytes().to_vec();
        data.extend_from_slice(&download.total_size.to_le_bytes());
        positive_response(sid, &data)
    }

    fn frame(&self, data: [u8; 8]) -> Option<CanFrame> {
        match CanFrame::full(self.tx_id, data) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "Cannot build reply frame");
                None
            }
        }
    }

    /// Segment one response. A long response sends its First Frame now and
    /// the rest once the host's flow control arrives.
    fn send(&mut self, response: Vec<u8>) -> Vec<CanFrame> {
        let mut segmenter = match Segmenter::new(&response, self.padding) {
            Ok(segmenter) => segmenter,
            Err(e) => {
                warn!(error = %e, "Response cannot be segmented");
                return Vec::new();
            }
        };
        let first = segmenter.first_frame();
        let single = segmenter.is_single_frame();

        if !single {
            self.pending_reply = Some(PendingReply {
                payload: response,
                consecutive_sent: 0,
            });
        }
        self.frame(first).into_iter().collect()
    }

    fn continue_reply(&mut self, fc: FlowControl) -> Vec<CanFrame> {
        let Some(mut pending) = self.pending_reply.take() else {
            debug!("Flow control without a pending response, ignored");
            return Vec::new();
        };

        match fc.status {
            FlowStatus::ContinueToSend => {}
            FlowStatus::Wait => {
                self.pending_reply = Some(pending);
                return Vec::new();
            }
            FlowStatus::Overflow => {
                warn!("Host overflowed, response dropped");
                return Vec::new();
            }
        }

        let mut data = Vec::new();
        let complete = match Segmenter::new(&pending.payload, self.padding) {
            Ok(mut segmenter) => {
                segmenter.first_frame();
                for _ in 0..pending.consecutive_sent {
                    segmenter.next_consecutive();
                }
                let limit = match fc.block_size {
                    0 => usize::MAX,
                    n => n as usize,
                };
                while data.len() < limit {
                    match segmenter.next_consecutive() {
                        Some(frame) => data.push(frame),
                        None => break,
                    }
                }
                segmenter.is_complete()
            }
            Err(_) => true,
        };

        pending.consecutive_sent += data.len();
        if !complete {
            self.pending_reply = Some(pending);
        }
        data.into_iter().filter_map(|d| self.frame(d)).collect()
    }
}

impl SimDevice for UdsEcu {
    fn name(&self) -> &'static str {
        "uds-ecu"
    }

    fn on_frame(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        if frame.id() != self.rx_id {
            return Vec::new();
        }

        if let Ok(Pci::FlowControl(fc)) = Pci::parse(frame.data()) {
            return self.continue_reply(fc);
        }

        match self.reassembler.feed(frame.data()) {
            Ok(RxEvent::Complete(request)) => {
                debug!(request = %hex::encode(&request), "Received UDS request");
                self.process_request(&request)
                    .into_iter()
                    .flat_map(|response| {
                        debug!(response = %hex::encode(&response), "Sending UDS response");
                        self.send(response)
                    })
                    .collect()
            }
            Ok(RxEvent::FlowControlNeeded) => {
                let fc = FlowControl::continue_to_send(self.block_size, self.st_min);
                self.frame(fc.encode(self.padding)).into_iter().collect()
            }
            Ok(RxEvent::Progress) | Ok(RxEvent::Ignored) => Vec::new(),
            Err(IsoTpError::MessageTooLarge { len, max }) => {
                warn!(len, max, "Request too large, sending overflow");
                self.frame(FlowControl::overflow().encode(self.padding))
                    .into_iter()
                    .collect()
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed ISO-TP frame");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ecu() -> UdsEcu {
        UdsEcu::new(&IsoTpConfig::default(), 1024)
    }

    fn bootloader(faults: UdsFaults) -> UdsEcu {
        let mut ecu = UdsEcu::with_faults(
            &IsoTpConfig::default(),
            1024,
            UdsFaults {
                start_in_bootloader: true,
                ..faults
            },
        );
        ecu.process_request(&[0x10, 0x02]);
        ecu
    }

    fn download_request(size: u32, crc: u32) -> Vec<u8> {
        let mut request = vec![0x34];
        request.extend_from_slice(&size.to_le_bytes());
        request.extend_from_slice(&crc.to_le_bytes());
        request
    }

    #[test]
    fn test_programming_requires_pre_check() {
        let mut ecu = ecu();

        assert_eq!(ecu.process_request(&[0x10, 0x02]), vec![vec![0x7F, 0x10, 0x22]]);
        assert_eq!(ecu.process_request(&[0x31, 0x01, 0xFF, 0x00]), vec![vec![0x7F, 0x31, 0x22]]);
        assert_eq!(ecu.process_request(&[0x10, 0x03]), vec![vec![0x50, 0x03]]);
        assert_eq!(
            ecu.process_request(&[0x31, 0x01, 0xFF, 0x00]),
            vec![vec![0x71, 0x01, 0xFF, 0x00]]
        );
        assert_eq!(ecu.process_request(&[0x10, 0x02]), vec![vec![0x50, 0x02]]);
        assert_eq!(ecu.mode(), EcuMode::Bootloader);
    }

    #[test]
    fn test_download_services_unsupported_in_application() {
        let mut ecu = ecu();
        assert_eq!(
            ecu.process_request(&download_request(4, 0)),
            vec![vec![0x7F, 0x34, 0x11]]
        );
    }

    #[test]
    fn test_erase_sends_pending_first() {
        let mut ecu = bootloader(UdsFaults {
            erase_pending: 2,
            ..Default::default()
        });
        ecu.process_request(&download_request(4, 0));

        let responses = ecu.process_request(&[0x31, 0x01, 0xFF, 0x00]);
        assert_eq!(
            responses,
            vec![
                vec![0x7F, 0x31, 0x78],
                vec![0x7F, 0x31, 0x78],
                vec![0x71, 0x01, 0xFF, 0x00]
            ]
        );
    }

    #[test]
    fn test_wrong_block_counter_rejected() {
        let mut ecu = bootloader(UdsFaults::default());
        ecu.process_request(&download_request(8, 0));
        ecu.process_request(&[0x31, 0x01, 0xFF, 0x00]);

        assert_eq!(
            ecu.process_request(&[0x36, 0x02, 0, 0, 0, 0]),
            vec![vec![0x7F, 0x36, 0x73]]
        );
        assert_eq!(ecu.process_request(&[0x36, 0x01, 0, 0, 0, 0]), vec![vec![0x76, 0x01]]);
    }

    #[test]
    fn test_transfer_before_erase_is_sequence_error() {
        let mut ecu = bootloader(UdsFaults::default());
        ecu.process_request(&download_request(4, 0));
        assert_eq!(
            ecu.process_request(&[0x36, 0x01, 0, 0, 0, 0]),
            vec![vec![0x7F, 0x36, 0x24]]
        );
    }

    #[test]
    fn test_transfer_exit_reports_device_crc() {
        let mut ecu = bootloader(UdsFaults::default());
        ecu.process_request(&download_request(4, 0x1234_5678));
        ecu.process_request(&[0x31, 0x01, 0xFF, 0x00]);
        ecu.process_request(&[0x36, 0x01, 0, 0, 0, 0]);

        let responses = ecu.process_request(&[0x37]);
        assert_eq!(responses, vec![vec![0x7F, 0x37, 0x72, 0x1C, 0xDF, 0x44, 0x21]]);
        assert!(ecu.flashed().is_none());
    }

    #[test]
    fn test_long_response_waits_for_flow_control() {
        let mut ecu = bootloader(UdsFaults::default());
        ecu.process_request(&download_request(4, 0x2144_DF1C));
        ecu.process_request(&[0x31, 0x01, 0xFF, 0x00]);
        ecu.process_request(&[0x36, 0x01, 0, 0, 0, 0]);

        // 37 arrives as a single frame; the 9-byte reply needs FF + CF
        let first = ecu.on_frame(&CanFrame::new(0x7E0, &[0x01, 0x37]).unwrap());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id(), 0x7E8);
        assert_eq!(&first[0].data()[..3], &[0x10, 0x09, 0x77]);

        let rest = ecu.on_frame(&CanFrame::new(0x7E0, &[0x30, 0x00, 0x00]).unwrap());
        assert_eq!(rest.len(), 1);
        assert_eq!(&first[0].data()[3..], &[0x1C, 0xDF, 0x44, 0x21, 0x04]);
        assert_eq!(&rest[0].data()[..4], &[0x21, 0x00, 0x00, 0x00]);
        assert_eq!(ecu.flashed(), Some(&[0u8; 4][..]));
    }

    #[test]
    fn test_first_frame_answered_with_flow_control() {
        let mut ecu = bootloader(UdsFaults::default()).with_flow_control(4, 0x0A);
        let fc = ecu.on_frame(&CanFrame::new(0x7E0, &[0x10, 0x0A, 0x36, 0x01, 0, 0, 0, 0]).unwrap());
        assert_eq!(fc[0].data(), &[0x30, 0x04, 0x0A, 0, 0, 0, 0, 0]);
    }
}
