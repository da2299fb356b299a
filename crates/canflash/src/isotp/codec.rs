//! Segmentation and reassembly without I/O
//!
//! Both halves are plain state machines over 8-byte frames. The async
//! [`IsoTpLayer`](super::IsoTpLayer) drives them against a transport, and
//! simulated devices drive them directly from a frame callback.

use tracing::debug;

use super::pci::{Pci, CONSECUTIVE_FRAME, FIRST_FRAME, SINGLE_FRAME};
use super::{IsoTpError, CF_MAX_DATA, FF_MAX_DATA, MAX_PAYLOAD_LEN, SF_MAX_DATA};

/// Splits one payload into a Single Frame or a First Frame plus
/// Consecutive Frames
#[derive(Debug)]
pub struct Segmenter<'a> {
    payload: &'a [u8],
    offset: usize,
    sequence: u8,
    padding: u8,
}

impl<'a> Segmenter<'a> {
    pub fn new(payload: &'a [u8], padding: u8) -> Result<Self, IsoTpError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(IsoTpError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(Self {
            payload,
            offset: 0,
            sequence: 1,
            padding,
        })
    }

    pub fn is_single_frame(&self) -> bool {
        self.payload.len() <= SF_MAX_DATA
    }

    /// The opening frame: a complete SF, or the FF announcing the length
    pub fn first_frame(&mut self) -> [u8; 8] {
        let mut frame = [self.padding; 8];
        let len = self.payload.len();

        if self.is_single_frame() {
            frame[0] = SINGLE_FRAME | len as u8;
            frame[1..1 + len].copy_from_slice(self.payload);
            self.offset = len;
        } else {
            frame[0] = FIRST_FRAME | ((len >> 8) & 0x0F) as u8;
            frame[1] = (len & 0xFF) as u8;
            frame[2..].copy_from_slice(&self.payload[..FF_MAX_DATA]);
            self.offset = FF_MAX_DATA;
        }
        frame
    }

    /// Next consecutive frame, or `None` once everything is sent
    pub fn next_consecutive(&mut self) -> Option<[u8; 8]> {
        if self.is_complete() {
            return None;
        }

        let end = (self.offset + CF_MAX_DATA).min(self.payload.len());
        let chunk = &self.payload[self.offset..end];

        let mut frame = [self.padding; 8];
        frame[0] = CONSECUTIVE_FRAME | self.sequence;
        frame[1..1 + chunk.len()].copy_from_slice(chunk);

        self.offset = end;
        self.sequence = (self.sequence + 1) & 0x0F;
        Some(frame)
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.payload.len()
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }
}

/// Outcome of feeding one frame to a [`Reassembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxEvent {
    /// A whole message is available
    Complete(Vec<u8>),
    /// A First Frame started a message, or a block ended; send FC(CTS)
    FlowControlNeeded,
    /// Consecutive frame accepted, more to come
    Progress,
    /// Frame carries nothing for the receiver (FC, or CF while idle)
    Ignored,
}

#[derive(Debug)]
struct Partial {
    buffer: Vec<u8>,
    total_len: usize,
    next_sequence: u8,
    frames_in_block: u8,
}

/// Rebuilds messages from SF/FF/CF frames
#[derive(Debug)]
pub struct Reassembler {
    block_size: u8,
    max_len: usize,
    partial: Option<Partial>,
}

impl Reassembler {
    /// `block_size` is the value advertised in our own flow control frames
    pub fn new(block_size: u8, max_len: usize) -> Self {
        Self {
            block_size,
            max_len,
            partial: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.partial.is_none()
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<RxEvent, IsoTpError> {
        match Pci::parse(data)? {
            Pci::Single { data } => {
                if self.partial.take().is_some() {
                    debug!("Single frame aborted a multi-frame reception");
                }
                Ok(RxEvent::Complete(data.to_vec()))
            }
            Pci::First { total_len, data } => {
                if self.partial.take().is_some() {
                    debug!("First frame restarted a multi-frame reception");
                }
                if total_len > self.max_len {
                    return Err(IsoTpError::MessageTooLarge {
                        len: total_len,
                        max: self.max_len,
                    });
                }

                let mut buffer = Vec::with_capacity(total_len);
                buffer.extend_from_slice(data);
                self.partial = Some(Partial {
                    buffer,
                    total_len,
                    next_sequence: 1,
                    frames_in_block: 0,
                });
                Ok(RxEvent::FlowControlNeeded)
            }
            Pci::Consecutive { sequence, data } => {
                let Some(partial) = self.partial.as_mut() else {
                    return Ok(RxEvent::Ignored);
                };

                if sequence != partial.next_sequence {
                    let expected = partial.next_sequence;
                    self.partial = None;
                    return Err(IsoTpError::SequenceMismatch {
                        expected,
                        got: sequence,
                    });
                }

                let take = (partial.total_len - partial.buffer.len()).min(data.len());
                partial.buffer.extend_from_slice(&data[..take]);
                partial.next_sequence = (partial.next_sequence + 1) & 0x0F;

                if partial.buffer.len() == partial.total_len {
                    let message = self.partial.take().map(|p| p.buffer).unwrap_or_default();
                    return Ok(RxEvent::Complete(message));
                }

                partial.frames_in_block += 1;
                if self.block_size > 0 && partial.frames_in_block >= self.block_size {
                    partial.frames_in_block = 0;
                    return Ok(RxEvent::FlowControlNeeded);
                }
                Ok(RxEvent::Progress)
            }
            Pci::FlowControl(_) => Ok(RxEvent::Ignored),
        }
    }
}
