//! Protocol control information of the four ISO-TP frame types

use std::time::Duration;

use super::{IsoTpError, FF_MAX_DATA, SF_MAX_DATA};

pub const SINGLE_FRAME: u8 = 0x00;
pub const FIRST_FRAME: u8 = 0x10;
pub const CONSECUTIVE_FRAME: u8 = 0x20;
pub const FLOW_CONTROL: u8 = 0x30;

/// Separation time used for reserved STmin encodings
const RESERVED_ST_MIN: Duration = Duration::from_millis(100);

/// Flow status nibble of a flow control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

impl FlowStatus {
    pub fn from_nibble(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ContinueToSend),
            1 => Some(Self::Wait),
            2 => Some(Self::Overflow),
            _ => None,
        }
    }

    pub fn nibble(self) -> u8 {
        match self {
            Self::ContinueToSend => 0,
            Self::Wait => 1,
            Self::Overflow => 2,
        }
    }
}

/// Raw STmin byte as carried in a flow control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StMin(pub u8);

impl StMin {
    /// Minimum gap between consecutive frames
    ///
    /// 0x00-0x7F are milliseconds, 0xF1-0xF9 are 100-900 microseconds.
    /// Everything else is reserved and treated as the longest legal value.
    pub fn duration(self) -> Duration {
        match self.0 {
            ms @ 0x00..=0x7F => Duration::from_millis(ms as u64),
            us @ 0xF1..=0xF9 => Duration::from_micros((us - 0xF0) as u64 * 100),
            _ => RESERVED_ST_MIN,
        }
    }
}

/// Decoded flow control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    pub status: FlowStatus,
    pub block_size: u8,
    pub st_min: StMin,
}

impl FlowControl {
    pub fn continue_to_send(block_size: u8, st_min: u8) -> Self {
        Self {
            status: FlowStatus::ContinueToSend,
            block_size,
            st_min: StMin(st_min),
        }
    }

    pub fn overflow() -> Self {
        Self {
            status: FlowStatus::Overflow,
            block_size: 0,
            st_min: StMin(0),
        }
    }

    pub fn encode(&self, padding: u8) -> [u8; 8] {
        let mut data = [padding; 8];
        data[0] = FLOW_CONTROL | self.status.nibble();
        data[1] = self.block_size;
        data[2] = self.st_min.0;
        data
    }
}

/// One ISO-TP frame, borrowing its payload from the CAN data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pci<'a> {
    Single { data: &'a [u8] },
    First { total_len: usize, data: &'a [u8] },
    Consecutive { sequence: u8, data: &'a [u8] },
    FlowControl(FlowControl),
}

impl<'a> Pci<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, IsoTpError> {
        let Some(&pci) = data.first() else {
            return Err(IsoTpError::MalformedFrame("empty frame".into()));
        };

        match pci & 0xF0 {
            SINGLE_FRAME => {
                let len = (pci & 0x0F) as usize;
                if len > SF_MAX_DATA || len > data.len() - 1 {
                    return Err(IsoTpError::MalformedFrame(format!(
                        "single frame length {} with {} data bytes",
                        len,
                        data.len() - 1
                    )));
                }
                Ok(Self::Single {
                    data: &data[1..1 + len],
                })
            }
            FIRST_FRAME => {
                if data.len() < 8 {
                    return Err(IsoTpError::MalformedFrame(format!(
                        "first frame with DLC {}",
                        data.len()
                    )));
                }
                let total_len = (((pci & 0x0F) as usize) << 8) | data[1] as usize;
                if total_len <= SF_MAX_DATA {
                    return Err(IsoTpError::MalformedFrame(format!(
                        "first frame announcing only {} bytes",
                        total_len
                    )));
                }
                Ok(Self::First {
                    total_len,
                    data: &data[2..2 + FF_MAX_DATA],
                })
            }
            CONSECUTIVE_FRAME => Ok(Self::Consecutive {
                sequence: pci & 0x0F,
                data: &data[1..],
            }),
            FLOW_CONTROL => {
                if data.len() < 3 {
                    return Err(IsoTpError::MalformedFrame(format!(
                        "flow control with DLC {}",
                        data.len()
                    )));
                }
                let status = FlowStatus::from_nibble(pci & 0x0F).ok_or_else(|| {
                    IsoTpError::MalformedFrame(format!("flow status {}", pci & 0x0F))
                })?;
                Ok(Self::FlowControl(FlowControl {
                    status,
                    block_size: data[1],
                    st_min: StMin(data[2]),
                }))
            }
            _ => Err(IsoTpError::InvalidPci(pci)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_st_min_decoding() {
        assert_eq!(StMin(0x00).duration(), Duration::ZERO);
        assert_eq!(StMin(0x0A).duration(), Duration::from_millis(10));
        assert_eq!(StMin(0x7F).duration(), Duration::from_millis(127));
        assert_eq!(StMin(0xF1).duration(), Duration::from_micros(100));
        assert_eq!(StMin(0xF9).duration(), Duration::from_micros(900));
        // Reserved ranges
        assert_eq!(StMin(0x80).duration(), Duration::from_millis(100));
        assert_eq!(StMin(0xF0).duration(), Duration::from_millis(100));
        assert_eq!(StMin(0xFA).duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_parse_single_frame_ignores_padding() {
        let frame = [0x03, 0x50, 0x02, 0x00, 0xAA, 0xAA, 0xAA, 0xAA];
        assert_eq!(
            Pci::parse(&frame).unwrap(),
            Pci::Single {
                data: &[0x50, 0x02, 0x00]
            }
        );
    }

    #[test]
    fn test_parse_single_frame_length_beyond_dlc() {
        assert!(matches!(
            Pci::parse(&[0x05, 0x01, 0x02]),
            Err(IsoTpError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_parse_first_frame_length() {
        let frame = [0x1F, 0xFF, 1, 2, 3, 4, 5, 6];
        match Pci::parse(&frame).unwrap() {
            Pci::First { total_len, data } => {
                assert_eq!(total_len, 4095);
                assert_eq!(data, &[1, 2, 3, 4, 5, 6]);
            }
            other => panic!("Expected first frame, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_flow_control() {
        let fc = Pci::parse(&[0x30, 0x08, 0xF3]).unwrap();
        assert_eq!(
            fc,
            Pci::FlowControl(FlowControl {
                status: FlowStatus::ContinueToSend,
                block_size: 8,
                st_min: StMin(0xF3),
            })
        );

        assert!(Pci::parse(&[0x33, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_reserved_frame_type_is_rejected() {
        assert!(matches!(
            Pci::parse(&[0x40, 0x00]),
            Err(IsoTpError::InvalidPci(0x40))
        ));
    }

    #[test]
    fn test_encode_flow_control() {
        assert_eq!(
            FlowControl::continue_to_send(0, 0).encode(0xCC),
            [0x30, 0x00, 0x00, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]
        );
        assert_eq!(FlowControl::overflow().encode(0x00)[0], 0x32);
    }
}
