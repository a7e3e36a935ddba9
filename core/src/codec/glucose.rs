/// Codec for the Wei Ce glucose meter (advertises as `SKG_VGM55`)
///
/// Wire layout, both directions:
///
/// ```text
/// +------+-----+--------+-------------------+-----+
/// | 0x5A | len | opcode | payload[len - 1]  | sum |
/// +------+-----+--------+-------------------+-----+
/// ```
///
/// `sum` is the low byte of `len + opcode + payload`. Bit 7 of the opcode is
/// set on replies to a host command; pushed measurements leave it clear.

use bytes::Bytes;

use super::{skip_to_marker, CodecError, Command, Decoded, Direction, Frame, ProtocolCodec};

/// Start-of-frame marker
pub const START_BYTE: u8 = 0x5A;

/// Opcode bit marking a response
pub const RESPONSE_FLAG: u8 = 0x80;

/// Largest payload that fits the one-byte length field
pub const MAX_PAYLOAD: usize = u8::MAX as usize - 1;

pub mod opcode {
    /// Read model and firmware version
    pub const DEVICE_INFO: u8 = 0x01;
    /// Set the meter clock
    pub const SYNC_TIME: u8 = 0x02;
    /// Number of stored records
    pub const RECORD_COUNT: u8 = 0x03;
    /// Read one stored record by index
    pub const READ_RECORD: u8 = 0x04;
    /// Pushed when a strip measurement finishes
    pub const MEASUREMENT: u8 = 0x21;
    /// Pushed on strip insert/remove and error conditions
    pub const STATUS: u8 = 0x22;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GlucoseMeterCodec;

impl GlucoseMeterCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn device_info() -> Command {
        Command::bare(opcode::DEVICE_INFO)
    }

    pub fn record_count() -> Command {
        Command::bare(opcode::RECORD_COUNT)
    }

    pub fn read_record(index: u16) -> Command {
        Command::new(opcode::READ_RECORD, index.to_le_bytes().to_vec())
    }

    /// `year` is the full year; the meter stores it as an offset from 2000
    pub fn sync_time(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Command {
        let year = year.saturating_sub(2000).min(u8::MAX as u16) as u8;
        Command::new(
            opcode::SYNC_TIME,
            vec![year, month, day, hour, minute, second],
        )
    }

    /// Serialise a device-originated frame, as the meter would send it.
    ///
    /// Payload bytes beyond [`MAX_PAYLOAD`] do not fit the length field and are dropped.
    pub fn frame_bytes(frame: &Frame) -> Bytes {
        let raw = match frame.direction {
            Direction::Response => frame.opcode | RESPONSE_FLAG,
            Direction::Notification => frame.opcode & !RESPONSE_FLAG,
        };
        pack(raw, &frame.payload).into()
    }
}

fn checksum(len: u8, raw_opcode: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(len.wrapping_add(raw_opcode), |acc, b| acc.wrapping_add(*b))
}

fn pack(raw_opcode: u8, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(MAX_PAYLOAD)];
    let len = (payload.len() + 1) as u8;
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(START_BYTE);
    out.push(len);
    out.push(raw_opcode);
    out.extend_from_slice(payload);
    out.push(checksum(len, raw_opcode, payload));
    out
}

impl ProtocolCodec for GlucoseMeterCodec {
    fn name(&self) -> &'static str {
        "wei-ce-glucose"
    }

    fn encode(&self, command: &Command) -> Result<Bytes, CodecError> {
        if command.opcode & RESPONSE_FLAG != 0 {
            return Err(CodecError::ReservedOpcode(command.opcode));
        }
        if command.payload.len() > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge {
                len: command.payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(pack(command.opcode, &command.payload).into())
    }

    fn decode(&self, buf: &[u8]) -> Decoded {
        match buf.first() {
            None => return Decoded::Incomplete,
            Some(&START_BYTE) => {}
            Some(_) => {
                return Decoded::Malformed {
                    skip: skip_to_marker(buf, START_BYTE),
                    reason: "missing start byte".to_string(),
                }
            }
        }
        let Some(&len) = buf.get(1) else {
            return Decoded::Incomplete;
        };
        if len == 0 {
            return Decoded::Malformed {
                skip: 1,
                reason: "zero length field".to_string(),
            };
        }

        let total = len as usize + 3;
        if buf.len() < total {
            return Decoded::Incomplete;
        }

        let raw_opcode = buf[2];
        let payload = &buf[3..total - 1];
        if checksum(len, raw_opcode, payload) != buf[total - 1] {
            return Decoded::Malformed {
                skip: 1,
                reason: format!("checksum mismatch for opcode 0x{:02x}", raw_opcode),
            };
        }

        let direction = if raw_opcode & RESPONSE_FLAG != 0 {
            Direction::Response
        } else {
            Direction::Notification
        };
        Decoded::Frame {
            frame: Frame {
                direction,
                opcode: raw_opcode & !RESPONSE_FLAG,
                payload: Bytes::copy_from_slice(payload),
            },
            consumed: total,
        }
    }
}

/// One blood glucose result, pushed after a measurement or read back from memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlucoseReading {
    pub mg_dl: u16,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl GlucoseReading {
    const PAYLOAD_LEN: usize = 8;

    /// Parse a measurement notification or a `READ_RECORD` response
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let carries_reading = matches!(
            (frame.direction, frame.opcode),
            (Direction::Notification, opcode::MEASUREMENT)
                | (Direction::Response, opcode::READ_RECORD)
        );
        if !carries_reading || frame.payload.len() < Self::PAYLOAD_LEN {
            return None;
        }
        let p = &frame.payload;
        Some(Self {
            mg_dl: u16::from_le_bytes([p[0], p[1]]),
            year: 2000 + p[2] as u16,
            month: p[3],
            day: p[4],
            hour: p[5],
            minute: p[6],
            second: p[7],
        })
    }

    pub fn mmol_per_l(&self) -> f32 {
        self.mg_dl as f32 / 18.0
    }
}
