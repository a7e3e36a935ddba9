/// Codec for the AOJ blood pressure monitor (advertises as `SKG_AOJ-30B`)
///
/// Wire layout, both directions:
///
/// ```text
/// +------+------+------+--------+-----+----------------+-----+
/// | 0xAA | 0x55 | kind | opcode | len | payload[len]   | xor |
/// +------+------+------+--------+-----+----------------+-----+
/// ```
///
/// `kind` is 0x01 for host commands, 0x02 for responses and 0x03 for
/// notifications. `xor` covers `kind` through the last payload byte.

use bytes::Bytes;
use std::time::Duration;

use super::{skip_to_marker, CodecError, Command, Decoded, Direction, Frame, ProtocolCodec};

pub const SYNC: [u8; 2] = [0xAA, 0x55];

pub const KIND_COMMAND: u8 = 0x01;
pub const KIND_RESPONSE: u8 = 0x02;
pub const KIND_NOTIFICATION: u8 = 0x03;

pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Minimum spacing between writes accepted by the AOJ firmware
pub const SEND_INTERVAL: Duration = Duration::from_millis(500);

const HEADER_LEN: usize = 5;

pub mod opcode {
    pub const START_MEASUREMENT: u8 = 0x01;
    pub const STOP_MEASUREMENT: u8 = 0x02;
    pub const DEVICE_INFO: u8 = 0x03;
    pub const READ_HISTORY: u8 = 0x04;
    /// Cuff pressure while inflating, pushed several times a second
    pub const LIVE_PRESSURE: u8 = 0x11;
    /// Final measurement
    pub const RESULT: u8 = 0x12;
    /// Measurement aborted; payload is the device error code
    pub const ERROR: u8 = 0x13;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BloodPressureCodec;

impl BloodPressureCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn start_measurement() -> Command {
        Command::bare(opcode::START_MEASUREMENT)
    }

    pub fn stop_measurement() -> Command {
        Command::bare(opcode::STOP_MEASUREMENT)
    }

    pub fn device_info() -> Command {
        Command::bare(opcode::DEVICE_INFO)
    }

    pub fn read_history(user: u8) -> Command {
        Command::new(opcode::READ_HISTORY, vec![user])
    }

    /// Serialise a device-originated frame, as the monitor would send it.
    ///
    /// Payload bytes beyond [`MAX_PAYLOAD`] are dropped.
    pub fn frame_bytes(frame: &Frame) -> Bytes {
        let kind = match frame.direction {
            Direction::Response => KIND_RESPONSE,
            Direction::Notification => KIND_NOTIFICATION,
        };
        pack(kind, frame.opcode, &frame.payload).into()
    }
}

fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

fn pack(kind: u8, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(MAX_PAYLOAD)];
    let mut out = Vec::with_capacity(payload.len() + HEADER_LEN + 1);
    out.extend_from_slice(&SYNC);
    out.push(kind);
    out.push(opcode);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    let check = xor(&out[2..]);
    out.push(check);
    out
}

impl ProtocolCodec for BloodPressureCodec {
    fn name(&self) -> &'static str {
        "aoj-blood-pressure"
    }

    fn send_interval(&self) -> Duration {
        SEND_INTERVAL
    }

    fn encode(&self, command: &Command) -> Result<Bytes, CodecError> {
        if command.payload.len() > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge {
                len: command.payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(pack(KIND_COMMAND, command.opcode, &command.payload).into())
    }

    fn decode(&self, buf: &[u8]) -> Decoded {
        match buf.first() {
            None => return Decoded::Incomplete,
            Some(&b) if b == SYNC[0] => {}
            Some(_) => {
                return Decoded::Malformed {
                    skip: skip_to_marker(buf, SYNC[0]),
                    reason: "missing sync".to_string(),
                }
            }
        }
        match buf.get(1) {
            None => return Decoded::Incomplete,
            Some(&b) if b == SYNC[1] => {}
            Some(_) => {
                return Decoded::Malformed {
                    skip: 1,
                    reason: "broken sync pair".to_string(),
                }
            }
        }
        if buf.len() < HEADER_LEN {
            return Decoded::Incomplete;
        }

        let direction = match buf[2] {
            KIND_RESPONSE => Direction::Response,
            KIND_NOTIFICATION => Direction::Notification,
            other => {
                return Decoded::Malformed {
                    skip: 1,
                    reason: format!("unexpected frame kind 0x{:02x}", other),
                }
            }
        };

        let total = HEADER_LEN + buf[4] as usize + 1;
        if buf.len() < total {
            return Decoded::Incomplete;
        }
        if xor(&buf[2..total - 1]) != buf[total - 1] {
            return Decoded::Malformed {
                skip: 1,
                reason: format!("xor mismatch for opcode 0x{:02x}", buf[3]),
            };
        }

        Decoded::Frame {
            frame: Frame {
                direction,
                opcode: buf[3],
                payload: Bytes::copy_from_slice(&buf[HEADER_LEN..total - 1]),
            },
            consumed: total,
        }
    }
}

/// Completed blood pressure measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloodPressureReading {
    pub systolic: u16,
    pub diastolic: u16,
    pub pulse: u8,
}

impl BloodPressureReading {
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        if frame.direction != Direction::Notification
            || frame.opcode != opcode::RESULT
            || frame.payload.len() < 5
        {
            return None;
        }
        let p = &frame.payload;
        Some(Self {
            systolic: u16::from_le_bytes([p[0], p[1]]),
            diastolic: u16::from_le_bytes([p[2], p[3]]),
            pulse: p[4],
        })
    }

    /// Cuff pressure in mmHg from a live pressure notification
    pub fn live_pressure(frame: &Frame) -> Option<u16> {
        if frame.direction != Direction::Notification
            || frame.opcode != opcode::LIVE_PRESSURE
            || frame.payload.len() < 2
        {
            return None;
        }
        Some(u16::from_le_bytes([frame.payload[0], frame.payload[1]]))
    }
}
