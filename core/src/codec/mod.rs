//! Device protocol codecs
//!
//! A [`ProtocolCodec`] knows how one device family frames its traffic: which
//! GATT tunnels to use, how to turn a [`Command`] into bytes, and how to pull
//! complete [`Frame`]s off the front of a byte buffer. Codecs hold no stream
//! state; partial bytes are buffered by the
//! [`FrameReassembler`](crate::transfer::FrameReassembler).

pub mod blood_pressure;
pub mod glucose;

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::transport::GattTunnels;

pub use blood_pressure::{BloodPressureCodec, BloodPressureReading};
pub use glucose::{GlucoseMeterCodec, GlucoseReading};

/// Which side of an exchange produced a frame, as marked on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Reply to a host command
    Response,
    /// Pushed by the device on its own (telemetry, status)
    Notification,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Response => write!(f, "Response"),
            Direction::Notification => write!(f, "Notification"),
        }
    }
}

/// One complete, checksum-verified protocol message from the device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    pub direction: Direction,
    pub opcode: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn response(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            direction: Direction::Response,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn notification(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            direction: Direction::Notification,
            opcode,
            payload: payload.into(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {{ opcode: 0x{:02x}, payload: {} }}",
            self.direction,
            self.opcode,
            hex::encode(&self.payload)
        )
    }
}

/// An outgoing host command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub payload: Bytes,
}

impl Command {
    pub fn new(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// A command with no payload
    pub fn bare(opcode: u8) -> Self {
        Self::new(opcode, Bytes::new())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command {{ opcode: 0x{:02x}, payload: {} }}",
            self.opcode,
            hex::encode(&self.payload)
        )
    }
}

/// How a frame relates to the command currently in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Response,
    Unsolicited,
}

/// Result of trying to extract one frame from the front of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame occupying the first `consumed` bytes
    Frame { frame: Frame, consumed: usize },
    /// The buffer holds the start of a frame but not all of it
    Incomplete,
    /// The front of the buffer cannot start a valid frame; drop `skip` bytes
    Malformed { skip: usize, reason: String },
}

/// Errors raised while encoding a command
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Opcode 0x{0:02x} is reserved")]
    ReservedOpcode(u8),
}

/// Bytes discarded while decoding, surfaced to observers instead of failing a task
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Decode error: {reason} ({discarded} bytes discarded)")]
pub struct DecodeError {
    pub discarded: usize,
    pub reason: String,
}

/// Output of [`ProtocolCodec::feed`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedResult {
    /// Frames in stream order
    pub frames: Vec<Frame>,
    /// Malformed regions skipped while resynchronising
    pub errors: Vec<DecodeError>,
    /// Bytes consumed from the input; the rest is leftover
    pub consumed: usize,
}

/// Per-device-family framing strategy
pub trait ProtocolCodec: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Service and characteristics for this device family
    fn tunnels(&self) -> GattTunnels {
        GattTunnels::default()
    }

    /// Minimum spacing between consecutive writes the firmware accepts
    fn send_interval(&self) -> Duration {
        Duration::ZERO
    }

    /// Serialise a command into the bytes written to the send tunnel
    fn encode(&self, command: &Command) -> Result<Bytes, CodecError>;

    /// Try to extract one frame from the front of `buf`. Must not panic on any input.
    fn decode(&self, buf: &[u8]) -> Decoded;

    /// Decode as many frames as possible from `buf`.
    ///
    /// Malformed regions are skipped and reported; decoding stops at the first
    /// incomplete frame, and `buf[consumed..]` is the leftover.
    fn feed(&self, buf: &[u8]) -> FeedResult {
        let mut result = FeedResult::default();
        while result.consumed < buf.len() {
            let rest = &buf[result.consumed..];
            match self.decode(rest) {
                Decoded::Frame { frame, consumed } => {
                    result.frames.push(frame);
                    result.consumed += consumed.clamp(1, rest.len());
                }
                Decoded::Incomplete => break,
                Decoded::Malformed { skip, reason } => {
                    let skip = skip.clamp(1, rest.len());
                    result.errors.push(DecodeError {
                        discarded: skip,
                        reason,
                    });
                    result.consumed += skip;
                }
            }
        }
        result
    }

    /// Decide whether `frame` answers `command`.
    ///
    /// The default matches a response-marked frame carrying the command's opcode.
    fn classify(&self, command: &Command, frame: &Frame) -> FrameClass {
        if frame.direction == Direction::Response && frame.opcode == command.opcode {
            FrameClass::Response
        } else {
            FrameClass::Unsolicited
        }
    }
}

/// Offset of the next `marker` byte after position 0, or the whole buffer if none
pub(crate) fn skip_to_marker(buf: &[u8], marker: u8) -> usize {
    buf.iter()
        .skip(1)
        .position(|&b| b == marker)
        .map(|pos| pos + 1)
        .unwrap_or(buf.len())
}
