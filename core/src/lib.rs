// ExDevice Core — BLE transfer engine for medical peripherals
#![allow(clippy::empty_line_after_doc_comments)]
//
// Turns a chunked notification stream and a fallible write primitive into
// ordered, correlated command/response exchanges, one in flight per device.
//
// Radio management is not in here. A front-end implements `Transport` for
// its BLE stack and opens a `DeviceSession` once a device is connected.

pub mod adapter;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod registry;
pub mod session;
pub mod transfer;
pub mod transport;

pub use adapter::{AdapterState, AdapterStateBus};
pub use catalog::{is_known_device, DeviceKind};
pub use codec::{
    BloodPressureCodec, BloodPressureReading, Command, CodecError, DecodeError, Decoded, Direction,
    Frame, FrameClass, GlucoseMeterCodec, GlucoseReading, ProtocolCodec,
};
pub use config::{ConfigError, EngineConfig};
pub use registry::{DeviceRegistry, RegistryError};
pub use session::{DeviceSession, SessionError};
pub use transfer::{
    EngineEvent, TaskHandle, TaskId, TaskOutcome, TaskState, TransferEngine, TransferError,
};
pub use transport::{ChunkSink, GattTunnels, RawChunk, Transport, TransportError};
