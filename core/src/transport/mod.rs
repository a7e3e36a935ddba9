// Transport module — the BLE link as seen by the transfer engine
//
// Radio management (scan, connect, service discovery) lives outside this crate.
// The engine only needs two primitives from a connected link: write bytes to a
// characteristic, and receive notification chunks from another.

pub mod gatt;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use gatt::{
    uuid_from_short, GattCharacteristic, GattTunnels, CCCD_UUID, DEFAULT_RECV_UUID,
    DEFAULT_SEND_UUID, DEFAULT_SERVICE_UUID,
};

/// Raw bytes as delivered by one notification. No framing guarantees.
pub type RawChunk = Bytes;

/// Errors reported by a transport implementation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Transport error: {0}")]
    Io(String),
}

/// Entry point a transport uses to hand notification chunks to a session.
///
/// Cheap to clone. `deliver` never blocks, so it is safe to call from a
/// platform callback thread.
#[derive(Clone)]
pub struct ChunkSink {
    deliver: Arc<dyn Fn(RawChunk) -> bool + Send + Sync>,
}

impl ChunkSink {
    /// Wrap a delivery function. It returns `false` once the receiver is gone.
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(RawChunk) -> bool + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Deliver one chunk. Returns `false` if the session has been torn down,
    /// after which the transport should stop forwarding.
    pub fn deliver(&self, chunk: impl Into<RawChunk>) -> bool {
        (self.deliver)(chunk.into())
    }
}

impl fmt::Debug for ChunkSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSink").finish_non_exhaustive()
    }
}

/// A connected BLE link.
///
/// Implementations must preserve the order of writes and the order of
/// notification chunks within one connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one write to `characteristic` and report whether it succeeded
    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: Bytes,
    ) -> Result<(), TransportError>;

    /// Enable notifications on `characteristic` and forward every chunk to `sink`
    async fn subscribe_notify(
        &self,
        service: Uuid,
        characteristic: Uuid,
        sink: ChunkSink,
    ) -> Result<(), TransportError>;

    /// Stop forwarding notifications from `characteristic`
    async fn unsubscribe_notify(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;
}
