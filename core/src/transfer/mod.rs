// Transfer module — ordered command/response exchanges over one BLE link
//
// TaskQueue keeps at most one task in flight, FrameReassembler turns the
// notification stream into frames, and TransferEngine runs both against a
// Transport on a single worker task.

pub mod engine;
pub mod queue;
pub mod reassembler;
pub mod task;

use std::time::Duration;
use thiserror::Error;

use crate::codec::{CodecError, DecodeError, Frame};
use crate::transport::TransportError;

pub use engine::TransferEngine;
pub use queue::TaskQueue;
pub use reassembler::{FrameReassembler, Overflow, Reassembled};
pub use task::{Task, TaskHandle, TaskId, TaskOutcome, TaskState};

/// Why a task did not complete
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("Write failed: {0}")]
    WriteFailed(TransportError),

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(TransportError),

    #[error("Encode failed: {0}")]
    Encode(#[from] CodecError),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Session torn down")]
    SessionTornDown,

    #[error("Task queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("Receive stream desynchronised: {buffered} bytes buffered (limit {limit})")]
    BufferOverflow { buffered: usize, limit: usize },
}

/// Traffic that did not resolve a task, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A frame that was not the response to the in-flight task
    Unsolicited(Frame),
    /// Bytes the codec could not parse were discarded
    DecodeError(DecodeError),
    /// Leftover bytes exceeded the limit; the session has stopped
    Desynchronized { buffered: usize, limit: usize },
}
