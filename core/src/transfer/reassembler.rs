/// Stream reassembly for notification chunks
///
/// BLE notifications carry no framing: one protocol frame may span several
/// chunks, and one chunk may carry several frames. The reassembler keeps the
/// unconsumed tail between chunks and asks the codec for complete frames.

use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tracing::trace;

use crate::codec::{DecodeError, Frame, ProtocolCodec};

/// Frames and skipped regions produced by one chunk
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reassembled {
    pub frames: Vec<Frame>,
    pub errors: Vec<DecodeError>,
}

/// Leftover bytes grew past the configured limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    pub buffered: usize,
    pub limit: usize,
}

pub struct FrameReassembler {
    codec: Arc<dyn ProtocolCodec>,
    buffer: BytesMut,
    max_buffered: usize,
}

impl FrameReassembler {
    pub fn new(codec: Arc<dyn ProtocolCodec>, max_buffered: usize) -> Self {
        Self {
            codec,
            buffer: BytesMut::with_capacity(max_buffered.min(4096)),
            max_buffered,
        }
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and extract every complete frame now available.
    ///
    /// Fails once the leftover exceeds the limit; the buffer is cleared in
    /// that case since the stream can no longer be trusted.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> Result<Reassembled, Overflow> {
        self.buffer.extend_from_slice(chunk);

        let fed = self.codec.feed(&self.buffer);
        self.buffer.advance(fed.consumed);

        trace!(
            codec = self.codec.name(),
            frames = fed.frames.len(),
            leftover = self.buffer.len(),
            "Chunk reassembled"
        );

        if self.buffer.len() > self.max_buffered {
            let overflow = Overflow {
                buffered: self.buffer.len(),
                limit: self.max_buffered,
            };
            self.buffer.clear();
            return Err(overflow);
        }

        Ok(Reassembled {
            frames: fed.frames,
            errors: fed.errors,
        })
    }

    /// Discard any partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
