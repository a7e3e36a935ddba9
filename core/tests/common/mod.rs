// Shared fixtures: a scripted BLE link standing in for a real device

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use exdevice_core::{ChunkSink, Transport, TransportError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// What the fake link does with the next write
pub enum Reply {
    /// Acknowledge and stay silent
    Silent,
    /// Acknowledge, then push these chunks through the notify tunnel
    Chunks(Vec<Bytes>),
    /// Reject the write
    Fail(TransportError),
}

#[derive(Default)]
struct State {
    sink: Option<ChunkSink>,
    writes: Vec<Bytes>,
    script: VecDeque<Reply>,
    subscribe_error: Option<TransportError>,
    unsubscribed: bool,
}

/// In-memory transport. Clones share one link.
#[derive(Clone, Default)]
pub struct FakeLink {
    state: Arc<Mutex<State>>,
}

impl FakeLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_subscribe(error: TransportError) -> Self {
        let link = Self::new();
        link.state.lock().subscribe_error = Some(error);
        link
    }

    /// Queue the link's behaviour for the next unscripted write
    pub fn script(&self, reply: Reply) {
        self.state.lock().script.push_back(reply);
    }

    /// Push a notification chunk as if the device had sent it
    pub fn notify(&self, chunk: impl Into<Bytes>) -> bool {
        let sink = self.state.lock().sink.clone();
        match sink {
            Some(sink) => sink.deliver(chunk.into()),
            None => false,
        }
    }

    pub fn writes(&self) -> Vec<Bytes> {
        self.state.lock().writes.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        let state = self.state.lock();
        state.sink.is_some() && !state.unsubscribed
    }
}

#[async_trait]
impl Transport for FakeLink {
    async fn write(&self, _service: Uuid, _characteristic: Uuid, data: Bytes) -> Result<(), TransportError> {
        let (reply, sink) = {
            let mut state = self.state.lock();
            state.writes.push(data);
            (state.script.pop_front().unwrap_or(Reply::Silent), state.sink.clone())
        };

        match reply {
            Reply::Silent => Ok(()),
            Reply::Fail(error) => Err(error),
            Reply::Chunks(chunks) => {
                if let Some(sink) = sink {
                    for chunk in chunks {
                        sink.deliver(chunk);
                    }
                }
                Ok(())
            }
        }
    }

    async fn subscribe_notify(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        sink: ChunkSink,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if let Some(error) = state.subscribe_error.clone() {
            return Err(error);
        }
        state.sink = Some(sink);
        Ok(())
    }

    async fn unsubscribe_notify(&self, _service: Uuid, _characteristic: Uuid) -> Result<(), TransportError> {
        self.state.lock().unsubscribed = true;
        Ok(())
    }
}
