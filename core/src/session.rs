// Device session — one connected device, one codec, one transfer engine
//
// A session is opened once the radio layer reports a connection. It subscribes
// to the codec's receive tunnel, routes every notification chunk into its
// engine and exposes the caller surface: submit, send_raw, unsolicited events
// and close.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::codec::{Command, ProtocolCodec};
use crate::config::{ConfigError, EngineConfig};
use crate::transfer::{EngineEvent, TaskHandle, TransferEngine};
use crate::transport::{Transport, TransportError};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Notify subscription failed: {0}")]
    SubscribeFailed(TransportError),

    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Session closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

// ============================================================================
// SESSION
// ============================================================================

pub struct DeviceSession {
    address: String,
    codec: Arc<dyn ProtocolCodec>,
    transport: Arc<dyn Transport>,
    engine: TransferEngine,
    closed: Mutex<bool>,
}

impl DeviceSession {
    /// Start the engine and subscribe to the receive tunnel.
    ///
    /// A subscription failure is fatal: the engine is torn down and no task
    /// is ever processed.
    pub async fn open(
        address: impl Into<String>,
        codec: Arc<dyn ProtocolCodec>,
        transport: Arc<dyn Transport>,
        config: &EngineConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let address = address.into();
        let tunnels = codec.tunnels();

        let engine = TransferEngine::start(
            address.clone(),
            Arc::clone(&codec),
            Arc::clone(&transport),
            config,
        );

        if let Err(e) = transport
            .subscribe_notify(tunnels.service, tunnels.recv, engine.chunk_sink())
            .await
        {
            warn!(%address, "Notify subscription failed: {}", e);
            engine.teardown().await;
            return Err(SessionError::SubscribeFailed(e));
        }

        info!(%address, codec = codec.name(), %tunnels, "Device session opened");
        Ok(Self {
            address,
            codec,
            transport,
            engine,
            closed: Mutex::new(false),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn codec(&self) -> &Arc<dyn ProtocolCodec> {
        &self.codec
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock() || !self.engine.is_running()
    }

    /// Queue a command. Never blocks; the handle resolves exactly once.
    pub fn submit(&self, command: Command) -> TaskHandle {
        self.engine.submit(command)
    }

    /// Queue a command with its own response deadline
    pub fn submit_with_timeout(&self, command: Command, timeout: Duration) -> TaskHandle {
        self.engine.submit_with_timeout(command, timeout)
    }

    /// Write bytes straight to the send tunnel, bypassing the queue.
    ///
    /// Unordered with respect to queued tasks: a raw write while a task is in
    /// flight may provoke a frame the task mistakes for its response.
    pub async fn send_raw(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let tunnels = self.codec.tunnels();
        self.transport
            .write(tunnels.service, tunnels.send, data.into())
            .await
            .map_err(SessionError::Transport)
    }

    /// Unsolicited frames, decode errors and desynchronisation, in arrival order.
    ///
    /// Each receiver buffers up to `event_capacity` events. One that lags
    /// further behind gets `RecvError::Lagged(n)` and those `n` events are
    /// lost to it; the engine never waits for slow subscribers.
    pub fn subscribe_unsolicited(&self) -> broadcast::Receiver<EngineEvent> {
        self.engine.subscribe_events()
    }

    /// Cancel every pending task, then release the receive tunnel.
    ///
    /// Returns how many tasks were cancelled. Calling again is a no-op.
    pub async fn close(&self) -> usize {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return 0;
            }
            *closed = true;
        }

        let cancelled = self.engine.teardown().await;
        let tunnels = self.codec.tunnels();
        if let Err(e) = self
            .transport
            .unsubscribe_notify(tunnels.service, tunnels.recv)
            .await
        {
            // The link is usually already gone by now.
            warn!(address = %self.address, "Unsubscribe failed: {}", e);
        }
        info!(address = %self.address, cancelled, "Device session closed");
        cancelled
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.address)
            .field("codec", &self.codec.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::glucose::{opcode, GlucoseMeterCodec};
    use crate::codec::Frame;
    use crate::transfer::{TaskOutcome, TransferError};
    use crate::transport::{ChunkSink, MockTransport, DEFAULT_RECV_UUID, DEFAULT_SEND_UUID};
    use tokio::sync::broadcast::error::RecvError;

    fn glucose() -> Arc<dyn ProtocolCodec> {
        Arc::new(GlucoseMeterCodec)
    }

    /// Mock that accepts a subscription and keeps the sink for the test
    fn subscribed_mock(sink_slot: Arc<Mutex<Option<ChunkSink>>>) -> MockTransport {
        let mut transport = MockTransport::new();
        transport
            .expect_subscribe_notify()
            .withf(|_, characteristic, _| *characteristic == DEFAULT_RECV_UUID)
            .times(1)
            .returning(move |_, _, sink| {
                *sink_slot.lock() = Some(sink);
                Ok(())
            });
        transport
    }

    #[tokio::test]
    async fn test_open_fails_when_subscribe_fails() {
        let mut transport = MockTransport::new();
        transport
            .expect_subscribe_notify()
            .returning(|_, _, _| Err(TransportError::SubscribeFailed("cccd".into())));
        transport.expect_write().never();

        let result = DeviceSession::open(
            "AA:BB",
            glucose(),
            Arc::new(transport),
            &EngineConfig::default(),
        )
        .await;
        assert_eq!(
            result.err(),
            Some(SessionError::SubscribeFailed(TransportError::SubscribeFailed(
                "cccd".into()
            )))
        );
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let transport = MockTransport::new();
        let result = DeviceSession::open(
            "AA:BB",
            glucose(),
            Arc::new(transport),
            &EngineConfig::default().with_max_pending_tasks(0),
        )
        .await;
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_send_raw_bypasses_queue() {
        let slot = Arc::new(Mutex::new(None));
        let mut transport = subscribed_mock(Arc::clone(&slot));
        transport
            .expect_write()
            .withf(|_, characteristic, data| *characteristic == DEFAULT_SEND_UUID && data[..] == [0x01])
            .times(1)
            .returning(|_, _, _| Ok(()));

        let session = DeviceSession::open("AA:BB", glucose(), Arc::new(transport), &EngineConfig::default())
            .await
            .expect("open");
        session.send_raw(vec![0x01]).await.expect("raw write");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_cancels() {
        let slot = Arc::new(Mutex::new(None));
        let mut transport = subscribed_mock(Arc::clone(&slot));
        transport.expect_write().returning(|_, _, _| Ok(()));
        transport
            .expect_unsubscribe_notify()
            .times(1)
            .returning(|_, _| Ok(()));

        let session = DeviceSession::open("AA:BB", glucose(), Arc::new(transport), &EngineConfig::default())
            .await
            .expect("open");
        let handle = session.submit(GlucoseMeterCodec::device_info());

        assert_eq!(session.close().await, 1);
        assert_eq!(session.close().await, 0);
        assert!(session.is_closed());
        assert_eq!(
            handle.await,
            TaskOutcome::Cancelled(TransferError::SessionTornDown)
        );
        assert_eq!(session.send_raw(vec![0x00]).await, Err(SessionError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_route_to_engine() {
        let slot = Arc::new(Mutex::new(None));
        let mut transport = subscribed_mock(Arc::clone(&slot));
        transport.expect_write().returning(|_, _, _| Ok(()));

        let session = DeviceSession::open("AA:BB", glucose(), Arc::new(transport), &EngineConfig::default())
            .await
            .expect("open");
        let mut events = session.subscribe_unsolicited();
        let sink = slot.lock().clone().expect("subscribed");

        let status = Frame::notification(opcode::STATUS, vec![0x00]);
        sink.deliver(GlucoseMeterCodec::frame_bytes(&status));
        assert_eq!(
            events.recv().await.expect("event"),
            EngineEvent::Unsolicited(status)
        );

        let handle = session.submit(GlucoseMeterCodec::record_count());
        let reply = Frame::response(opcode::RECORD_COUNT, vec![0x02, 0x00]);
        sink.deliver(GlucoseMeterCodec::frame_bytes(&reply));
        assert_eq!(handle.await, TaskOutcome::Completed(reply));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_subscriber_loses_oldest_events() {
        let slot = Arc::new(Mutex::new(None));
        let transport = subscribed_mock(Arc::clone(&slot));
        let config = EngineConfig {
            event_capacity: 2,
            ..EngineConfig::default()
        };

        let session = DeviceSession::open("AA:BB", glucose(), Arc::new(transport), &config)
            .await
            .expect("open");
        let mut events = session.subscribe_unsolicited();
        let sink = slot.lock().clone().expect("subscribed");

        let statuses: Vec<_> = (0..5u8)
            .map(|n| Frame::notification(opcode::STATUS, vec![n]))
            .collect();
        for status in &statuses {
            sink.deliver(GlucoseMeterCodec::frame_bytes(status));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(events.recv().await, Err(RecvError::Lagged(3)));
        assert_eq!(
            events.recv().await.expect("event"),
            EngineEvent::Unsolicited(statuses[3].clone())
        );
        assert_eq!(
            events.recv().await.expect("event"),
            EngineEvent::Unsolicited(statuses[4].clone())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_tasks() {
        let slot = Arc::new(Mutex::new(None));
        let mut transport = subscribed_mock(Arc::clone(&slot));
        transport.expect_write().returning(|_, _, _| Ok(()));

        let session = DeviceSession::open("AA:BB", glucose(), Arc::new(transport), &EngineConfig::default())
            .await
            .expect("open");
        let handle = session.submit(GlucoseMeterCodec::device_info());
        drop(session);

        assert_eq!(
            handle.await,
            TaskOutcome::Cancelled(TransferError::SessionTornDown)
        );
    }
}
