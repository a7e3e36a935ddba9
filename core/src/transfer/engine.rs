// Transfer engine — the per-session worker that owns the queue and the reassembler
//
// All state changes happen on one spawned task, fed by a single command
// channel: caller submissions, notification chunks from the transport, write
// completions and teardown. Deadlines are checked in the same select loop, so
// a timeout and a matching frame can never both resolve a task.

use bytes::Bytes;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument};

use super::queue::TaskQueue;
use super::reassembler::FrameReassembler;
use super::task::{Task, TaskHandle, TaskId, TaskOutcome};
use super::{EngineEvent, TransferError};
use crate::codec::{Command, Frame, FrameClass, ProtocolCodec};
use crate::config::EngineConfig;
use crate::transport::{ChunkSink, RawChunk, Transport, TransportError};

/// Messages processed by the engine worker
#[derive(Debug)]
enum EngineCommand {
    Submit(Task),
    Chunk(RawChunk),
    WriteDone {
        task: TaskId,
        result: Result<(), TransportError>,
    },
    Teardown {
        done: Option<oneshot::Sender<usize>>,
    },
}

/// Where the active slot is in its exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No active task
    Idle,
    /// Next task held back by the codec's send interval
    Pacing { until: Instant },
    /// Write issued, waiting for the transport to acknowledge it
    Writing { deadline: Instant },
    /// Write acknowledged, waiting for the response frame
    AwaitingResponse { deadline: Instant },
}

impl Phase {
    fn timer(&self) -> Option<Instant> {
        match *self {
            Phase::Idle => None,
            Phase::Pacing { until } => Some(until),
            Phase::Writing { deadline } | Phase::AwaitingResponse { deadline } => Some(deadline),
        }
    }

    fn expects_response(&self) -> bool {
        matches!(self, Phase::Writing { .. } | Phase::AwaitingResponse { .. })
    }
}

/// Handle to a running transfer engine.
///
/// Dropping the handle tears the engine down without waiting.
pub struct TransferEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    next_id: AtomicU64,
    response_timeout: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransferEngine {
    /// Spawn the engine worker. Must be called from within a tokio runtime.
    pub fn start(
        label: impl Into<String>,
        codec: Arc<dyn ProtocolCodec>,
        transport: Arc<dyn Transport>,
        config: &EngineConfig,
    ) -> Self {
        let label = label.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let worker = EngineWorker {
            reassembler: FrameReassembler::new(Arc::clone(&codec), config.max_buffered_bytes),
            queue: TaskQueue::new(config.max_pending_tasks),
            codec,
            transport,
            events: events.clone(),
            commands: command_tx.clone(),
            write_timeout: config.write_timeout(),
            phase: Phase::Idle,
            last_write: None,
            write: None,
        };

        let span = tracing::info_span!("transfer", session = %label);
        let handle = tokio::spawn(worker.run(command_rx).instrument(span));

        Self {
            commands: command_tx,
            events,
            next_id: AtomicU64::new(1),
            response_timeout: config.response_timeout(),
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Queue a command with the configured response timeout. Never blocks.
    pub fn submit(&self, command: Command) -> TaskHandle {
        self.submit_with_timeout(command, self.response_timeout)
    }

    /// Queue a command with its own response timeout. Never blocks.
    ///
    /// If the engine has already stopped the handle resolves as cancelled.
    pub fn submit_with_timeout(&self, command: Command, timeout: Duration) -> TaskHandle {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (task, handle) = Task::new(id, command, timeout);
        if let Err(mpsc::error::SendError(EngineCommand::Submit(mut task))) =
            self.commands.send(EngineCommand::Submit(task))
        {
            task.resolve(TaskOutcome::Cancelled(TransferError::SessionTornDown));
        }
        handle
    }

    /// Sink the transport feeds notification chunks into
    pub fn chunk_sink(&self) -> ChunkSink {
        let commands = self.commands.clone();
        ChunkSink::new(move |chunk| commands.send(EngineCommand::Chunk(chunk)).is_ok())
    }

    /// Subscribe to unsolicited frames and decode errors.
    ///
    /// The channel holds `event_capacity` events. A receiver that falls
    /// further behind gets `RecvError::Lagged` and the skipped events are lost.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// False once the worker has stopped
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Cancel every pending task and stop the worker.
    ///
    /// When this returns every task has been resolved and no further events
    /// will be published. Returns how many tasks were cancelled.
    pub async fn teardown(&self) -> usize {
        let (done_tx, done_rx) = oneshot::channel();
        let cancelled = match self.commands.send(EngineCommand::Teardown {
            done: Some(done_tx),
        }) {
            Ok(()) => done_rx.await.unwrap_or(0),
            Err(_) => 0,
        };

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Transfer engine worker ended abnormally: {}", e);
            }
        }
        cancelled
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        let _ = self.commands.send(EngineCommand::Teardown { done: None });
    }
}

struct EngineWorker {
    codec: Arc<dyn ProtocolCodec>,
    transport: Arc<dyn Transport>,
    queue: TaskQueue,
    reassembler: FrameReassembler,
    events: broadcast::Sender<EngineEvent>,
    commands: mpsc::UnboundedSender<EngineCommand>,
    write_timeout: Duration,
    phase: Phase,
    last_write: Option<Instant>,
    /// Outstanding transport write for the active task
    write: Option<JoinHandle<()>>,
}

impl EngineWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
        info!(codec = self.codec.name(), "Transfer engine started");
        loop {
            let timer = self.phase.timer();
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown(TransferError::SessionTornDown);
                        break;
                    };
                    if self.handle(command).is_break() {
                        break;
                    }
                }

                _ = tokio::time::sleep_until(timer.unwrap_or_else(Instant::now)), if timer.is_some() => {
                    self.on_timer();
                }
            }
        }
    }

    fn handle(&mut self, command: EngineCommand) -> ControlFlow<()> {
        match command {
            EngineCommand::Submit(task) => {
                self.on_submit(task);
                ControlFlow::Continue(())
            }
            EngineCommand::Chunk(chunk) => self.on_chunk(chunk),
            EngineCommand::WriteDone { task, result } => {
                self.on_write_done(task, result);
                ControlFlow::Continue(())
            }
            EngineCommand::Teardown { done } => {
                let cancelled = self.shutdown(TransferError::SessionTornDown);
                if let Some(done) = done {
                    let _ = done.send(cancelled);
                }
                ControlFlow::Break(())
            }
        }
    }

    fn on_submit(&mut self, task: Task) {
        debug!(task = %task.id(), command = %task.command(), "Task queued");
        if let Err((mut task, error)) = self.queue.enqueue(task) {
            warn!(task = %task.id(), "Rejecting task: {}", error);
            task.resolve(TaskOutcome::Failed(error));
            return;
        }
        self.pump();
    }

    /// Start the next queued task if the link is free
    fn pump(&mut self) {
        while self.phase == Phase::Idle && self.queue.is_idle() && self.queue.has_pending() {
            let now = Instant::now();
            if let Some(last) = self.last_write {
                let until = last + self.codec.send_interval();
                if until > now {
                    trace!(wait = ?(until - now), "Pacing next write");
                    self.phase = Phase::Pacing { until };
                    return;
                }
            }

            let Some(task) = self.queue.advance() else {
                return;
            };
            let id = task.id();
            debug!(task = %id, command = %task.command(), "Task in flight");
            match self.codec.encode(task.command()) {
                Ok(bytes) => self.start_write(id, bytes, now),
                Err(e) => {
                    warn!(task = %id, "Cannot encode command: {}", e);
                    self.finish(TaskOutcome::Failed(TransferError::Encode(e)));
                }
            }
        }
    }

    fn start_write(&mut self, id: TaskId, bytes: Bytes, now: Instant) {
        let tunnels = self.codec.tunnels();
        trace!(task = %id, bytes = %hex::encode(&bytes), "Writing to send tunnel");

        let transport = Arc::clone(&self.transport);
        let commands = self.commands.clone();
        self.write = Some(tokio::spawn(async move {
            let result = transport.write(tunnels.service, tunnels.send, bytes).await;
            let _ = commands.send(EngineCommand::WriteDone { task: id, result });
        }));

        self.last_write = Some(now);
        self.phase = Phase::Writing {
            deadline: now + self.write_timeout,
        };
    }

    fn on_write_done(&mut self, id: TaskId, result: Result<(), TransportError>) {
        // The task may already be resolved by a response that beat the ack.
        if !matches!(self.phase, Phase::Writing { .. }) || self.queue.active_id() != Some(id) {
            trace!(task = %id, "Ignoring stale write completion");
            return;
        }
        self.write = None;

        match result {
            Ok(()) => {
                let now = Instant::now();
                if let Some(task) = self.queue.active_mut() {
                    let deadline = task.arm_deadline(now);
                    debug!(task = %id, timeout = ?task.timeout(), "Write acknowledged");
                    self.phase = Phase::AwaitingResponse { deadline };
                }
            }
            Err(e) => {
                warn!(task = %id, "Write failed: {}", e);
                self.finish(TaskOutcome::Failed(TransferError::WriteFailed(e)));
                self.pump();
            }
        }
    }

    fn on_chunk(&mut self, chunk: RawChunk) -> ControlFlow<()> {
        trace!(bytes = %hex::encode(&chunk), "Notification chunk");

        let reassembled = match self.reassembler.on_chunk(&chunk) {
            Ok(reassembled) => reassembled,
            Err(overflow) => {
                error!(
                    buffered = overflow.buffered,
                    limit = overflow.limit,
                    "Receive stream desynchronised, stopping session"
                );
                let _ = self.events.send(EngineEvent::Desynchronized {
                    buffered: overflow.buffered,
                    limit: overflow.limit,
                });
                self.shutdown(TransferError::BufferOverflow {
                    buffered: overflow.buffered,
                    limit: overflow.limit,
                });
                return ControlFlow::Break(());
            }
        };

        for error in reassembled.errors {
            warn!("{}", error);
            let _ = self.events.send(EngineEvent::DecodeError(error));
        }
        for frame in reassembled.frames {
            self.on_frame(frame);
        }
        self.pump();
        ControlFlow::Continue(())
    }

    fn on_frame(&mut self, frame: Frame) {
        let is_response = match self.queue.peek_active() {
            Some(task) if self.phase.expects_response() => {
                self.codec.classify(task.command(), &frame) == FrameClass::Response
            }
            _ => false,
        };

        if is_response {
            debug!(frame = %frame, "Task completed");
            self.finish(TaskOutcome::Completed(frame));
        } else {
            debug!(frame = %frame, "Unsolicited frame");
            let _ = self.events.send(EngineEvent::Unsolicited(frame));
        }
    }

    fn on_timer(&mut self) {
        match self.phase {
            Phase::Idle => {}
            Phase::Pacing { .. } => {
                self.phase = Phase::Idle;
            }
            Phase::Writing { .. } => {
                warn!(timeout = ?self.write_timeout, "Write not acknowledged");
                let error = TransportError::WriteFailed(format!(
                    "not acknowledged within {:?}",
                    self.write_timeout
                ));
                self.finish(TaskOutcome::Failed(TransferError::WriteFailed(error)));
            }
            Phase::AwaitingResponse { .. } => {
                let Some(timeout) = self.queue.peek_active().map(Task::timeout) else {
                    self.phase = Phase::Idle;
                    return;
                };
                // Retrying is left to the caller.
                warn!(task = ?self.queue.active_id(), ?timeout, "Task timed out");
                self.finish(TaskOutcome::TimedOut(timeout));
            }
        }
        self.pump();
    }

    /// Resolve the active task and free the link
    fn finish(&mut self, outcome: TaskOutcome) {
        self.abort_write();
        self.queue.finish_active(outcome);
        self.phase = Phase::Idle;
    }

    fn abort_write(&mut self) {
        if let Some(write) = self.write.take() {
            write.abort();
        }
    }

    fn shutdown(&mut self, reason: TransferError) -> usize {
        self.abort_write();
        let cancelled = self.queue.cancel_all(reason.clone());
        self.reassembler.reset();
        self.phase = Phase::Idle;
        info!(cancelled, "Transfer engine stopped: {}", reason);
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::blood_pressure::{self, BloodPressureCodec};
    use crate::codec::glucose::{self, GlucoseMeterCodec};
    use crate::transfer::TaskState;
    use crate::transport::MockTransport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use uuid::Uuid;

    fn glucose_response(opcode: u8, payload: &[u8]) -> Bytes {
        GlucoseMeterCodec::frame_bytes(&Frame::response(opcode, payload.to_vec()))
    }

    fn start(transport: impl Transport + 'static, codec: Arc<dyn ProtocolCodec>) -> TransferEngine {
        TransferEngine::start("test", codec, Arc::new(transport), &EngineConfig::default())
    }

    /// Accepts writes but never acknowledges them
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn write(&self, _: Uuid, _: Uuid, _: Bytes) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn subscribe_notify(&self, _: Uuid, _: Uuid, _: ChunkSink) -> Result<(), TransportError> {
            Ok(())
        }

        async fn unsubscribe_notify(&self, _: Uuid, _: Uuid) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Records when each write happened
    #[derive(Default)]
    struct ClockedTransport {
        writes: Arc<Mutex<Vec<(Instant, Bytes)>>>,
    }

    #[async_trait]
    impl Transport for ClockedTransport {
        async fn write(&self, _: Uuid, _: Uuid, data: Bytes) -> Result<(), TransportError> {
            self.writes.lock().push((Instant::now(), data));
            Ok(())
        }

        async fn subscribe_notify(&self, _: Uuid, _: Uuid, _: ChunkSink) -> Result<(), TransportError> {
            Ok(())
        }

        async fn unsubscribe_notify(&self, _: Uuid, _: Uuid) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_fails_task_and_advances() {
        let mut transport = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(TransportError::WriteFailed("gatt 133".into())));
        transport
            .expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let engine = start(transport, Arc::new(GlucoseMeterCodec));
        let first = engine.submit(GlucoseMeterCodec::device_info());
        let second = engine.submit(GlucoseMeterCodec::record_count());

        assert_eq!(
            first.await,
            TaskOutcome::Failed(TransferError::WriteFailed(TransportError::WriteFailed(
                "gatt 133".into()
            )))
        );

        // No automatic retry: the second task is the one now on the link
        assert!(engine
            .chunk_sink()
            .deliver(glucose_response(glucose::opcode::RECORD_COUNT, &[0x05, 0x00])));
        assert_eq!(
            second.await,
            TaskOutcome::Completed(Frame::response(glucose::opcode::RECORD_COUNT, vec![0x05, 0x00]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_writes_to_codec_tunnels() {
        let tunnels = GlucoseMeterCodec.tunnels();
        let mut transport = MockTransport::new();
        transport
            .expect_write()
            .withf(move |service, characteristic, data| {
                *service == tunnels.service
                    && *characteristic == tunnels.send
                    && data[..] == [0x5A, 0x01, 0x01, 0x02]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let engine = start(transport, Arc::new(GlucoseMeterCodec));
        let handle = engine.submit_with_timeout(GlucoseMeterCodec::device_info(), Duration::from_millis(50));
        assert_eq!(handle.await.state(), TaskState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_write_fails() {
        let engine = TransferEngine::start(
            "stalled",
            Arc::new(GlucoseMeterCodec),
            Arc::new(StalledTransport),
            &EngineConfig::default().with_write_timeout(Duration::from_millis(200)),
        );
        let started = Instant::now();
        let outcome = engine.submit(GlucoseMeterCodec::device_info()).await;

        assert!(matches!(
            outcome,
            TaskOutcome::Failed(TransferError::WriteFailed(TransportError::WriteFailed(_)))
        ));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writes_do_not_outlive_teardown() {
        let transport = Arc::new(StalledTransport);
        let engine = TransferEngine::start(
            "stalled",
            Arc::new(GlucoseMeterCodec),
            transport.clone(),
            &EngineConfig::default()
                .with_write_timeout(Duration::from_millis(10))
                .with_max_pending_tasks(32),
        );
        let handles: Vec<_> = (0..20)
            .map(|_| engine.submit(GlucoseMeterCodec::device_info()))
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;

        engine.teardown().await;
        drop(engine);
        for handle in handles {
            assert!(!handle.await.is_completed());
        }
        tokio::time::sleep(Duration::from_secs(60)).await;

        // Only the test still holds the transport
        assert_eq!(Arc::strong_count(&transport), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_before_write_ack_completes_task() {
        let engine = start(StalledTransport, Arc::new(GlucoseMeterCodec));
        let handle = engine.submit(GlucoseMeterCodec::device_info());
        tokio::task::yield_now().await;

        engine
            .chunk_sink()
            .deliver(glucose_response(glucose::opcode::DEVICE_INFO, &[0x01]));
        assert!(handle.await.is_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_encode_failure_skips_to_next_task() {
        let mut transport = MockTransport::new();
        transport.expect_write().times(1).returning(|_, _, _| Ok(()));

        let engine = start(transport, Arc::new(GlucoseMeterCodec));
        let bad = engine.submit(Command::bare(0x81));
        let good = engine.submit(GlucoseMeterCodec::device_info());

        assert!(matches!(
            bad.await,
            TaskOutcome::Failed(TransferError::Encode(_))
        ));
        engine
            .chunk_sink()
            .deliver(glucose_response(glucose::opcode::DEVICE_INFO, &[]));
        assert!(good.await.is_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_interval_spaces_writes() {
        let transport = ClockedTransport::default();
        let writes = Arc::clone(&transport.writes);
        let engine = start(transport, Arc::new(BloodPressureCodec));
        let sink = engine.chunk_sink();

        let first = engine.submit(BloodPressureCodec::device_info());
        let second = engine.submit(BloodPressureCodec::stop_measurement());
        tokio::task::yield_now().await;
        sink.deliver(BloodPressureCodec::frame_bytes(&Frame::response(
            blood_pressure::opcode::DEVICE_INFO,
            Bytes::new(),
        )));
        assert!(first.await.is_completed());

        // Second write only goes out once the interval has passed
        tokio::time::sleep(blood_pressure::SEND_INTERVAL + Duration::from_millis(10)).await;
        sink.deliver(BloodPressureCodec::frame_bytes(&Frame::response(
            blood_pressure::opcode::STOP_MEASUREMENT,
            Bytes::new(),
        )));
        assert!(second.await.is_completed());

        let writes = writes.lock();
        assert_eq!(writes.len(), 2);
        assert!(writes[1].0 - writes[0].0 >= blood_pressure::SEND_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_stops_engine() {
        let engine = TransferEngine::start(
            "overflow",
            Arc::new(GlucoseMeterCodec),
            Arc::new(StalledTransport),
            &EngineConfig::default().with_max_buffered_bytes(8),
        );
        let mut events = engine.subscribe_events();
        let handle = engine.submit(GlucoseMeterCodec::device_info());
        tokio::task::yield_now().await;

        // Start byte with a length that never completes
        let sink = engine.chunk_sink();
        sink.deliver(vec![0x5A, 0xF0, 0x21, 0, 0, 0, 0, 0, 0, 0]);

        assert_eq!(
            handle.await,
            TaskOutcome::Cancelled(TransferError::BufferOverflow {
                buffered: 10,
                limit: 8
            })
        );
        assert_eq!(
            events.recv().await.expect("event"),
            EngineEvent::Desynchronized {
                buffered: 10,
                limit: 8
            }
        );
        assert_eq!(engine.teardown().await, 0);
        assert!(!engine.is_running());
        assert!(!sink.deliver(vec![0x5A]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_after_teardown_is_cancelled() {
        let engine = start(StalledTransport, Arc::new(GlucoseMeterCodec));
        engine.teardown().await;

        let outcome = engine.submit(GlucoseMeterCodec::device_info()).await;
        assert_eq!(outcome, TaskOutcome::Cancelled(TransferError::SessionTornDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_rejects_immediately() {
        let engine = TransferEngine::start(
            "full",
            Arc::new(GlucoseMeterCodec),
            Arc::new(StalledTransport),
            &EngineConfig::default().with_max_pending_tasks(1),
        );
        let _active = engine.submit(GlucoseMeterCodec::device_info());
        tokio::task::yield_now().await;
        let _queued = engine.submit(GlucoseMeterCodec::record_count());
        let rejected = engine.submit(GlucoseMeterCodec::read_record(0));

        assert_eq!(
            rejected.await,
            TaskOutcome::Failed(TransferError::QueueFull { capacity: 1 })
        );
    }
}
