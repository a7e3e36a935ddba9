//! Task — one command/response exchange and its single-fire result sink

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::TransferError;
use crate::codec::{Command, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Lifecycle of a task. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    InFlight,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::InFlight)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Queued => write!(f, "Queued"),
            TaskState::InFlight => write!(f, "InFlight"),
            TaskState::Completed => write!(f, "Completed"),
            TaskState::Failed => write!(f, "Failed"),
            TaskState::TimedOut => write!(f, "TimedOut"),
            TaskState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// The closed set of ways a task can end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(Frame),
    Failed(TransferError),
    /// No matching response within the given deadline
    TimedOut(Duration),
    Cancelled(TransferError),
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::TimedOut(_) => TaskState::TimedOut,
            TaskOutcome::Cancelled(_) => TaskState::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    pub fn into_result(self) -> Result<Frame, TransferError> {
        match self {
            TaskOutcome::Completed(frame) => Ok(frame),
            TaskOutcome::Failed(error) | TaskOutcome::Cancelled(error) => Err(error),
            TaskOutcome::TimedOut(after) => Err(TransferError::Timeout(after)),
        }
    }
}

/// A queued or in-flight command
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    command: Command,
    state: TaskState,
    submitted_at: Instant,
    timeout: Duration,
    deadline: Option<Instant>,
    sink: Option<oneshot::Sender<TaskOutcome>>,
}

impl Task {
    /// Create a task and the handle its outcome will be delivered to
    pub fn new(id: TaskId, command: Command, timeout: Duration) -> (Self, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            id,
            command,
            state: TaskState::Queued,
            submitted_at: Instant::now(),
            timeout,
            deadline: None,
            sink: Some(tx),
        };
        (
            task,
            TaskHandle {
                id,
                rx,
                outcome: None,
            },
        )
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set once the write is acknowledged
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Queued → InFlight. Returns `false` from any other state.
    pub(crate) fn mark_in_flight(&mut self) -> bool {
        if self.state != TaskState::Queued {
            return false;
        }
        self.state = TaskState::InFlight;
        true
    }

    /// Start the response deadline from `now`
    pub(crate) fn arm_deadline(&mut self, now: Instant) -> Instant {
        let deadline = now + self.timeout;
        self.deadline = Some(deadline);
        deadline
    }

    /// Move to the outcome's terminal state and fire the sink.
    ///
    /// The first call wins; later calls return `false` and deliver nothing.
    pub(crate) fn resolve(&mut self, outcome: TaskOutcome) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = outcome.state();
        self.deadline = None;
        if let Some(sink) = self.sink.take() {
            // The caller may have dropped its handle; the transition still stands.
            let _ = sink.send(outcome);
        }
        true
    }
}

/// Caller side of a submitted task. Resolves exactly once; once read, the
/// same outcome is returned on every later query.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<TaskOutcome>,
    outcome: Option<TaskOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Non-blocking check; `None` while the task is still pending
    pub fn try_outcome(&mut self) -> Option<TaskOutcome> {
        if self.outcome.is_none() {
            self.outcome = match self.rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    Some(TaskOutcome::Cancelled(TransferError::SessionTornDown))
                }
            };
        }
        self.outcome.clone()
    }
}

impl Future for TaskHandle {
    type Output = TaskOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = &self.outcome {
            return Poll::Ready(outcome.clone());
        }
        // A dropped sender means the engine went away without resolving us.
        let outcome = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                result.unwrap_or(TaskOutcome::Cancelled(TransferError::SessionTornDown))
            }
            Poll::Pending => return Poll::Pending,
        };
        self.outcome = Some(outcome.clone());
        Poll::Ready(outcome)
    }
}
