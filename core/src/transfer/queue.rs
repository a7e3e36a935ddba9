/// FIFO task queue with a single active slot
///
/// The active slot is the only place a task can be `InFlight`, so the link
/// never has two outstanding exchanges. The queue itself is not synchronised;
/// the engine worker is its only owner.

use std::collections::VecDeque;

use super::task::{Task, TaskId, TaskOutcome, TaskState};
use super::TransferError;

/// Default maximum queued tasks before backpressure
pub const DEFAULT_MAX_PENDING_TASKS: usize = 32;

pub struct TaskQueue {
    pending: VecDeque<Task>,
    active: Option<Task>,
    capacity: usize,
}

impl TaskQueue {
    /// Create a new task queue holding at most `capacity` queued tasks
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            active: None,
            capacity,
        }
    }

    pub fn new_default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_TASKS)
    }

    /// Check if the pending side is at capacity
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    /// Number of queued tasks, excluding the active one
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// No active task and nothing queued
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.active.is_none()
    }

    /// True when there is no active task
    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Append a task to the tail. A full queue hands the task back with the error.
    pub fn enqueue(&mut self, task: Task) -> Result<(), (Task, TransferError)> {
        if self.is_full() {
            let capacity = self.capacity;
            return Err((task, TransferError::QueueFull { capacity }));
        }
        self.pending.push_back(task);
        Ok(())
    }

    /// The in-flight task, if any
    pub fn peek_active(&self) -> Option<&Task> {
        self.active.as_ref()
    }

    pub(crate) fn active_mut(&mut self) -> Option<&mut Task> {
        self.active.as_mut()
    }

    pub fn active_id(&self) -> Option<TaskId> {
        self.active.as_ref().map(Task::id)
    }

    /// Resolve the active task and clear the slot.
    ///
    /// Returns the finished task's id, or `None` if there was no active task.
    pub fn finish_active(&mut self, outcome: TaskOutcome) -> Option<TaskId> {
        let mut task = self.active.take()?;
        task.resolve(outcome);
        Some(task.id())
    }

    /// Retire a terminal active task and promote the next queued one to `InFlight`.
    ///
    /// Returns the newly active task, or `None` if a non-terminal task still
    /// holds the slot or nothing is queued.
    pub fn advance(&mut self) -> Option<&Task> {
        if let Some(active) = &self.active {
            if !active.state().is_terminal() {
                return None;
            }
            self.active = None;
        }
        let mut next = self.pending.pop_front()?;
        next.mark_in_flight();
        self.active = Some(next);
        self.active.as_ref()
    }

    /// Cancel the active task and every queued task with `reason`, emptying the queue.
    ///
    /// Returns how many tasks were cancelled.
    pub fn cancel_all(&mut self, reason: TransferError) -> usize {
        let mut cancelled = 0;
        for mut task in self.active.take().into_iter().chain(self.pending.drain(..)) {
            if task.resolve(TaskOutcome::Cancelled(reason.clone())) {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// States of all tasks in queue order, active first
    pub fn states(&self) -> Vec<(TaskId, TaskState)> {
        self.active
            .iter()
            .chain(self.pending.iter())
            .map(|task| (task.id(), task.state()))
            .collect()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Command, Frame};
    use crate::transfer::task::TaskHandle;
    use bytes::Bytes;
    use std::time::Duration;

    fn task(id: u64) -> (Task, TaskHandle) {
        Task::new(TaskId(id), Command::bare(id as u8), Duration::from_secs(1))
    }

    fn completed() -> TaskOutcome {
        TaskOutcome::Completed(Frame::response(0x01, Bytes::new()))
    }

    #[test]
    fn test_task_queue_empty() {
        let queue = TaskQueue::new_default();

        assert!(queue.is_empty());
        assert!(queue.is_idle());
        assert!(!queue.is_full());
        assert_eq!(queue.len(), 0);
        assert!(queue.peek_active().is_none());
    }

    #[test]
    fn test_enqueue_does_not_activate() {
        let mut queue = TaskQueue::new(4);
        let (t, _h) = task(1);
        queue.enqueue(t).expect("enqueue");

        assert!(queue.is_idle());
        assert_eq!(queue.states(), vec![(TaskId(1), TaskState::Queued)]);
    }

    #[test]
    fn test_advance_promotes_in_fifo_order() {
        let mut queue = TaskQueue::new(4);
        let mut handles = Vec::new();
        for id in 1..=3 {
            let (t, h) = task(id);
            queue.enqueue(t).expect("enqueue");
            handles.push(h);
        }

        for id in 1..=3 {
            let active = queue.advance().expect("next task");
            assert_eq!(active.id(), TaskId(id));
            assert_eq!(active.state(), TaskState::InFlight);
            assert_eq!(queue.finish_active(completed()), Some(TaskId(id)));
        }
        assert!(queue.advance().is_none());
        assert!(queue.is_empty());

        for mut handle in handles {
            assert!(handle.try_outcome().expect("resolved").is_completed());
        }
    }

    #[test]
    fn test_single_active_slot() {
        let mut queue = TaskQueue::new(4);
        for id in 1..=2 {
            let (t, _h) = task(id);
            queue.enqueue(t).expect("enqueue");
        }

        assert_eq!(queue.advance().map(Task::id), Some(TaskId(1)));
        // Active task still in flight: nothing else may start
        assert!(queue.advance().is_none());

        let in_flight = queue
            .states()
            .iter()
            .filter(|(_, state)| *state == TaskState::InFlight)
            .count();
        assert_eq!(in_flight, 1);
    }

    #[test]
    fn test_advance_retires_terminal_active() {
        let mut queue = TaskQueue::new(4);
        for id in 1..=2 {
            let (t, _h) = task(id);
            queue.enqueue(t).expect("enqueue");
        }
        queue.advance();
        queue
            .active_mut()
            .expect("active")
            .resolve(TaskOutcome::TimedOut(Duration::from_secs(1)));

        assert_eq!(queue.advance().map(Task::id), Some(TaskId(2)));
    }

    #[test]
    fn test_task_queue_backpressure() {
        let mut queue = TaskQueue::new(2);
        for id in 1..=2 {
            let (t, _h) = task(id);
            queue.enqueue(t).expect("enqueue");
        }
        assert!(queue.is_full());

        let (t, _h) = task(3);
        let (rejected, error) = queue.enqueue(t).expect_err("queue full");
        assert_eq!(rejected.id(), TaskId(3));
        assert_eq!(error, TransferError::QueueFull { capacity: 2 });
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_cancel_all_resolves_everything() {
        let mut queue = TaskQueue::new(4);
        let mut handles = Vec::new();
        for id in 1..=3 {
            let (t, h) = task(id);
            queue.enqueue(t).expect("enqueue");
            handles.push(h);
        }
        queue.advance();

        assert_eq!(queue.cancel_all(TransferError::SessionTornDown), 3);
        assert!(queue.is_empty());

        for mut handle in handles {
            assert_eq!(
                handle.try_outcome(),
                Some(TaskOutcome::Cancelled(TransferError::SessionTornDown))
            );
        }
    }

    #[test]
    fn test_finish_without_active() {
        let mut queue = TaskQueue::new(1);
        assert_eq!(queue.finish_active(completed()), None);
    }
}
