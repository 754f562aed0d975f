//! Scheduled task types
//!
//! A task is a unit of deferred work tagged with a QoS class and the queue it
//! belongs to. Pending tasks are ordered by QoS (interactive first), then by
//! insertion order within the same class.

use crate::cancel::CancellationToken;
use std::cmp::Ordering;
use std::fmt;

/// Unique task identifier
pub type TaskId = u64;

/// Quality-of-service class
///
/// Higher values start first when both are pending on the same queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskQos {
    /// Prefetch and warming work the user is not waiting on
    Utility = 0,

    /// Work backing something currently on screen
    Interactive = 1,
}

/// Which bounded queue a task runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Entity loading and other data processing
    Data,

    /// Image decoding and loading
    Image,
}

impl QueueKind {
    pub fn label(&self) -> &'static str {
        match self {
            QueueKind::Data => "data",
            QueueKind::Image => "image",
        }
    }
}

/// Why a task did not produce a value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task cancelled before it started")]
    Cancelled,
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

/// Result delivered to a task's completion callback
pub type TaskOutcome<T> = Result<T, TaskError>;

/// What a worker (or the canceller) does with a dequeued task
pub(crate) enum Disposition {
    /// Run the work with this token
    Execute(CancellationToken),

    /// Drop the work; report cancellation to the completion path
    Discard,
}

pub(crate) type TaskBody = Box<dyn FnOnce(Disposition) + Send>;

/// A task waiting in, or taken from, a queue
pub(crate) struct ScheduledTask {
    pub id: TaskId,
    pub qos: TaskQos,
    pub token: CancellationToken,
    pub body: TaskBody,
    insertion_order: u64,
}

impl ScheduledTask {
    pub fn new(
        id: TaskId,
        qos: TaskQos,
        token: CancellationToken,
        body: TaskBody,
        insertion_order: u64,
    ) -> Self {
        Self {
            id,
            qos,
            token,
            body,
            insertion_order,
        }
    }

    pub fn run(self) {
        if self.token.is_cancelled() {
            (self.body)(Disposition::Discard);
        } else {
            (self.body)(Disposition::Execute(self.token));
        }
    }

    pub fn discard(self) {
        self.token.cancel();
        (self.body)(Disposition::Discard);
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("qos", &self.qos)
            .field("insertion_order", &self.insertion_order)
            .finish()
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.qos.cmp(&other.qos) {
            // BinaryHeap is a max heap: earlier insertions must compare greater
            Ordering::Equal => other.insertion_order.cmp(&self.insertion_order),
            other => other,
        }
    }
}

/// Handle returned by `enqueue`
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub id: TaskId,
    pub queue: QueueKind,
    token: CancellationToken,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, queue: QueueKind, token: CancellationToken) -> Self {
        Self { id, queue, token }
    }

    /// Request cooperative cancellation
    ///
    /// A task that has not started is skipped by its worker and reports
    /// [`TaskError::Cancelled`]. A running task only observes the flag
    /// through its token.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn task(id: TaskId, qos: TaskQos) -> ScheduledTask {
        ScheduledTask::new(id, qos, CancellationToken::new(), Box::new(|_| {}), id)
    }

    #[test]
    fn test_interactive_before_utility() {
        let mut heap = BinaryHeap::new();
        heap.push(task(1, TaskQos::Utility));
        heap.push(task(2, TaskQos::Interactive));
        heap.push(task(3, TaskQos::Utility));
        heap.push(task(4, TaskQos::Interactive));

        let order: Vec<TaskId> = std::iter::from_fn(|| heap.pop().map(|t| t.id)).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_cancelled_task_is_discarded_on_run() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let executed = Arc::new(AtomicBool::new(false));
        let discarded = Arc::new(AtomicBool::new(false));
        let (e, d) = (Arc::clone(&executed), Arc::clone(&discarded));
        let token = CancellationToken::new();
        let task = ScheduledTask::new(
            1,
            TaskQos::Utility,
            token.clone(),
            Box::new(move |disposition| match disposition {
                Disposition::Execute(_) => e.store(true, Ordering::SeqCst),
                Disposition::Discard => d.store(true, Ordering::SeqCst),
            }),
            0,
        );

        token.cancel();
        task.run();

        assert!(!executed.load(Ordering::SeqCst));
        assert!(discarded.load(Ordering::SeqCst));
    }

    #[test]
    fn test_task_error_display() {
        assert_eq!(TaskError::failed("disk").to_string(), "task failed: disk");
        assert_eq!(
            TaskError::Cancelled.to_string(),
            "task cancelled before it started"
        );
    }
}
