//! Background task scheduler
//!
//! Two bounded queues (data and image) run background work off the UI
//! thread. Completions, including failures and cancellations, are always
//! delivered through the [`UiExecutor`].

use crate::cancel::CancellationToken;
use crate::queue::{QueueDepth, TaskQueue};
use crate::task::{
    Disposition, QueueKind, ScheduledTask, TaskBody, TaskError, TaskHandle, TaskId, TaskOutcome,
    TaskQos,
};
use crate::ui_executor::UiExecutor;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scheduler tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running tasks, per queue
    pub max_concurrency: usize,

    /// How long an idle worker sleeps before re-checking its queue
    pub idle_poll_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            idle_poll_ms: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}

/// Task counters across both queues
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks accepted by `enqueue`
    pub submitted: u64,

    /// Tasks whose work returned `Ok`
    pub completed: u64,

    /// Tasks whose work returned an error or panicked
    pub failed: u64,

    /// Tasks that never ran, or observed cancellation while running
    pub cancelled: u64,
}

impl SchedulerStats {
    /// Tasks whose completion has not been produced yet
    pub fn outstanding(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed + self.failed + self.cancelled)
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn record<T>(&self, outcome: &TaskOutcome<T>) {
        let counter = match outcome {
            Ok(_) => &self.completed,
            Err(TaskError::Cancelled) => &self.cancelled,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs background work on bounded queues and posts completions to the UI
///
/// # Example
///
/// ```
/// use raidbook_scheduler::{
///     BackgroundTaskScheduler, QueueKind, SchedulerConfig, TaskQos, UiQueue,
/// };
/// use std::sync::{Arc, Mutex};
/// use std::time::Duration;
///
/// let ui = Arc::new(UiQueue::new());
/// let scheduler =
///     BackgroundTaskScheduler::new(SchedulerConfig::default().with_max_concurrency(2), ui.clone())
///         .unwrap();
///
/// let result = Arc::new(Mutex::new(None));
/// let slot = result.clone();
/// scheduler.enqueue(
///     QueueKind::Data,
///     TaskQos::Interactive,
///     |_token| Ok(21 * 2),
///     move |outcome| *slot.lock().unwrap() = Some(outcome),
/// );
///
/// // The completion runs when the UI thread drains its queue
/// assert!(ui.run_until(Duration::from_secs(5), || result.lock().unwrap().is_some()));
/// assert_eq!(*result.lock().unwrap(), Some(Ok(42)));
/// ```
pub struct BackgroundTaskScheduler {
    config: SchedulerConfig,
    data: TaskQueue,
    image: TaskQueue,
    ui: Arc<dyn UiExecutor>,
    next_id: AtomicU64,
    counters: Arc<Counters>,
}

impl BackgroundTaskScheduler {
    /// Start both queues' worker pools
    pub fn new(config: SchedulerConfig, ui: Arc<dyn UiExecutor>) -> io::Result<Self> {
        let max_concurrency = config.max_concurrency.max(1);
        let data = TaskQueue::start(QueueKind::Data, max_concurrency, config.idle_poll())?;
        let image = TaskQueue::start(QueueKind::Image, max_concurrency, config.idle_poll())?;

        tracing::debug!(
            target: "raidbook.scheduler",
            max_concurrency,
            "background scheduler started"
        );

        Ok(Self {
            config,
            data,
            image,
            ui,
            next_id: AtomicU64::new(1),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn ui_executor(&self) -> &Arc<dyn UiExecutor> {
        &self.ui
    }

    fn queue(&self, kind: QueueKind) -> &TaskQueue {
        match kind {
            QueueKind::Data => &self.data,
            QueueKind::Image => &self.image,
        }
    }

    /// Queue `work` and deliver its outcome to `completion` on the UI executor
    ///
    /// `work` runs on one of the queue's workers once a slot is free. It
    /// receives the task's cancellation token to poll if it is long running.
    /// `completion` is called exactly once: with the work's result, with
    /// [`TaskError::Panicked`] if the work panicked, or with
    /// [`TaskError::Cancelled`] if the task was cancelled before it started.
    pub fn enqueue<T, W, C>(&self, queue: QueueKind, qos: TaskQos, work: W, completion: C) -> TaskHandle
    where
        T: Send + 'static,
        W: FnOnce(&CancellationToken) -> TaskOutcome<T> + Send + 'static,
        C: FnOnce(TaskOutcome<T>) + Send + 'static,
    {
        let id: TaskId = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let counters = Arc::clone(&self.counters);
        let ui = Arc::clone(&self.ui);

        let body: TaskBody = Box::new(move |disposition| {
            let outcome = match disposition {
                Disposition::Execute(token) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| work(&token))) {
                        Ok(outcome) => outcome,
                        Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
                    }
                }
                Disposition::Discard => Err(TaskError::Cancelled),
            };

            counters.record(&outcome);
            if let Err(err) = &outcome {
                if !matches!(err, TaskError::Cancelled) {
                    tracing::warn!(
                        target: "raidbook.scheduler",
                        queue = queue.label(),
                        task = id,
                        error = %err,
                        "background task failed"
                    );
                }
            }

            ui.dispatch(Box::new(move || completion(outcome)));
        });

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle::new(id, queue, token.clone());
        self.queue(queue)
            .push(|order| ScheduledTask::new(id, qos, token, body, order));

        tracing::trace!(
            target: "raidbook.scheduler",
            queue = queue.label(),
            task = id,
            ?qos,
            "task enqueued"
        );
        handle
    }

    /// Cancel every task not yet started, on both queues
    ///
    /// Running tasks finish normally. Each removed task's completion receives
    /// [`TaskError::Cancelled`]. Returns the number of removed tasks.
    pub fn cancel_all_queued(&self) -> usize {
        let cancelled = self.data.cancel_pending() + self.image.cancel_pending();
        if cancelled > 0 {
            tracing::info!(
                target: "raidbook.scheduler",
                cancelled,
                "cancelled queued background tasks"
            );
        }
        cancelled
    }

    /// Cancel tasks not yet started on one queue
    pub fn cancel_queued(&self, queue: QueueKind) -> usize {
        self.queue(queue).cancel_pending()
    }

    pub fn queue_depth(&self, queue: QueueKind) -> QueueDepth {
        self.queue(queue).depth()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, cancel pending tasks and join the workers
    ///
    /// Tasks already running are allowed to finish.
    pub fn shutdown(&self) {
        self.data.shutdown();
        self.image.shutdown();
        tracing::debug!(target: "raidbook.scheduler", "background scheduler stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
