//! Cooperative cancellation for scheduled tasks
//!
//! Every task carries a token. Cancelling a token before its task starts makes
//! the worker skip the task; once a task is running the token is only a hint
//! the work may poll. Running work is never preempted.

use crate::task::TaskError;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cancellation flag shared between a task handle and the worker running it
///
/// # Example
///
/// ```
/// use raidbook_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let worker_token = token.clone();
///
/// token.cancel();
/// assert!(worker_token.is_cancelled());
/// assert!(worker_token.check().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this token and every clone of it. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Err(TaskError::Cancelled)` once cancelled, for use with `?` inside work
    pub fn check(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }
}
