//! Delivery of completions onto the UI thread
//!
//! Background work never calls back into UI code directly. Completions are
//! posted to a [`UiExecutor`]; the app's UI thread drains it, typically once
//! per frame, so every callback runs on that thread.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A unit of work to run on the UI thread
pub type UiJob = Box<dyn FnOnce() + Send>;

/// Sink for callbacks that must run on the UI thread
pub trait UiExecutor: Send + Sync {
    fn dispatch(&self, job: UiJob);
}

/// Channel-backed UI executor drained by the owning UI thread
///
/// # Example
///
/// ```
/// use raidbook_scheduler::{UiExecutor, UiQueue};
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
///
/// let queue = UiQueue::new();
/// let ran = Arc::new(AtomicBool::new(false));
/// let ran_clone = ran.clone();
/// queue.dispatch(Box::new(move || ran_clone.store(true, Ordering::SeqCst)));
///
/// // Nothing runs until the UI thread drains the queue
/// assert!(!ran.load(Ordering::SeqCst));
/// assert_eq!(queue.run_pending(), 1);
/// assert!(ran.load(Ordering::SeqCst));
/// ```
pub struct UiQueue {
    sender: Sender<UiJob>,
    receiver: Mutex<Receiver<UiJob>>,
}

impl UiQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Run every job queued so far without blocking; returns how many ran
    pub fn run_pending(&self) -> usize {
        let jobs: Vec<UiJob> = {
            let receiver = self.receiver.lock().unwrap();
            receiver.try_iter().collect()
        };
        let count = jobs.len();
        for job in jobs {
            job();
        }
        count
    }

    /// Run jobs as they arrive until `done` holds or `timeout` elapses
    ///
    /// Returns whether `done` held. Meant for a UI loop waiting on a specific
    /// completion, and for tests.
    pub fn run_until<F>(&self, timeout: Duration, done: F) -> bool
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }

            let next = {
                let receiver = self.receiver.lock().unwrap();
                receiver.recv_timeout(remaining.min(Duration::from_millis(10)))
            };
            match next {
                Ok(job) => job(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return done(),
            }
        }
    }
}

impl Default for UiQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UiExecutor for UiQueue {
    fn dispatch(&self, job: UiJob) {
        // The receiver lives as long as self, so the send cannot fail
        let _ = self.sender.send(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_jobs_run_on_draining_thread() {
        let queue = Arc::new(UiQueue::new());
        let ui_thread = thread::current().id();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    queue.dispatch(Box::new(move || {
                        seen.lock().unwrap().push(thread::current().id());
                    }));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.run_pending(), 4);
        assert!(seen.lock().unwrap().iter().all(|id| *id == ui_thread));
    }

    #[test]
    fn test_run_until_waits_for_late_job() {
        let queue = Arc::new(UiQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let producer = {
            let queue = Arc::clone(&queue);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.dispatch(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            })
        };

        assert!(queue.run_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) == 1));
        producer.join().unwrap();
    }

    #[test]
    fn test_run_until_times_out() {
        let queue = UiQueue::new();
        assert!(!queue.run_until(Duration::from_millis(20), || false));
    }
}
