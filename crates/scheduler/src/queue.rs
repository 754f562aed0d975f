//! Bounded execution queue backed by a fixed worker pool
//!
//! Each queue owns `max_concurrency` worker threads. A worker takes the
//! highest-QoS pending task, runs it to completion, and goes back for the next
//! one, so at most `max_concurrency` tasks of a queue ever run at once.
//! Pending tasks are never dropped; they wait for a free worker or for an
//! explicit cancellation.

use crate::task::{QueueKind, ScheduledTask};
use std::collections::BinaryHeap;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Snapshot of a queue's occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Tasks waiting for a worker
    pub pending: usize,

    /// Tasks currently executing
    pub running: usize,

    /// Highest `running` value observed since the queue started
    pub peak_running: usize,

    /// Configured bound on `running`
    pub max_concurrency: usize,
}

struct QueueState {
    pending: BinaryHeap<ScheduledTask>,
    running: usize,
    peak_running: usize,
    insertion_counter: u64,
    shutdown: bool,
}

struct QueueShared {
    kind: QueueKind,
    state: Mutex<QueueState>,
    available: Condvar,
    max_concurrency: usize,
    poll_interval: Duration,
}

pub(crate) struct TaskQueue {
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Start a queue with `max_concurrency` workers (at least one)
    pub fn start(kind: QueueKind, max_concurrency: usize, poll_interval: Duration) -> io::Result<Self> {
        let max_concurrency = max_concurrency.max(1);
        let shared = Arc::new(QueueShared {
            kind,
            state: Mutex::new(QueueState {
                pending: BinaryHeap::new(),
                running: 0,
                peak_running: 0,
                insertion_counter: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            max_concurrency,
            poll_interval,
        });

        let mut workers = Vec::with_capacity(max_concurrency);
        for id in 0..max_concurrency {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("raidbook-{}-worker-{}", kind.label(), id))
                .spawn(move || Self::run(shared))?;
            workers.push(handle);
        }

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Worker loop: take a task, run it, release the slot.
    fn run(shared: Arc<QueueShared>) {
        loop {
            let task = {
                let mut state = shared.state.lock().unwrap();
                loop {
                    if state.shutdown {
                        return;
                    }
                    if state.running < shared.max_concurrency {
                        if let Some(task) = state.pending.pop() {
                            state.running += 1;
                            state.peak_running = state.peak_running.max(state.running);
                            break task;
                        }
                    }
                    state = shared
                        .available
                        .wait_timeout(state, shared.poll_interval)
                        .unwrap()
                        .0;
                }
            };

            tracing::trace!(
                target: "raidbook.scheduler",
                queue = shared.kind.label(),
                task = task.id,
                qos = ?task.qos,
                "running task"
            );
            task.run();

            shared.state.lock().unwrap().running -= 1;
            shared.available.notify_one();
        }
    }

    /// Hold a task until a worker is free
    pub fn push(&self, build: impl FnOnce(u64) -> ScheduledTask) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            drop(state);
            build(0).discard();
            return false;
        }
        let order = state.insertion_counter;
        state.insertion_counter += 1;
        state.pending.push(build(order));
        drop(state);

        self.shared.available.notify_one();
        true
    }

    /// Remove every pending task; running tasks are unaffected
    ///
    /// Removed tasks report cancellation through their completion path.
    pub fn cancel_pending(&self) -> usize {
        let drained: Vec<ScheduledTask> = {
            let mut state = self.shared.state.lock().unwrap();
            state.pending.drain().collect()
        };
        let count = drained.len();
        for task in drained {
            task.discard();
        }
        count
    }

    pub fn depth(&self) -> QueueDepth {
        let state = self.shared.state.lock().unwrap();
        QueueDepth {
            pending: state.pending.len(),
            running: state.running,
            peak_running: state.peak_running,
            max_concurrency: self.shared.max_concurrency,
        }
    }

    /// Stop the workers after their current tasks and discard pending ones
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.available.notify_all();
        self.cancel_pending();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!(
                    target: "raidbook.scheduler",
                    queue = self.shared.kind.label(),
                    "worker thread panicked"
                );
            }
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
