//! Best-effort keyed loading with request coalescing
//!
//! Scrolling fires the same load many times. Only the first request for a key
//! queues work; later requests for that key attach to the in-flight task and
//! receive a clone of its outcome. Once the outcome is delivered the key is
//! free again, so a failed load can be retried by asking again.

use crate::cancel::CancellationToken;
use crate::scheduler::BackgroundTaskScheduler;
use crate::task::{QueueKind, TaskHandle, TaskOutcome, TaskQos};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

type Waiter<V> = Box<dyn FnOnce(TaskOutcome<V>) + Send>;

/// What happened to a load request
#[derive(Debug, Clone)]
pub enum LoadRequest {
    /// New work was queued
    Started(TaskHandle),

    /// A load for the same key was already in flight
    Coalesced,
}

impl LoadRequest {
    pub fn is_coalesced(&self) -> bool {
        matches!(self, LoadRequest::Coalesced)
    }
}

pub struct BestEffortLoader<K, V> {
    queue: QueueKind,
    in_flight: Arc<Mutex<HashMap<K, Vec<Waiter<V>>>>>,
}

impl<K, V> BestEffortLoader<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(queue: QueueKind) -> Self {
        Self {
            queue,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Load `key` with `work` unless a load for it is already running
    ///
    /// Every caller's `completion` runs on the UI executor with the outcome of
    /// the single shared load.
    pub fn load<W, C>(
        &self,
        scheduler: &BackgroundTaskScheduler,
        key: K,
        qos: TaskQos,
        work: W,
        completion: C,
    ) -> LoadRequest
    where
        W: FnOnce(&CancellationToken) -> TaskOutcome<V> + Send + 'static,
        C: FnOnce(TaskOutcome<V>) + Send + 'static,
    {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(waiters) = in_flight.get_mut(&key) {
                waiters.push(Box::new(completion));
                return LoadRequest::Coalesced;
            }
            in_flight.insert(key.clone(), vec![Box::new(completion)]);
        }

        let in_flight = Arc::clone(&self.in_flight);
        let handle = scheduler.enqueue(self.queue, qos, work, move |outcome: TaskOutcome<V>| {
            let waiters = in_flight
                .lock()
                .unwrap()
                .remove(&key)
                .unwrap_or_default();
            for waiter in waiters {
                waiter(outcome.clone());
            }
        });
        LoadRequest::Started(handle)
    }

    /// Keys with a load in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    pub fn is_loading(&self, key: &K) -> bool {
        self.in_flight.lock().unwrap().contains_key(key)
    }
}
