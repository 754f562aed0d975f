//! Runtime composition root
//!
//! [`Runtime`] wires the cache tiers, the background scheduler, frame and
//! memory telemetry, the pressure controller and the persistence coordinator
//! into one object the UI layer holds for the life of the process.

use crate::config::{ConfigError, RuntimeConfig};
use crate::pressure::{
    MemoryPressureController, PressureChange, PressureLevel, PressureListener, PressurePoller,
    PressureSignal,
};
use raidbook_cache::{ContentCacheStats, ContentCaches, ContentKey};
use raidbook_scheduler::{
    BackgroundTaskScheduler, BestEffortLoader, CancellationToken, FrameBudgetMonitor, LoadRequest,
    MemoryProbe, MemorySample, ProcessMemoryProbe, QueueDepth, QueueKind, ReduceComplexityListener,
    SchedulerStats, TaskError, TaskHandle, TaskOutcome, TaskQos, UiExecutor, UsageTelemetry,
};
use raidbook_storage::{
    ContextScope, EntityId, EntityRecord, PersistenceCoordinator, SaveOutcome, StoreError,
    StoreResult,
};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Cache tiers keyed by entity id, holding shared committed records
pub type EntityCaches<V, I> = ContentCaches<EntityId, Arc<EntityRecord>, V, I>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to start runtime threads: {0}")]
    Io(#[from] io::Error),
}

/// Snapshot of everything the runtime tracks
#[derive(Debug, Clone, Copy)]
pub struct RuntimeStats {
    pub caches: ContentCacheStats,
    pub scheduler: SchedulerStats,
    pub data_queue: QueueDepth,
    pub image_queue: QueueDepth,
    pub pressure: PressureLevel,
    pub fps: Option<f64>,
    pub stored_entities: usize,
}

/// The resource-constrained runtime
///
/// `V` is the UI's view type and `I` its decoded image type. Completions of
/// every asynchronous operation run on the [`UiExecutor`] passed at startup.
pub struct Runtime<V, I> {
    config: RuntimeConfig,
    caches: Arc<EntityCaches<V, I>>,
    scheduler: Arc<BackgroundTaskScheduler>,
    frames: Arc<FrameBudgetMonitor>,
    telemetry: Arc<UsageTelemetry>,
    pressure: Arc<MemoryPressureController>,
    store: Arc<PersistenceCoordinator>,
    epoch: Arc<SaveEpoch>,
    images: BestEffortLoader<ContentKey, I>,
    poller: Mutex<Option<PressurePoller>>,
}

impl<V, I> Runtime<V, I>
where
    V: Clone + Send + Sync + 'static,
    I: Clone + Send + Sync + 'static,
{
    /// Start with the process memory probe
    pub fn start(config: RuntimeConfig, ui: Arc<dyn UiExecutor>) -> Result<Self, RuntimeError> {
        Self::with_probe(config, ui, Arc::new(ProcessMemoryProbe))
    }

    pub fn with_probe(
        config: RuntimeConfig,
        ui: Arc<dyn UiExecutor>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let store = Arc::new(PersistenceCoordinator::open(config.store.clone())?);
        let scheduler = Arc::new(BackgroundTaskScheduler::new(config.scheduler, ui)?);
        let frames = Arc::new(FrameBudgetMonitor::new(config.frame_budget));
        let telemetry = Arc::new(UsageTelemetry::new(probe, Arc::clone(&frames)));
        let pressure = Arc::new(MemoryPressureController::new(config.pressure));
        let caches: Arc<EntityCaches<V, I>> = Arc::new(ContentCaches::new(config.cache));

        pressure.add_target(caches.clone());
        pressure.add_target(scheduler.clone());
        pressure.add_target(store.clone());

        let controller = Arc::clone(&pressure);
        telemetry.on_memory_sample(Arc::new(move |sample: MemorySample| {
            controller.record_sample(&sample);
        }));

        let poller = if config.pressure.poll_interval_ms > 0 {
            Some(PressurePoller::spawn(
                Arc::clone(&telemetry),
                config.pressure.poll_interval(),
            )?)
        } else {
            None
        };

        tracing::info!(
            target: "raidbook.runtime",
            store = %store.path().display(),
            entities = store.entity_count(),
            max_concurrency = config.scheduler.max_concurrency,
            polling = poller.is_some(),
            "runtime started"
        );

        Ok(Self {
            config,
            caches,
            scheduler,
            frames,
            telemetry,
            pressure,
            store,
            epoch: Arc::new(SaveEpoch::default()),
            images: BestEffortLoader::new(QueueKind::Image),
            poller: Mutex::new(poller),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn caches(&self) -> &Arc<EntityCaches<V, I>> {
        &self.caches
    }

    pub fn scheduler(&self) -> &Arc<BackgroundTaskScheduler> {
        &self.scheduler
    }

    pub fn telemetry(&self) -> &Arc<UsageTelemetry> {
        &self.telemetry
    }

    pub fn pressure(&self) -> &Arc<MemoryPressureController> {
        &self.pressure
    }

    pub fn store(&self) -> &Arc<PersistenceCoordinator> {
        &self.store
    }

    /// Cache-through entity lookup through the UI context
    ///
    /// Blocks on the UI context's executor on a miss, so it suits small
    /// records already known to exist. Prefer [`Self::load_entity_async`] for
    /// anything driven by scrolling. Returns the committed record; edits
    /// staged on the UI context are not visible here.
    pub fn load_entity(&self, id: &EntityId) -> StoreResult<Option<Arc<EntityRecord>>> {
        if let Some(record) = self.caches.entities().get(id) {
            return Ok(Some(record));
        }

        let started = self.epoch.current();
        let key = id.clone();
        let fetched = self
            .store
            .ui_context()
            .perform(move |scope: &mut ContextScope| scope.committed(&key))?;
        Ok(fetched.map(|record| self.epoch.fill(&self.caches, record, started).0))
    }

    /// Cache-through entity lookup on the data queue
    ///
    /// A cache hit still completes through the UI executor, never inline.
    pub fn load_entity_async<C>(&self, id: EntityId, completion: C) -> Option<TaskHandle>
    where
        C: FnOnce(TaskOutcome<Option<Arc<EntityRecord>>>) + Send + 'static,
    {
        if let Some(record) = self.caches.entities().get(&id) {
            self.scheduler
                .ui_executor()
                .dispatch(Box::new(move || completion(Ok(Some(record)))));
            return None;
        }

        let caches = Arc::clone(&self.caches);
        let store = Arc::clone(&self.store);
        let epoch = Arc::clone(&self.epoch);
        let handle = self.scheduler.enqueue(
            QueueKind::Data,
            TaskQos::Interactive,
            move |token: &CancellationToken| {
                token.check()?;
                let started = epoch.current();
                let fetched = fetch_in_background(&store, vec![id]).map_err(store_failure)?;
                Ok(fetched.into_iter().next().map(|record| epoch.fill(&caches, record, started).0))
            },
            completion,
        );
        Some(handle)
    }

    /// Best-effort batch warm of the entity tier
    ///
    /// Ids already cached are skipped. Missing ids are ignored. The work runs at
    /// utility QoS, so anything interactive on the data queue goes first.
    pub fn precache(&self, ids: Vec<EntityId>) -> TaskHandle {
        let caches = Arc::clone(&self.caches);
        let store = Arc::clone(&self.store);
        let epoch = Arc::clone(&self.epoch);
        let requested = ids.len();

        self.scheduler.enqueue(
            QueueKind::Data,
            TaskQos::Utility,
            move |token: &CancellationToken| {
                let missing: Vec<EntityId> = ids
                    .into_iter()
                    .filter(|id| !caches.entities().contains(id))
                    .collect();
                if missing.is_empty() {
                    return Ok(0);
                }
                token.check()?;

                let started = epoch.current();
                let records = fetch_in_background(&store, missing).map_err(store_failure)?;
                let mut warmed = 0;
                for record in records {
                    if token.is_cancelled() {
                        break;
                    }
                    let (_, cached) = epoch.fill(&caches, record, started);
                    warmed += usize::from(cached);
                }
                Ok(warmed)
            },
            move |outcome: TaskOutcome<usize>| match outcome {
                Ok(warmed) => {
                    tracing::debug!(target: "raidbook.runtime", requested, warmed, "precache finished")
                }
                Err(err) => {
                    tracing::debug!(target: "raidbook.runtime", requested, error = %err, "precache dropped")
                }
            },
        )
    }

    /// Run `work` on a fresh background context and save it
    ///
    /// Entities the save changed are evicted from the entity tier so the next
    /// lookup sees committed values. Loads that read the store before this
    /// save finish without filling the tier.
    pub fn perform_background_task<R, F>(&self, work: F) -> StoreResult<(R, SaveOutcome)>
    where
        R: Send + 'static,
        F: FnOnce(&mut ContextScope) -> R + Send + 'static,
    {
        let (value, outcome) = self.store.perform_background_task(work)?;
        self.evict_saved(&outcome);
        Ok((value, outcome))
    }

    fn evict_saved(&self, outcome: &SaveOutcome) {
        if let SaveOutcome::Saved(changes) = outcome {
            self.epoch.advance(|| {
                for id in changes.updated.keys().chain(changes.deleted.iter()) {
                    self.caches.entities().remove(id);
                }
            });
        }
    }

    pub fn cached_view(&self, key: &str) -> Option<V> {
        self.caches.views().get(&key.to_string())
    }

    /// Returns false when `cost` alone exceeds the view tier's cost limit
    pub fn cache_view(&self, key: impl Into<ContentKey>, view: V, cost: usize) -> bool {
        self.caches.views().put(key.into(), view, cost)
    }

    pub fn cached_image(&self, key: &str) -> Option<I> {
        self.caches.images().get(&key.to_string())
    }

    /// Load an image through the image queue unless it is cached
    ///
    /// `loader` decodes the image and reports its cost in bytes. Concurrent
    /// requests for the same key share one decode. Returns `None` when the
    /// image was served from the cache; `completion` still runs on the UI
    /// executor in that case.
    pub fn load_image<L, C>(&self, key: impl Into<ContentKey>, loader: L, completion: C) -> Option<LoadRequest>
    where
        L: FnOnce(&CancellationToken) -> TaskOutcome<(I, usize)> + Send + 'static,
        C: FnOnce(TaskOutcome<I>) + Send + 'static,
    {
        let key = key.into();
        if let Some(image) = self.caches.images().get(&key) {
            self.scheduler
                .ui_executor()
                .dispatch(Box::new(move || completion(Ok(image))));
            return None;
        }

        let caches = Arc::clone(&self.caches);
        let cache_key = key.clone();
        Some(self.images.load(
            &self.scheduler,
            key,
            TaskQos::Interactive,
            move |token: &CancellationToken| {
                let (image, cost) = loader(token)?;
                if !caches.images().put(cache_key.clone(), image.clone(), cost) {
                    tracing::debug!(
                        target: "raidbook.runtime",
                        key = %cache_key,
                        cost,
                        "image larger than its tier, not cached"
                    );
                }
                Ok(image)
            },
            completion,
        ))
    }

    /// Render-loop hook, once per displayed frame
    pub fn frame_presented(&self, at: Instant) {
        self.telemetry.sample_frame(at);
    }

    /// Forward an OS memory warning, then take a memory sample
    ///
    /// The sample reaches the pressure controller like any other, so a run of
    /// clear samples toward a downgrade starts from a measured value.
    pub fn os_memory_warning(&self, signal: PressureSignal) -> Option<PressureChange> {
        let change = self.pressure.os_signal(signal);
        self.telemetry.sample_memory();
        change
    }

    /// Sample memory now instead of waiting for the poller
    pub fn sample_memory_now(&self) -> MemorySample {
        self.telemetry.sample_memory()
    }

    pub fn on_reduce_complexity(&self, listener: ReduceComplexityListener) {
        self.frames.subscribe(listener);
    }

    pub fn on_pressure_change(&self, listener: PressureListener) {
        self.pressure.subscribe(listener);
    }

    pub fn pressure_level(&self) -> PressureLevel {
        self.pressure.level()
    }

    pub fn current_fps(&self) -> Option<f64> {
        self.frames.fps()
    }

    /// Whether the frame rate is below the degraded threshold
    pub fn is_degraded(&self) -> bool {
        self.frames.is_degraded()
    }

    /// Synchronously save the UI context before the app is suspended
    pub fn enter_background(&self) -> StoreResult<SaveOutcome> {
        let outcome = self.store.save_ui_context()?;
        self.evict_saved(&outcome);
        tracing::info!(
            target: "raidbook.runtime",
            saved = outcome.is_saved(),
            "UI context saved on entering background"
        );
        Ok(outcome)
    }

    /// Stop memory polling and the scheduler's workers
    ///
    /// Queued tasks complete with [`TaskError::Cancelled`]. Idempotent.
    pub fn shutdown(&self) {
        if let Some(mut poller) = self.poller.lock().unwrap().take() {
            poller.stop();
        }
        self.scheduler.shutdown();
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            caches: self.caches.stats(),
            scheduler: self.scheduler.stats(),
            data_queue: self.scheduler.queue_depth(QueueKind::Data),
            image_queue: self.scheduler.queue_depth(QueueKind::Image),
            pressure: self.pressure.level(),
            fps: self.frames.fps(),
            stored_entities: self.store.entity_count(),
        }
    }
}

impl<V, I> Drop for Runtime<V, I> {
    fn drop(&mut self) {
        if let Some(mut poller) = self.poller.lock().unwrap().take() {
            poller.stop();
        }
    }
}

/// Orders entity tier fills against saves that evict
///
/// Every save bumps the epoch and evicts under the same lock a fill checks
/// it under. A load that read the store before a save committed therefore
/// either sees the bump and skips the fill, or fills before the eviction
/// removes it.
#[derive(Debug, Default)]
struct SaveEpoch(Mutex<u64>);

impl SaveEpoch {
    fn current(&self) -> u64 {
        *self.0.lock().unwrap()
    }

    fn advance(&self, evict: impl FnOnce()) {
        let mut epoch = self.0.lock().unwrap();
        *epoch += 1;
        evict();
    }

    /// Cache `record` unless a save committed after `started` was read
    ///
    /// Returns the shared record and whether it went into the tier.
    fn fill<V, I>(
        &self,
        caches: &EntityCaches<V, I>,
        record: EntityRecord,
        started: u64,
    ) -> (Arc<EntityRecord>, bool)
    where
        V: Clone,
        I: Clone,
    {
        let record = Arc::new(record);
        let epoch = self.0.lock().unwrap();
        if *epoch != started {
            tracing::debug!(
                target: "raidbook.runtime",
                id = %record.id,
                "entity saved during load, not cached"
            );
            return (record, false);
        }
        let cost = record.estimated_size();
        caches.entities().put(record.id.clone(), Arc::clone(&record), cost);
        (record, true)
    }
}

/// Read records on a throwaway background context
fn fetch_in_background(store: &PersistenceCoordinator, ids: Vec<EntityId>) -> StoreResult<Vec<EntityRecord>> {
    let context = store.new_background_context()?;
    context.perform(move |scope: &mut ContextScope| {
        ids.iter().filter_map(|id| scope.fetch(id)).collect()
    })
}

fn store_failure(err: StoreError) -> TaskError {
    TaskError::failed(err.to_string())
}
