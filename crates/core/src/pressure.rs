//! Memory pressure classification and response
//!
//! The controller turns memory samples and OS notifications into a
//! [`PressureLevel`] and reacts on every upward transition:
//! - entering Warning squeezes every target by a fixed factor
//! - entering Critical purges every target down to a small retained set
//!
//! Levels rise immediately. They fall only after a run of consecutive samples
//! below the current level, which keeps a process hovering at a threshold
//! from flapping between levels.

use raidbook_cache::ContentCaches;
use raidbook_scheduler::{BackgroundTaskScheduler, MemorySample, UsageTelemetry};
use raidbook_storage::{ContextScope, PersistenceCoordinator};
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// How close the process is to its memory ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

/// Memory notification delivered by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureSignal {
    Warning,
    Critical,
}

impl PressureSignal {
    pub fn level(&self) -> PressureLevel {
        match self {
            PressureSignal::Warning => PressureLevel::Warning,
            PressureSignal::Critical => PressureLevel::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Resident size at which the level becomes Warning
    pub warning_mb: u64,

    /// Resident size at which the level becomes Critical
    pub critical_mb: u64,

    /// Fraction of nominal limits tiers are squeezed to on Warning
    pub squeeze_factor: f64,

    /// Consecutive lower samples needed before the level drops
    pub clear_samples: u32,

    /// Entity summaries kept on Critical
    pub retain_entities: usize,

    /// Interval of the self-polling memory check
    pub poll_interval_ms: u64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            warning_mb: 400,
            critical_mb: 500,
            squeeze_factor: 0.7,
            clear_samples: 2,
            retain_entities: 32,
            poll_interval_ms: 5_000,
        }
    }
}

impl PressureConfig {
    pub fn with_thresholds_mb(mut self, warning_mb: u64, critical_mb: u64) -> Self {
        self.warning_mb = warning_mb;
        self.critical_mb = critical_mb.max(warning_mb);
        self
    }

    pub fn warning_bytes(&self) -> u64 {
        self.warning_mb * MIB
    }

    pub fn critical_bytes(&self) -> u64 {
        self.critical_mb * MIB
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Level implied by a resident size alone
    pub fn classify(&self, resident_bytes: u64) -> PressureLevel {
        if resident_bytes >= self.critical_bytes() {
            PressureLevel::Critical
        } else if resident_bytes >= self.warning_bytes() {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }
}

/// What caused a level change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureSource {
    Sample { resident_bytes: u64 },
    OsSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureChange {
    pub from: PressureLevel,
    pub to: PressureLevel,
    pub source: PressureSource,
}

pub type PressureListener = Arc<dyn Fn(PressureChange) + Send + Sync>;

/// Something that sheds memory when pressure rises
pub trait PressureTarget: Send + Sync {
    /// Entering Warning: evict down to `factor` of nominal limits, keep capacity
    fn squeeze(&self, factor: f64);

    /// Entering Critical: keep at most `retain_entities` entity entries
    fn purge(&self, retain_entities: usize);
}

impl<K, E, V, I> PressureTarget for ContentCaches<K, E, V, I>
where
    K: Eq + Hash + Clone + Send,
    E: Clone + Send,
    V: Clone + Send,
    I: Clone + Send,
{
    fn squeeze(&self, factor: f64) {
        let evicted = ContentCaches::squeeze(self, factor);
        tracing::debug!(
            target: "raidbook.pressure",
            factor,
            views = evicted.views,
            entities = evicted.entities,
            images = evicted.images,
            "squeezed caches"
        );
    }

    fn purge(&self, retain_entities: usize) {
        let evicted = ContentCaches::purge(self, retain_entities);
        tracing::debug!(
            target: "raidbook.pressure",
            retain_entities,
            views = evicted.views,
            entities = evicted.entities,
            images = evicted.images,
            "purged caches"
        );
    }
}

impl PressureTarget for BackgroundTaskScheduler {
    // Running and queued work is left alone until memory is critical
    fn squeeze(&self, _factor: f64) {}

    fn purge(&self, _retain_entities: usize) {
        self.cancel_all_queued();
    }
}

impl PressureTarget for PersistenceCoordinator {
    fn squeeze(&self, _factor: f64) {}

    // Drop clean registered copies from the UI context; unsaved edits stay
    fn purge(&self, _retain_entities: usize) {
        let queued = self.ui_context().perform_async(|scope: &mut ContextScope| {
            let released = scope.release_unmodified();
            tracing::debug!(target: "raidbook.pressure", released, "released UI context copies");
        });
        if let Err(err) = queued {
            tracing::debug!(target: "raidbook.pressure", error = %err, "UI context unavailable");
        }
    }
}

#[derive(Debug)]
struct ControllerState {
    level: PressureLevel,
    /// Consecutive samples below `level`
    clear_streak: u32,
    transitions: u64,
}

/// Classifies memory pressure and drives eviction across its targets
///
/// # Example
///
/// ```
/// use raidbook_core::{MemoryPressureController, PressureConfig, PressureLevel, PressureSignal};
///
/// let controller = MemoryPressureController::new(PressureConfig::default());
/// const MIB: u64 = 1024 * 1024;
///
/// controller.observe_resident(450 * MIB);
/// assert_eq!(controller.level(), PressureLevel::Warning);
///
/// controller.os_signal(PressureSignal::Critical);
/// assert_eq!(controller.level(), PressureLevel::Critical);
///
/// // Two consecutive clear samples bring the level back down
/// controller.observe_resident(100 * MIB);
/// assert_eq!(controller.level(), PressureLevel::Critical);
/// controller.observe_resident(100 * MIB);
/// assert_eq!(controller.level(), PressureLevel::Normal);
/// ```
pub struct MemoryPressureController {
    config: PressureConfig,
    /// Held across a transition and its response so targets and listeners
    /// see changes in the order they were made
    responding: Mutex<()>,
    state: Mutex<ControllerState>,
    targets: Mutex<Vec<Arc<dyn PressureTarget>>>,
    listeners: Mutex<Vec<PressureListener>>,
}

impl MemoryPressureController {
    pub fn new(config: PressureConfig) -> Self {
        Self {
            config,
            responding: Mutex::new(()),
            state: Mutex::new(ControllerState {
                level: PressureLevel::Normal,
                clear_streak: 0,
                transitions: 0,
            }),
            targets: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PressureConfig {
        &self.config
    }

    pub fn add_target(&self, target: Arc<dyn PressureTarget>) {
        self.targets.lock().unwrap().push(target);
    }

    /// Register for level changes, delivered after targets have reacted
    ///
    /// Listeners run while the controller is responding and must not feed it
    /// samples or signals themselves.
    pub fn subscribe(&self, listener: PressureListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn level(&self) -> PressureLevel {
        self.state.lock().unwrap().level
    }

    /// Level changes so far
    pub fn transitions(&self) -> u64 {
        self.state.lock().unwrap().transitions
    }

    /// Feed a telemetry sample
    ///
    /// A sample with a resident size of 0 is a failed OS query and is ignored.
    pub fn record_sample(&self, sample: &MemorySample) -> Option<PressureChange> {
        if sample.resident_bytes == 0 {
            return None;
        }
        self.observe_resident(sample.resident_bytes)
    }

    /// Classify a resident size and transition if warranted
    pub fn observe_resident(&self, resident_bytes: u64) -> Option<PressureChange> {
        let measured = self.config.classify(resident_bytes);
        let source = PressureSource::Sample { resident_bytes };

        let _responding = self.responding.lock().unwrap();
        let change = {
            let mut state = self.state.lock().unwrap();
            if measured > state.level {
                state.clear_streak = 0;
                Some(Self::transition(&mut state, measured, source))
            } else if measured < state.level {
                state.clear_streak += 1;
                if state.clear_streak >= self.config.clear_samples.max(1) {
                    state.clear_streak = 0;
                    Some(Self::transition(&mut state, measured, source))
                } else {
                    None
                }
            } else {
                state.clear_streak = 0;
                None
            }
        };

        if let Some(change) = change {
            self.respond(change);
        }
        change
    }

    /// Handle an OS memory notification
    ///
    /// Raises the level immediately; a signal at or below the current level
    /// changes nothing.
    pub fn os_signal(&self, signal: PressureSignal) -> Option<PressureChange> {
        let _responding = self.responding.lock().unwrap();
        let change = {
            let mut state = self.state.lock().unwrap();
            state.clear_streak = 0;
            let level = signal.level();
            (level > state.level).then(|| Self::transition(&mut state, level, PressureSource::OsSignal))
        };

        if let Some(change) = change {
            self.respond(change);
        }
        change
    }

    fn transition(state: &mut ControllerState, to: PressureLevel, source: PressureSource) -> PressureChange {
        let change = PressureChange { from: state.level, to, source };
        state.level = to;
        state.transitions += 1;
        change
    }

    fn respond(&self, change: PressureChange) {
        tracing::info!(
            target: "raidbook.pressure",
            from = ?change.from,
            to = ?change.to,
            source = ?change.source,
            "memory pressure changed"
        );

        let targets = self.targets.lock().unwrap().clone();
        if change.to > change.from {
            match change.to {
                PressureLevel::Warning => {
                    for target in &targets {
                        target.squeeze(self.config.squeeze_factor);
                    }
                }
                PressureLevel::Critical => {
                    for target in &targets {
                        target.purge(self.config.retain_entities);
                    }
                }
                PressureLevel::Normal => {}
            }
        }

        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener(change);
        }
    }
}

/// Background thread sampling memory at a fixed interval
///
/// Samples go through [`UsageTelemetry::sample_memory`], so every memory
/// sample listener (the pressure controller included) sees them.
pub struct PressurePoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PressurePoller {
    pub fn spawn(telemetry: Arc<UsageTelemetry>, interval: Duration) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let should_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("raidbook-memory-poll".to_string())
            .spawn(move || {
                while !should_stop.load(Ordering::Acquire) {
                    telemetry.sample_memory();
                    thread::park_timeout(interval);
                }
            })?;

        Ok(Self { stop, handle: Some(handle) })
    }

    /// Stop polling and wait for the thread to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for PressurePoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raidbook_cache::{CacheConfig, TierLimits};
    use raidbook_scheduler::{FrameBudgetMonitor, MemoryProbe};
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingTarget {
        squeezes: AtomicUsize,
        purges: AtomicUsize,
    }

    impl PressureTarget for RecordingTarget {
        fn squeeze(&self, _factor: f64) {
            self.squeezes.fetch_add(1, Ordering::SeqCst);
        }

        fn purge(&self, _retain_entities: usize) {
            self.purges.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn controller() -> (MemoryPressureController, Arc<RecordingTarget>, Arc<Mutex<Vec<PressureChange>>>) {
        let controller = MemoryPressureController::new(PressureConfig::default());
        let target = Arc::new(RecordingTarget::default());
        controller.add_target(target.clone());

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        controller.subscribe(Arc::new(move |change| sink.lock().unwrap().push(change)));
        (controller, target, changes)
    }

    fn levels(changes: &Mutex<Vec<PressureChange>>) -> Vec<(PressureLevel, PressureLevel)> {
        changes.lock().unwrap().iter().map(|c| (c.from, c.to)).collect()
    }

    #[test]
    fn test_threshold_crossings_with_hysteresis() {
        let (controller, target, changes) = controller();
        use PressureLevel::*;

        for mb in [300, 350, 410, 420, 430, 510, 520, 200, 200, 200] {
            controller.observe_resident(mb * MIB);
        }

        assert_eq!(
            levels(&changes),
            vec![(Normal, Warning), (Warning, Critical), (Critical, Normal)]
        );
        assert_eq!(controller.level(), Normal);
        assert_eq!(target.squeezes.load(Ordering::SeqCst), 1);
        assert_eq!(target.purges.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_chatter_at_boundary() {
        let (controller, target, changes) = controller();

        for mb in [401, 399, 401, 399, 401, 399, 401] {
            controller.observe_resident(mb * MIB);
        }

        assert_eq!(levels(&changes), vec![(PressureLevel::Normal, PressureLevel::Warning)]);
        assert_eq!(target.squeezes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_downgrade_lands_on_latest_level() {
        let (controller, _target, changes) = controller();
        controller.observe_resident(600 * MIB);
        controller.observe_resident(450 * MIB);
        controller.observe_resident(450 * MIB);

        assert_eq!(controller.level(), PressureLevel::Warning);
        assert_eq!(
            levels(&changes),
            vec![
                (PressureLevel::Normal, PressureLevel::Critical),
                (PressureLevel::Critical, PressureLevel::Warning),
            ]
        );
    }

    #[test]
    fn test_os_signals() {
        let (controller, target, changes) = controller();

        assert!(controller.os_signal(PressureSignal::Warning).is_some());
        // Same level again is a no-op
        assert!(controller.os_signal(PressureSignal::Warning).is_none());
        assert!(controller.os_signal(PressureSignal::Critical).is_some());
        // Lower signal never downgrades
        assert!(controller.os_signal(PressureSignal::Warning).is_none());

        assert_eq!(controller.level(), PressureLevel::Critical);
        assert_eq!(changes.lock().unwrap().len(), 2);
        assert!(changes.lock().unwrap().iter().all(|c| c.source == PressureSource::OsSignal));
        assert_eq!(target.squeezes.load(Ordering::SeqCst), 1);
        assert_eq!(target.purges.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_os_signal_resets_clear_streak() {
        let (controller, _target, _changes) = controller();
        controller.observe_resident(450 * MIB);
        controller.observe_resident(100 * MIB);
        controller.os_signal(PressureSignal::Warning);
        controller.observe_resident(100 * MIB);

        assert_eq!(controller.level(), PressureLevel::Warning);
        controller.observe_resident(100 * MIB);
        assert_eq!(controller.level(), PressureLevel::Normal);
    }

    #[test]
    fn test_failed_sample_is_ignored() {
        let (controller, _target, changes) = controller();
        controller.observe_resident(450 * MIB);

        let failed = MemorySample::new(Instant::now(), 0, 0);
        assert!(controller.record_sample(&failed).is_none());
        assert!(controller.record_sample(&failed).is_none());

        assert_eq!(controller.level(), PressureLevel::Warning);
        assert_eq!(changes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_caches_respond_to_levels() {
        let config = CacheConfig::default()
            .with_views(TierLimits::new(10, 10_000))
            .with_entities(TierLimits::new(100, 100_000))
            .with_images(TierLimits::new(10, 100_000));
        let caches: Arc<ContentCaches<u32, u32, u32, u32>> = Arc::new(ContentCaches::new(config));
        for i in 0..10 {
            caches.views().put(format!("view-{i}"), i, 100);
            caches.images().put(format!("image-{i}"), i, 1_000);
        }
        for i in 0..100 {
            caches.entities().put(i, i, 10);
        }

        let controller = MemoryPressureController::new(PressureConfig::default());
        controller.add_target(caches.clone());

        controller.os_signal(PressureSignal::Warning);
        assert_eq!(caches.views().len(), 7);
        assert_eq!(caches.entities().len(), 70);
        // Capacity comes back after the squeeze
        assert_eq!(caches.views().limits(), TierLimits::new(10, 10_000));

        controller.os_signal(PressureSignal::Critical);
        assert!(caches.views().is_empty());
        assert!(caches.images().is_empty());
        assert_eq!(caches.entities().len(), 32);
        // The most recently used entities survive
        assert!(caches.entities().contains(&99));
        assert!(!caches.entities().contains(&30));
    }

    #[derive(Default)]
    struct OrderedTarget {
        events: Mutex<Vec<&'static str>>,
    }

    impl PressureTarget for OrderedTarget {
        fn squeeze(&self, _factor: f64) {
            self.events.lock().unwrap().push("squeeze");
            // Widen the window for a racing transition
            thread::sleep(Duration::from_millis(5));
        }

        fn purge(&self, _retain_entities: usize) {
            self.events.lock().unwrap().push("purge");
        }
    }

    #[test]
    fn test_concurrent_transitions_respond_in_order() {
        for _ in 0..20 {
            let controller = Arc::new(MemoryPressureController::new(PressureConfig::default()));
            let target = Arc::new(OrderedTarget::default());
            controller.add_target(target.clone());
            let changes = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&changes);
            controller.subscribe(Arc::new(move |change| sink.lock().unwrap().push(change)));

            let sampler = {
                let controller = Arc::clone(&controller);
                thread::spawn(move || {
                    controller.observe_resident(450 * MIB);
                })
            };
            let signaller = {
                let controller = Arc::clone(&controller);
                thread::spawn(move || {
                    controller.os_signal(PressureSignal::Critical);
                })
            };
            sampler.join().unwrap();
            signaller.join().unwrap();

            // Each delivered change starts where the previous one ended
            let changes = changes.lock().unwrap();
            let mut level = PressureLevel::Normal;
            for change in changes.iter() {
                assert_eq!(change.from, level);
                level = change.to;
            }
            assert_eq!(level, PressureLevel::Critical);

            // A squeeze, if any, happened before the purge
            let events = target.events.lock().unwrap();
            assert_eq!(events.last(), Some(&"purge"));
        }
    }

    struct SteppedProbe {
        resident: AtomicU64,
    }

    impl MemoryProbe for SteppedProbe {
        fn resident_bytes(&self) -> Option<u64> {
            Some(self.resident.load(Ordering::SeqCst))
        }

        fn virtual_bytes(&self) -> Option<u64> {
            None
        }
    }

    #[test]
    fn test_poller_feeds_controller() {
        let probe = Arc::new(SteppedProbe { resident: AtomicU64::new(520 * MIB) });
        let telemetry = Arc::new(UsageTelemetry::new(probe, Arc::new(FrameBudgetMonitor::default())));
        let controller = Arc::new(MemoryPressureController::new(PressureConfig::default()));
        {
            let controller = Arc::clone(&controller);
            telemetry.on_memory_sample(Arc::new(move |sample| {
                controller.record_sample(&sample);
            }));
        }

        let mut poller = PressurePoller::spawn(telemetry, Duration::from_millis(5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while controller.level() != PressureLevel::Critical && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        poller.stop();

        assert_eq!(controller.level(), PressureLevel::Critical);
        assert!(!poller.is_running());
    }
}
