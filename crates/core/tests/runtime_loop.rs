use raidbook_core::{PressureLevel, PressureSignal, Runtime, RuntimeConfig};
use raidbook_scheduler::{
    CancellationToken, MemoryProbe, QueueKind, TaskError, TaskOutcome, TaskQos, UiQueue,
};
use raidbook_storage::{ContextScope, EntityId, EntityRecord, StoreConfig};
use serde_json::json;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

const MIB: u64 = 1024 * 1024;

type TestRuntime = Runtime<String, Arc<Vec<u8>>>;

struct SettableProbe(AtomicU64);

impl MemoryProbe for SettableProbe {
    fn resident_bytes(&self) -> Option<u64> {
        Some(self.0.load(Ordering::SeqCst))
    }

    fn virtual_bytes(&self) -> Option<u64> {
        Some(self.0.load(Ordering::SeqCst) * 2)
    }
}

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn start(dir: &tempfile::TempDir, max_concurrency: usize) -> (TestRuntime, Arc<UiQueue>, Arc<SettableProbe>) {
    init_tracing();
    let mut config = RuntimeConfig::default();
    config.store = StoreConfig::at(dir.path().join("raid.json"));
    config.scheduler.max_concurrency = max_concurrency;
    config.scheduler.idle_poll_ms = 5;
    config.pressure.poll_interval_ms = 0;

    let ui = Arc::new(UiQueue::new());
    let probe = Arc::new(SettableProbe(AtomicU64::new(150 * MIB)));
    let runtime = Runtime::with_probe(config, ui.clone(), probe.clone()).expect("runtime should start");
    (runtime, ui, probe)
}

/// Fill views and images to their nominal counts, plus 100 entities
fn fill_caches(runtime: &TestRuntime) {
    let config = *runtime.caches().config();
    for i in 0..config.views.count {
        runtime.cache_view(format!("view-{i}"), format!("rendered {i}"), 1024);
    }
    for i in 0..config.images.count {
        runtime
            .caches()
            .images()
            .put(format!("image-{i}"), Arc::new(vec![0u8; 16]), 64 * 1024);
    }
    for i in 0..100 {
        let record = EntityRecord::new(format!("boss-{i}"), "boss");
        runtime
            .caches()
            .entities()
            .put(record.id.clone(), Arc::new(record), 256);
    }
}

#[test]
fn warning_squeezes_caches_without_shrinking_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, _ui, probe) = start(&dir, 2);
    fill_caches(&runtime);
    let nominal = runtime.caches().config().views;

    probe.0.store(420 * MIB, Ordering::SeqCst);
    runtime.sample_memory_now();
    assert_eq!(runtime.pressure_level(), PressureLevel::Warning);

    // 70% of 64 views and 96 images; 100 entities fit under 70% of 512
    let stats = runtime.stats();
    assert_eq!(stats.caches.views.count, 44);
    assert_eq!(stats.caches.images.count, 67);
    assert_eq!(stats.caches.entities.count, 100);
    assert_eq!(runtime.caches().views().limits(), nominal);

    // Same level again changes nothing
    runtime.sample_memory_now();
    assert_eq!(runtime.stats().caches.views.count, 44);
    assert_eq!(runtime.pressure().transitions(), 1);
    runtime.shutdown();
}

#[test]
fn critical_purges_caches_and_sheds_queued_work() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, ui, _probe) = start(&dir, 1);
    fill_caches(&runtime);

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Arc::new(Mutex::new(release_rx));
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    for i in 0..6 {
        let started_tx = started_tx.clone();
        let release_rx = Arc::clone(&release_rx);
        let outcomes = Arc::clone(&outcomes);
        runtime.scheduler().enqueue(
            QueueKind::Image,
            TaskQos::Utility,
            move |_: &CancellationToken| {
                let _ = started_tx.send(i);
                let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(10));
                Ok(i)
            },
            move |outcome: TaskOutcome<i32>| outcomes.lock().unwrap().push(outcome),
        );
    }
    started_rx.recv_timeout(Duration::from_secs(5)).expect("first task should start");

    let change = runtime
        .os_memory_warning(PressureSignal::Critical)
        .expect("critical should be a transition");
    assert_eq!(change.to, PressureLevel::Critical);

    let stats = runtime.stats();
    assert_eq!(stats.caches.views.count, 0);
    assert_eq!(stats.caches.images.count, 0);
    assert_eq!(stats.caches.entities.count, runtime.config().pressure.retain_entities);
    assert_eq!(stats.image_queue.pending, 0);

    release_tx.send(()).unwrap();
    assert!(ui.run_until(Duration::from_secs(5), || outcomes.lock().unwrap().len() == 6));

    let outcomes = outcomes.lock().unwrap();
    let completed = outcomes.iter().filter(|o| o.is_ok()).count();
    let cancelled = outcomes
        .iter()
        .filter(|o| matches!(o, Err(TaskError::Cancelled)))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(cancelled, 5);
    runtime.shutdown();
}

#[test]
fn pressure_listeners_observe_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, _ui, probe) = start(&dir, 2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    runtime.on_pressure_change(Arc::new(move |change| sink.lock().unwrap().push(change.to)));

    for resident in [450, 510, 450, 300, 300] {
        probe.0.store(resident * MIB, Ordering::SeqCst);
        runtime.sample_memory_now();
    }

    assert_eq!(
        *seen.lock().unwrap(),
        vec![PressureLevel::Warning, PressureLevel::Critical, PressureLevel::Normal]
    );
    runtime.shutdown();
}

#[test]
fn background_save_merges_into_ui_context() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, _ui, _probe) = start(&dir, 2);
    let id = EntityId::from("vaelastrasz");

    let seed = id.clone();
    runtime
        .perform_background_task(move |scope: &mut ContextScope| {
            scope.insert(EntityRecord::new(seed, "boss").with_property("phase", json!(1)));
        })
        .unwrap();

    // UI reads the record, then a background save changes it
    let read = id.clone();
    let before = runtime
        .store()
        .ui_context()
        .perform(move |scope: &mut ContextScope| scope.property(&read, "phase"))
        .unwrap();
    assert_eq!(before, Some(json!(1)));

    let target = id.clone();
    let (_, outcome) = runtime
        .perform_background_task(move |scope: &mut ContextScope| {
            scope.set_property(&target, "phase", json!(2));
        })
        .unwrap();
    assert!(outcome.is_saved());

    let read = id.clone();
    let after = runtime
        .store()
        .ui_context()
        .perform(move |scope: &mut ContextScope| scope.property(&read, "phase"))
        .unwrap();
    assert_eq!(after, Some(json!(2)));

    let loaded = runtime.load_entity(&id).unwrap().unwrap();
    assert_eq!(loaded.property("phase"), Some(&json!(2)));
    runtime.shutdown();
}

#[test]
fn concurrent_image_requests_share_one_decode() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, ui, _probe) = start(&dir, 2);
    let decodes = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let mut release_rx = Some(release_rx);

    for _ in 0..4 {
        let decodes = Arc::clone(&decodes);
        let delivered = Arc::clone(&delivered);
        let release = release_rx.take();
        let request = runtime.load_image(
            "portrait/chromaggus",
            move |_: &CancellationToken| {
                decodes.fetch_add(1, Ordering::SeqCst);
                if let Some(release) = release {
                    let _ = release.recv_timeout(Duration::from_secs(10));
                }
                Ok((Arc::new(vec![7u8; 32]), 32))
            },
            move |outcome: TaskOutcome<Arc<Vec<u8>>>| {
                assert_eq!(outcome.unwrap().len(), 32);
                delivered.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(request.is_some());
    }

    release_tx.send(()).unwrap();
    assert!(ui.run_until(Duration::from_secs(5), || delivered.load(Ordering::SeqCst) == 4));
    assert_eq!(decodes.load(Ordering::SeqCst), 1);
    assert!(runtime.cached_image("portrait/chromaggus").is_some());

    // Now served from the tier without a decode
    let hit = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hit);
    let request = runtime.load_image(
        "portrait/chromaggus",
        |_: &CancellationToken| Err(TaskError::failed("should not decode")),
        move |outcome: TaskOutcome<Arc<Vec<u8>>>| {
            assert!(outcome.is_ok());
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );
    assert!(request.is_none());
    ui.run_pending();
    assert_eq!(hit.load(Ordering::SeqCst), 1);
    runtime.shutdown();
}

#[test]
fn slow_frames_raise_reduce_complexity() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, _ui, _probe) = start(&dir, 2);
    let signals = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&signals);
    runtime.on_reduce_complexity(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let start = Instant::now();
    for i in 0..60u32 {
        runtime.frame_presented(start + Duration::from_millis(33) * i);
    }

    let fps = runtime.current_fps().expect("enough frames for an estimate");
    assert!(fps < 50.0);
    assert!(runtime.is_degraded());
    assert_eq!(signals.load(Ordering::SeqCst), 1);
    runtime.shutdown();
}

#[test]
fn store_survives_restart_after_enter_background() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (runtime, _ui, _probe) = start(&dir, 2);
        runtime
            .store()
            .ui_context()
            .perform(|scope: &mut ContextScope| {
                scope.insert(EntityRecord::new("blackwing-lair", "dungeon").with_property("bosses", json!(8)));
            })
            .unwrap();
        assert!(runtime.enter_background().unwrap().is_saved());
        runtime.shutdown();
    }

    let (runtime, _ui, _probe) = start(&dir, 2);
    assert!(!runtime.store().open_report().was_recreated());
    let record = runtime
        .load_entity(&EntityId::from("blackwing-lair"))
        .unwrap()
        .expect("record should persist");
    assert_eq!(record.property("bosses"), Some(&json!(8)));
    runtime.shutdown();
}
