//! Process memory and frame telemetry
//!
//! Pure data sources: memory queries against the OS and the frame hook the
//! render loop calls for every presented frame. Policy lives in the
//! consumers ([`FrameBudgetMonitor`] and the memory pressure controller).

use crate::frame_budget::FrameBudgetMonitor;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One reading of process memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub timestamp: Instant,
    /// Resident set size in bytes, 0 when the query failed
    pub resident_bytes: u64,
    /// Virtual size in bytes, 0 when the query failed
    pub virtual_bytes: u64,
}

impl MemorySample {
    pub fn new(timestamp: Instant, resident_bytes: u64, virtual_bytes: u64) -> Self {
        Self {
            timestamp,
            resident_bytes,
            virtual_bytes,
        }
    }

    /// Resident size in whole megabytes
    pub fn resident_mb(&self) -> u64 {
        self.resident_bytes / (1024 * 1024)
    }
}

/// Source of process memory figures
pub trait MemoryProbe: Send + Sync {
    /// Resident set size in bytes, `None` if unavailable
    fn resident_bytes(&self) -> Option<u64>;

    /// Virtual size in bytes, `None` if unavailable
    fn virtual_bytes(&self) -> Option<u64>;
}

/// Reads the current process's memory from the OS
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        process_memory().map(|(resident, _)| resident)
    }

    fn virtual_bytes(&self) -> Option<u64> {
        process_memory().map(|(_, virt)| virt)
    }
}

#[cfg(target_os = "linux")]
fn process_memory() -> Option<(u64, u64)> {
    let statm = match std::fs::read_to_string("/proc/self/statm") {
        Ok(statm) => statm,
        Err(err) => {
            tracing::debug!(
                target: "raidbook.telemetry",
                error = %err,
                "failed to read /proc/self/statm"
            );
            return None;
        }
    };
    let mut fields = statm.split_whitespace().map(|field| field.parse::<u64>().ok());
    let (Some(Some(size_pages)), Some(Some(rss_pages))) = (fields.next(), fields.next()) else {
        static PARSE_FAILURE: std::sync::Once = std::sync::Once::new();
        PARSE_FAILURE.call_once(|| {
            tracing::debug!(
                target: "raidbook.telemetry",
                statm = %statm.trim(),
                "unrecognised /proc/self/statm format"
            );
        });
        return None;
    };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    let page_size = page_size as u64;
    Some((
        rss_pages.saturating_mul(page_size),
        size_pages.saturating_mul(page_size),
    ))
}

#[cfg(target_os = "macos")]
fn process_memory() -> Option<(u64, u64)> {
    let mut info = libc::mach_task_basic_info {
        virtual_size: 0,
        resident_size: 0,
        resident_size_max: 0,
        user_time: libc::time_value_t {
            seconds: 0,
            microseconds: 0,
        },
        system_time: libc::time_value_t {
            seconds: 0,
            microseconds: 0,
        },
        policy: 0,
        suspend_count: 0,
    };

    let mut count = libc::MACH_TASK_BASIC_INFO_COUNT;
    #[allow(deprecated)]
    let kr = unsafe {
        libc::task_info(
            libc::mach_task_self(),
            libc::MACH_TASK_BASIC_INFO,
            (&mut info as *mut libc::mach_task_basic_info).cast(),
            &mut count,
        )
    };
    if kr == libc::KERN_SUCCESS {
        Some((info.resident_size as u64, info.virtual_size as u64))
    } else {
        None
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn process_memory() -> Option<(u64, u64)> {
    None
}

pub type MemorySampleListener = Arc<dyn Fn(MemorySample) + Send + Sync>;

/// Telemetry entry points used by the render loop and the pressure poller
///
/// Frame samples are forwarded to the [`FrameBudgetMonitor`]. When a memory
/// check interval is configured, frame sampling also takes a memory sample
/// once per interval and hands it to registered listeners.
pub struct UsageTelemetry {
    probe: Arc<dyn MemoryProbe>,
    frames: Arc<FrameBudgetMonitor>,
    memory_check_interval: Option<Duration>,
    last_memory_check: Mutex<Option<Instant>>,
    listeners: Mutex<Vec<MemorySampleListener>>,
}

impl UsageTelemetry {
    pub fn new(probe: Arc<dyn MemoryProbe>, frames: Arc<FrameBudgetMonitor>) -> Self {
        Self {
            probe,
            frames,
            memory_check_interval: None,
            last_memory_check: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Take a memory sample from the frame hook at most once per `interval`
    pub fn with_memory_check_interval(mut self, interval: Duration) -> Self {
        self.memory_check_interval = Some(interval);
        self
    }

    /// Register a listener for memory samples taken by [`Self::sample_memory`]
    pub fn on_memory_sample(&self, listener: MemorySampleListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Resident memory in bytes, or 0 if the OS query fails
    pub fn current_memory_usage(&self) -> u64 {
        self.probe.resident_bytes().unwrap_or(0)
    }

    /// Take a memory sample and notify listeners
    pub fn sample_memory(&self) -> MemorySample {
        self.sample_memory_at(Instant::now())
    }

    fn sample_memory_at(&self, timestamp: Instant) -> MemorySample {
        let sample = MemorySample::new(
            timestamp,
            self.probe.resident_bytes().unwrap_or(0),
            self.probe.virtual_bytes().unwrap_or(0),
        );
        *self.last_memory_check.lock().unwrap() = Some(timestamp);

        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener(sample);
        }
        sample
    }

    /// Render-loop hook, called once per displayed frame
    pub fn sample_frame(&self, timestamp: Instant) {
        self.frames.record_frame(timestamp);

        let Some(interval) = self.memory_check_interval else {
            return;
        };
        let due = match *self.last_memory_check.lock().unwrap() {
            Some(last) => timestamp.saturating_duration_since(last) >= interval,
            None => true,
        };
        if due {
            self.sample_memory_at(timestamp);
        }
    }

    pub fn frame_monitor(&self) -> &Arc<FrameBudgetMonitor> {
        &self.frames
    }
}
