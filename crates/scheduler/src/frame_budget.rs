//! Frame-rate tracking for UI responsiveness
//!
//! The render loop reports every presented frame. The monitor keeps a sliding
//! window of roughly two seconds of frame timestamps, derives a rolling FPS
//! from it, and emits a [`ReduceComplexity`] signal when throughput degrades
//! below a threshold.
//!
//! # Target Frame Times
//! - 60 FPS (standard): 16.67ms per frame
//! - 120 FPS (ProMotion): 8.33ms per frame
//!
//! Signals are rate limited by a cooldown so a sustained slowdown produces one
//! signal per cooldown interval rather than one per frame.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Frame interval at 60 FPS (16.67ms)
pub const FRAME_INTERVAL_60FPS: Duration = Duration::from_micros(16_667);

/// Frame interval at 120 FPS (8.33ms)
pub const FRAME_INTERVAL_120FPS: Duration = Duration::from_micros(8_333);

/// Configuration for [`FrameBudgetMonitor`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameBudgetConfig {
    /// Expected display refresh rate
    pub target_fps: u32,

    /// Span of the sliding window in milliseconds
    pub window_ms: u64,

    /// FPS below which the reduce-complexity signal fires
    pub degraded_fps: f64,

    /// Minimum time between two signals in milliseconds
    pub cooldown_ms: u64,

    /// Samples required in the window before a signal may fire
    pub min_samples: usize,
}

impl Default for FrameBudgetConfig {
    fn default() -> Self {
        Self {
            target_fps: 60,
            window_ms: 2_000,
            degraded_fps: 50.0,
            cooldown_ms: 5_000,
            min_samples: 10,
        }
    }
}

impl FrameBudgetConfig {
    /// Set the target refresh rate
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = fps.max(1);
        self
    }

    /// Set the degraded threshold
    pub fn with_degraded_fps(mut self, fps: f64) -> Self {
        self.degraded_fps = fps;
        self
    }

    /// Set the signal cooldown
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Maximum number of samples the window holds
    pub fn window_capacity(&self) -> usize {
        let frames = self.target_fps as f64 * self.window().as_secs_f64();
        (frames.ceil() as usize).max(2)
    }
}

/// Signal asking the UI layer to simplify what it renders
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReduceComplexity {
    /// FPS measured when the signal fired
    pub fps: f64,

    /// Timestamp of the frame that triggered it
    pub at: Instant,
}

pub type ReduceComplexityListener = Arc<dyn Fn(ReduceComplexity) + Send + Sync>;

struct MonitorState {
    window: VecDeque<Instant>,
    fps: Option<f64>,
    last_signal: Option<Instant>,
    signals: u64,
}

/// Rolling FPS monitor
///
/// # Example
///
/// ```
/// use raidbook_scheduler::{FrameBudgetMonitor, FRAME_INTERVAL_60FPS};
/// use std::time::Instant;
///
/// let monitor = FrameBudgetMonitor::default();
/// let start = Instant::now();
/// for i in 0..60 {
///     monitor.record_frame(start + FRAME_INTERVAL_60FPS * i);
/// }
///
/// let fps = monitor.fps().unwrap();
/// assert!((fps - 60.0).abs() < 0.6);
/// ```
pub struct FrameBudgetMonitor {
    config: FrameBudgetConfig,
    state: Mutex<MonitorState>,
    listeners: Mutex<Vec<ReduceComplexityListener>>,
}

impl FrameBudgetMonitor {
    pub fn new(config: FrameBudgetConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState {
                window: VecDeque::with_capacity(config.window_capacity()),
                fps: None,
                last_signal: None,
                signals: 0,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &FrameBudgetConfig {
        &self.config
    }

    /// Register a reduce-complexity observer
    pub fn subscribe(&self, listener: ReduceComplexityListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Record a presented frame and return the current FPS
    ///
    /// Samples older than the window span relative to `at` are dropped, as are
    /// samples beyond the window capacity. With fewer than two samples, or
    /// when `at` is earlier than the newest sample, the previous FPS is
    /// reported unchanged.
    pub fn record_frame(&self, at: Instant) -> Option<f64> {
        let (fps, signal) = {
            let mut state = self.state.lock().unwrap();

            if state.window.back().is_some_and(|&newest| at < newest) {
                return state.fps;
            }

            state.window.push_back(at);
            let capacity = self.config.window_capacity();
            while state.window.len() > capacity {
                state.window.pop_front();
            }
            let span = self.config.window();
            while state
                .window
                .front()
                .is_some_and(|&oldest| at.saturating_duration_since(oldest) > span)
            {
                state.window.pop_front();
            }

            if let Some(fps) = window_fps(&state.window) {
                state.fps = Some(fps);
            }

            let signal = self.evaluate(&mut state, at);
            (state.fps, signal)
        };

        if let Some(signal) = signal {
            tracing::info!(
                target: "raidbook.scheduler",
                fps = signal.fps,
                threshold = self.config.degraded_fps,
                "frame rate degraded, requesting reduced complexity"
            );
            let listeners = self.listeners.lock().unwrap().clone();
            for listener in listeners {
                listener(signal);
            }
        }

        fps
    }

    fn evaluate(&self, state: &mut MonitorState, at: Instant) -> Option<ReduceComplexity> {
        let fps = state.fps?;
        if fps >= self.config.degraded_fps || state.window.len() < self.config.min_samples {
            return None;
        }
        if let Some(last) = state.last_signal {
            if at.saturating_duration_since(last) < self.config.cooldown() {
                return None;
            }
        }
        state.last_signal = Some(at);
        state.signals += 1;
        Some(ReduceComplexity { fps, at })
    }

    /// Most recent FPS, `None` until two frames have been recorded
    pub fn fps(&self) -> Option<f64> {
        self.state.lock().unwrap().fps
    }

    /// Whether the last computed FPS is under the degraded threshold
    pub fn is_degraded(&self) -> bool {
        self.fps().is_some_and(|fps| fps < self.config.degraded_fps)
    }

    /// Number of samples currently in the window
    pub fn sample_count(&self) -> usize {
        self.state.lock().unwrap().window.len()
    }

    /// Number of reduce-complexity signals emitted so far
    pub fn signals_emitted(&self) -> u64 {
        self.state.lock().unwrap().signals
    }
}

impl Default for FrameBudgetMonitor {
    fn default() -> Self {
        Self::new(FrameBudgetConfig::default())
    }
}

/// (count - 1) / (newest - oldest), undefined for fewer than two samples
fn window_fps(window: &VecDeque<Instant>) -> Option<f64> {
    if window.len() < 2 {
        return None;
    }
    let first = *window.front()?;
    let last = *window.back()?;
    let span = last.saturating_duration_since(first).as_secs_f64();
    if span <= 0.0 {
        return None;
    }
    Some((window.len() - 1) as f64 / span)
}
