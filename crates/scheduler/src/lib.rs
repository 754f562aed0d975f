//! Raidbook Scheduler Library
//!
//! Background execution and frame telemetry for the raid companion runtime.
//!
//! Work is split across two bounded queues, one for data and one for images,
//! each with a fixed number of workers. Pending tasks start in QoS order
//! (interactive before utility) and every completion is posted back to the
//! UI thread through a [`UiExecutor`]. The frame budget monitor watches
//! presented frames and asks listeners to reduce complexity when the frame
//! rate drops.
//!
//! # Example
//!
//! ```
//! use raidbook_scheduler::{
//!     BackgroundTaskScheduler, QueueKind, SchedulerConfig, TaskQos, UiQueue,
//! };
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let ui = Arc::new(UiQueue::new());
//! let scheduler = BackgroundTaskScheduler::new(SchedulerConfig::default(), ui.clone()).unwrap();
//!
//! let done = Arc::new(AtomicUsize::new(0));
//! for page in 0..4u32 {
//!     let done = done.clone();
//!     scheduler.enqueue(
//!         QueueKind::Data,
//!         TaskQos::Utility,
//!         move |token| {
//!             token.check()?;
//!             Ok(page * 2)
//!         },
//!         move |_outcome| {
//!             done.fetch_add(1, Ordering::SeqCst);
//!         },
//!     );
//! }
//!
//! assert!(ui.run_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 4));
//! ```

mod cancel;
mod frame_budget;
mod loader;
mod queue;
mod scheduler;
mod task;
mod telemetry;
mod ui_executor;

// Re-export public API
pub use cancel::CancellationToken;
pub use frame_budget::{
    FrameBudgetConfig, FrameBudgetMonitor, ReduceComplexity, ReduceComplexityListener,
    FRAME_INTERVAL_120FPS, FRAME_INTERVAL_60FPS,
};
pub use loader::{BestEffortLoader, LoadRequest};
pub use queue::QueueDepth;
pub use scheduler::{BackgroundTaskScheduler, SchedulerConfig, SchedulerStats};
pub use task::{QueueKind, TaskError, TaskHandle, TaskId, TaskOutcome, TaskQos};
pub use telemetry::{
    MemoryProbe, MemorySample, MemorySampleListener, ProcessMemoryProbe, UsageTelemetry,
};
pub use ui_executor::{UiExecutor, UiJob, UiQueue};
