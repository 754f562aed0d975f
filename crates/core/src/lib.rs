//! Raidbook Core Library
//!
//! Composition root of the resource-constrained runtime: memory pressure
//! handling across caches, scheduler and store, plus runtime configuration.
//!
//! ```no_run
//! use raidbook_core::{Runtime, RuntimeConfig};
//! use raidbook_scheduler::UiQueue;
//! use std::sync::Arc;
//! use std::time::{Duration, Instant};
//!
//! let config = RuntimeConfig::load_with_env(None).unwrap();
//! let ui = Arc::new(UiQueue::new());
//! let runtime: Runtime<String, Vec<u8>> = Runtime::start(config, ui.clone()).unwrap();
//!
//! // UI loop
//! loop {
//!     runtime.frame_presented(Instant::now());
//!     ui.run_until(Duration::from_millis(16), || false);
//! #   break;
//! }
//! ```

pub mod config;
pub mod pressure;
pub mod runtime;

pub use config::{ConfigError, RuntimeConfig};
pub use pressure::{
    MemoryPressureController, PressureChange, PressureConfig, PressureLevel, PressureListener,
    PressurePoller, PressureSignal, PressureSource, PressureTarget,
};
pub use runtime::{EntityCaches, Runtime, RuntimeError, RuntimeStats};
