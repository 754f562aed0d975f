//! Raidbook Cache Library
//!
//! Bounded, cost-aware cache tiers with deterministic LRU eviction, and the
//! view/entity/image tier set the app keeps in memory.

pub mod config;
pub mod tier;
pub mod tiers;

pub use config::CacheConfig;
pub use tier::{CacheTier, TierLimits, TierStats};
pub use tiers::{ContentCacheStats, ContentCaches, ContentKey, EvictionReport};
