//! The three content tiers held by the app
//!
//! Views, entity summaries and decoded images each get their own
//! [`CacheTier`]. This module groups them so memory pressure handling can
//! shrink all of them in one place.

use crate::config::CacheConfig;
use crate::tier::{CacheTier, TierLimits, TierStats};
use std::hash::Hash;

/// Key type for view and image tiers
pub type ContentKey = String;

/// Number of entries evicted from each tier by one pressure action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub views: usize,
    pub entities: usize,
    pub images: usize,
}

impl EvictionReport {
    /// Total entries evicted across tiers
    pub fn total(&self) -> usize {
        self.views + self.entities + self.images
    }
}

/// Statistics for all tiers at one instant
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentCacheStats {
    pub views: TierStats,
    pub entities: TierStats,
    pub images: TierStats,
}

impl ContentCacheStats {
    /// Sum of live costs across tiers
    pub fn total_cost(&self) -> usize {
        self.views.cost + self.entities.cost + self.images.cost
    }

    /// Number of live entries across tiers
    pub fn total_count(&self) -> usize {
        self.views.count + self.entities.count + self.images.count
    }

    /// Total evictions across tiers
    pub fn total_evictions(&self) -> u64 {
        self.views.evictions + self.entities.evictions + self.images.evictions
    }
}

/// View, entity and image tiers sized from one [`CacheConfig`]
///
/// `K`/`E` are the entity key and value types; `V` and `I` are the view and
/// decoded image types.
pub struct ContentCaches<K, E, V, I> {
    config: CacheConfig,
    views: CacheTier<ContentKey, V>,
    entities: CacheTier<K, E>,
    images: CacheTier<ContentKey, I>,
}

impl<K, E, V, I> ContentCaches<K, E, V, I>
where
    K: Eq + Hash + Clone,
    E: Clone,
    V: Clone,
    I: Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            views: CacheTier::named("views", config.views),
            entities: CacheTier::named("entities", config.entities),
            images: CacheTier::named("images", config.images),
        }
    }

    pub fn views(&self) -> &CacheTier<ContentKey, V> {
        &self.views
    }

    pub fn entities(&self) -> &CacheTier<K, E> {
        &self.entities
    }

    pub fn images(&self) -> &CacheTier<ContentKey, I> {
        &self.images
    }

    /// Nominal configuration the tiers were built with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Shrink every tier to `factor` of its nominal limits, then restore them
    pub fn squeeze(&self, factor: f64) -> EvictionReport {
        EvictionReport {
            views: self.views.squeeze(self.config.views.scaled(factor)),
            entities: self.entities.squeeze(self.config.entities.scaled(factor)),
            images: self.images.squeeze(self.config.images.scaled(factor)),
        }
    }

    /// Drop all views and images and keep at most `retain_entities` entities
    ///
    /// The entity tier keeps its most recently used entries and its nominal
    /// limits afterwards.
    pub fn purge(&self, retain_entities: usize) -> EvictionReport {
        let views = self.views.len();
        let images = self.images.len();
        self.views.clear();
        self.images.clear();

        let entities = self.entities.squeeze(TierLimits::new(
            retain_entities.min(self.config.entities.count),
            self.config.entities.cost,
        ));

        EvictionReport {
            views,
            entities,
            images,
        }
    }

    /// Reapply nominal limits to every tier
    pub fn restore_nominal(&self) {
        self.views.set_limits(self.config.views);
        self.entities.set_limits(self.config.entities);
        self.images.set_limits(self.config.images);
    }

    /// Drop every entry in every tier
    pub fn clear_all(&self) {
        self.views.clear();
        self.entities.clear();
        self.images.clear();
    }

    pub fn stats(&self) -> ContentCacheStats {
        ContentCacheStats {
            views: self.views.stats(),
            entities: self.entities.stats(),
            images: self.images.stats(),
        }
    }
}
