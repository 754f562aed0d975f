//! Cache tier sizing
//!
//! Nominal limits for each of the three content tiers. The defaults are sized
//! for the constrained target (a ~512 MB working set): the tiers together may
//! hold at most ~152 MB of cost, leaving headroom for the rest of the process.

use crate::tier::TierLimits;
use serde::{Deserialize, Serialize};

const MB: usize = 1024 * 1024;

/// Nominal limits for the view, entity and image tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Rendered view objects
    pub views: TierLimits,
    /// Lightweight entity summaries
    pub entities: TierLimits,
    /// Decoded images
    pub images: TierLimits,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            views: TierLimits::new(64, 48 * MB),
            entities: TierLimits::new(512, 8 * MB),
            images: TierLimits::new(96, 96 * MB),
        }
    }
}

impl CacheConfig {
    /// Sets the view tier limits.
    pub fn with_views(mut self, limits: TierLimits) -> Self {
        self.views = limits;
        self
    }

    /// Sets the entity tier limits.
    pub fn with_entities(mut self, limits: TierLimits) -> Self {
        self.entities = limits;
        self
    }

    /// Sets the image tier limits.
    pub fn with_images(mut self, limits: TierLimits) -> Self {
        self.images = limits;
        self
    }

    /// Sets the image tier cost limit in megabytes, keeping its count limit.
    pub fn with_image_mb(mut self, mb: usize) -> Self {
        self.images.cost = mb * MB;
        self
    }

    /// Sum of all tier cost limits in bytes.
    pub fn total_cost_budget(&self) -> usize {
        self.views.cost + self.entities.cost + self.images.cost
    }
}
