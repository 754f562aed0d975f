//! Bounded cache tier with LRU eviction
//!
//! A tier holds one kind of cached object (views, entity summaries, decoded
//! images) under two limits at once: a maximum entry count and a maximum total
//! cost. When an insertion would break either limit, the least recently used
//! entries are evicted until both hold again.
//!
//! Recency is an explicit monotonically increasing tick per entry, indexed by a
//! `BTreeMap`, so the eviction order is fully determined by the sequence of
//! operations applied to the tier.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Mutex;

/// Count and cost bounds for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TierLimits {
    /// Maximum number of live entries
    pub count: usize,

    /// Maximum sum of live entry costs
    pub cost: usize,
}

impl TierLimits {
    /// Create limits from a count and a cost
    pub const fn new(count: usize, cost: usize) -> Self {
        Self { count, cost }
    }

    /// Limits scaled down by `factor` (clamped to 0.0..=1.0)
    pub fn scaled(&self, factor: f64) -> Self {
        let factor = factor.clamp(0.0, 1.0);
        Self {
            count: (self.count as f64 * factor) as usize,
            cost: (self.cost as f64 * factor) as usize,
        }
    }
}

/// Statistics about tier usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Number of live entries
    pub count: usize,

    /// Sum of live entry costs
    pub cost: usize,

    /// Configured limits
    pub limits: TierLimits,

    /// Number of lookups that found an entry
    pub hits: u64,

    /// Number of lookups that found nothing
    pub misses: u64,

    /// Number of entries dropped to satisfy a limit
    pub evictions: u64,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl TierStats {
    /// Calculate the hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    value: V,
    cost: usize,
    tick: u64,
}

struct TierState<K, V> {
    entries: HashMap<K, Entry<V>>,

    /// Recency index: oldest tick first
    recency: BTreeMap<u64, K>,

    next_tick: u64,
    total_cost: usize,
    limits: TierLimits,
    stats: TierStats,
}

impl<K, V> TierState<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new(limits: TierLimits) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            total_cost: 0,
            limits,
            stats: TierStats::default(),
        }
    }

    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Mark an existing key as most recently used
    fn touch(&mut self, key: &K) {
        let tick = self.bump_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn take(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        self.total_cost = self.total_cost.saturating_sub(entry.cost);
        Some(entry)
    }

    fn evict_lru(&mut self) -> bool {
        let Some((_, key)) = self.recency.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.total_cost = self.total_cost.saturating_sub(entry.cost);
            self.stats.evictions += 1;
        }
        true
    }

    /// Evict until `extra_count` more entries of `extra_cost` would fit
    fn evict_to_fit(&mut self, extra_count: usize, extra_cost: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() + extra_count > self.limits.count
            || self.total_cost + extra_cost > self.limits.cost
        {
            if !self.evict_lru() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    fn sync_stats(&mut self) {
        self.stats.count = self.entries.len();
        self.stats.cost = self.total_cost;
        self.stats.limits = self.limits;
    }
}

/// Thread-safe bounded key/value tier with LRU eviction
///
/// Values are handed out as clones, so store `Arc<T>` when `T` is large and
/// callers should share one immutable copy.
///
/// # Example
///
/// ```
/// use raidbook_cache::{CacheTier, TierLimits};
///
/// let tier: CacheTier<&str, u32> = CacheTier::new(TierLimits::new(2, 100));
/// tier.put("a", 1, 10);
/// tier.put("b", 2, 10);
/// tier.get(&"a"); // "a" is now most recently used
/// tier.put("c", 3, 10); // evicts "b"
///
/// assert!(tier.contains(&"a"));
/// assert!(!tier.contains(&"b"));
/// ```
pub struct CacheTier<K, V> {
    name: &'static str,
    state: Mutex<TierState<K, V>>,
}

impl<K, V> CacheTier<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an unnamed tier with the given limits
    pub fn new(limits: TierLimits) -> Self {
        Self::named("tier", limits)
    }

    /// Create a tier with a name used in log output
    pub fn named(name: &'static str, limits: TierLimits) -> Self {
        let mut state = TierState::new(limits);
        state.sync_stats();
        Self {
            name,
            state: Mutex::new(state),
        }
    }

    /// Name given at construction
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Look up a value, marking it most recently used on a hit
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock().unwrap();

        match state.entries.get(key).map(|entry| entry.value.clone()) {
            Some(value) => {
                state.touch(key);
                state.stats.hits += 1;
                Some(value)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Check whether a key is present without touching recency or stats
    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }

    /// Store a value with the given cost
    ///
    /// Older entries are evicted as needed; the entry being inserted is never
    /// the victim. An entry whose cost alone exceeds the cost limit (or any
    /// entry when the count limit is zero) cannot be held without breaking the
    /// limits and is not stored. Returns whether the value was stored.
    pub fn put(&self, key: K, value: V, cost: usize) -> bool {
        let mut state = self.state.lock().unwrap();

        // Replacing a key releases its old cost first
        state.take(&key);

        if cost > state.limits.cost || state.limits.count == 0 {
            state.sync_stats();
            tracing::debug!(
                target: "raidbook.cache",
                tier = self.name,
                cost,
                cost_limit = state.limits.cost,
                "entry exceeds tier limits, not cached"
            );
            return false;
        }

        state.evict_to_fit(1, cost);

        let tick = state.bump_tick();
        state.total_cost += cost;
        state.recency.insert(tick, key.clone());
        state.entries.insert(key, Entry { value, cost, tick });
        state.sync_stats();
        true
    }

    /// Remove a value
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock().unwrap();
        let removed = state.take(key).map(|entry| entry.value);
        state.sync_stats();
        removed
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        state.recency.clear();
        state.total_cost = 0;
        state.sync_stats();
    }

    /// Replace both limits, evicting immediately until compliant
    ///
    /// Returns the number of entries evicted.
    pub fn set_limits(&self, limits: TierLimits) -> usize {
        let mut state = self.state.lock().unwrap();
        state.limits = limits;
        let evicted = state.evict_to_fit(0, 0);
        state.sync_stats();
        evicted
    }

    /// Temporarily apply `squeezed` limits, then restore the previous ones
    ///
    /// The tier sheds its least recently used entries without losing
    /// capacity for later insertions. Returns the number of entries evicted.
    pub fn squeeze(&self, squeezed: TierLimits) -> usize {
        let mut state = self.state.lock().unwrap();
        let nominal = state.limits;
        state.limits = squeezed;
        let evicted = state.evict_to_fit(0, 0);
        state.limits = nominal;
        state.sync_stats();
        evicted
    }

    /// Current limits
    pub fn limits(&self) -> TierLimits {
        self.state.lock().unwrap().limits
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Whether the tier holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of live entry costs
    pub fn total_cost(&self) -> usize {
        self.state.lock().unwrap().total_cost
    }

    /// Keys ordered from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.state.lock().unwrap().recency.values().cloned().collect()
    }

    /// Snapshot of tier statistics
    pub fn stats(&self) -> TierStats {
        self.state.lock().unwrap().stats
    }
}
