//! Keyed read-through result cache with dependency-based invalidation.
//!
//! Fronts the store for single-entity and small list reads. Keys are
//! fingerprints of `(operation, normalized arguments)`; every entry carries
//! the entity version it was computed from and the set of entity keys it
//! depends on. Any committed write invalidates all entries whose dependency
//! set contains the written entity, so the cache never serves a value older
//! than the latest committed version for its key.
//!
//! The cache is sharded; each bucket is an independent LRU behind its own
//! lock, so invalidation and reads contend only per bucket.

use crate::libs::config::CacheConfig;
use crate::libs::task::path;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;

const SHARDS: usize = 16;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    /// Version of the primary entity at compute time.
    version: i64,
    /// Normalized entity keys this entry was derived from.
    deps: Vec<String>,
    /// Rough serialized size used for the memory ratio.
    approx_bytes: usize,
}

/// Outcome of a reduction cycle.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReductionResult {
    pub size_before: usize,
    pub size_after: usize,
    pub trigger: String,
    /// Set when a full cycle failed to bring pressure below the threshold.
    pub insufficient: bool,
}

/// Cache observability counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub invalidations: u64,
    /// Reduction cycles grouped by trigger.
    pub cleanups: BTreeMap<String, u64>,
    pub reductions: u64,
    pub last_reduction: Option<ReductionResult>,
}

#[derive(Default)]
struct MetricsInner {
    hits: u64,
    misses: u64,
    invalidations: u64,
    cleanups: BTreeMap<String, u64>,
    reductions: u64,
    last_reduction: Option<ReductionResult>,
}

/// Sharded LRU result cache.
pub struct QueryCache {
    shards: Vec<Mutex<LruCache<String, CacheEntry>>>,
    per_shard_capacity: usize,
    max_entries: usize,
    max_memory: u64,
    debug_mode: bool,
    metrics: Mutex<MetricsInner>,
}

impl QueryCache {
    pub fn new(config: &CacheConfig) -> Self {
        let per_shard = NonZeroUsize::new(config.max_entries / SHARDS).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..SHARDS).map(|_| Mutex::new(LruCache::new(per_shard))).collect();

        Self {
            shards,
            per_shard_capacity: per_shard.get(),
            max_entries: config.max_entries,
            max_memory: config.max_memory,
            debug_mode: config.debug_mode,
            metrics: Mutex::new(MetricsInner::default()),
        }
    }

    /// Stable key for `(operation, arguments)`.
    pub fn fingerprint(operation: &str, args: &serde_json::Value) -> String {
        format!("{operation}:{args}")
    }

    fn shard(&self, key: &str) -> &Mutex<LruCache<String, CacheEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let hit = self.shard(key).lock().get(key).map(|entry| entry.value.clone());

        let mut metrics = self.metrics.lock();
        if hit.is_some() {
            metrics.hits += 1;
        } else {
            metrics.misses += 1;
        }
        drop(metrics);

        if self.debug_mode {
            tracing::debug!(key, hit = hit.is_some(), "cache lookup");
        }
        hit
    }

    /// Version of the entry, for staleness checks in tests and repair.
    pub fn get_version(&self, key: &str) -> Option<i64> {
        self.shard(key).lock().peek(key).map(|entry| entry.version)
    }

    /// Inserts a computed result. `deps` are the entity keys (paths or ids)
    /// whose mutation must invalidate this entry; the primary key itself
    /// should always be among them.
    pub fn put(&self, key: &str, value: serde_json::Value, version: i64, deps: Vec<String>) {
        let approx_bytes = value.to_string().len();
        let entry = CacheEntry {
            value,
            version,
            deps: deps.iter().map(|d| path::normalize(d)).collect(),
            approx_bytes,
        };
        self.shard(key).lock().put(key.to_string(), entry);
    }

    /// Removes every entry depending on `entity_key`. Returns the number of
    /// entries dropped.
    pub fn invalidate_entity(&self, entity_key: &str) -> usize {
        let needle = path::normalize(entity_key);
        let mut dropped = 0;

        for shard in &self.shards {
            let mut shard = shard.lock();
            let stale: Vec<String> = shard
                .iter()
                .filter(|(_, entry)| entry.deps.iter().any(|d| d == &needle))
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                shard.pop(&key);
                dropped += 1;
            }
        }

        if dropped > 0 {
            self.metrics.lock().invalidations += dropped as u64;
            if self.debug_mode {
                tracing::debug!(entity = entity_key, dropped, "cache invalidation");
            }
        }
        dropped
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Occupancy ratio against the configured entry budget.
    pub fn fill_ratio(&self) -> f64 {
        if self.max_entries == 0 {
            return 0.0;
        }
        self.len() as f64 / self.max_entries as f64
    }

    /// Rough memory footprint of cached values in bytes.
    pub fn approx_bytes(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.lock().iter().map(|(_, e)| e.approx_bytes as u64).sum::<u64>())
            .sum()
    }

    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    /// Evicts entries by ascending recency until the total size is halved.
    /// The caller decides whether the cycle was sufficient and marks the
    /// result accordingly.
    pub fn reduce(&self, trigger: &str) -> ReductionResult {
        let size_before = self.len();
        let target = size_before / 2;

        // pop least-recently-used per shard until the global target holds
        let mut remaining = size_before;
        'outer: while remaining > target {
            let mut evicted_any = false;
            for shard in &self.shards {
                if remaining <= target {
                    break 'outer;
                }
                if shard.lock().pop_lru().is_some() {
                    remaining -= 1;
                    evicted_any = true;
                }
            }
            if !evicted_any {
                break;
            }
        }

        let result = ReductionResult {
            size_before,
            size_after: self.len(),
            trigger: trigger.to_string(),
            insufficient: false,
        };

        let mut metrics = self.metrics.lock();
        metrics.reductions += 1;
        *metrics.cleanups.entry(trigger.to_string()).or_default() += 1;
        metrics.last_reduction = Some(result.clone());

        result
    }

    /// Marks the last reduction as insufficient (pressure stayed above the
    /// threshold for a full cycle).
    pub fn record_insufficient_reduction(&self) {
        let mut metrics = self.metrics.lock();
        if let Some(last) = metrics.last_reduction.as_mut() {
            last.insufficient = true;
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        let metrics = self.metrics.lock();
        let lookups = metrics.hits + metrics.misses;
        CacheMetrics {
            hits: metrics.hits,
            misses: metrics.misses,
            hit_ratio: if lookups == 0 { 0.0 } else { metrics.hits as f64 / lookups as f64 },
            invalidations: metrics.invalidations,
            cleanups: metrics.cleanups.clone(),
            reductions: metrics.reductions,
            last_reduction: metrics.last_reduction.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.per_shard_capacity * SHARDS
    }
}
