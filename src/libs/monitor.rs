//! Memory and cache pressure monitoring.
//!
//! A background loop samples process memory and cache occupancy on a fixed
//! interval and drives cache reduction when combined pressure crosses the
//! configured threshold.
//!
//! ## Pressure Model
//!
//! - `memory_pressure = max(0, (heap_ratio - 0.7) / 0.3)` where
//!   `heap_ratio` is process resident memory over the configured cache
//!   memory ceiling
//! - `cache_pressure = max(0, (cache_ratio - 0.6) / 0.4)` where
//!   `cache_ratio` is entry occupancy over the entry budget
//! - `total = 0.6 * memory + 0.4 * cache`
//!
//! When `total >= pressure_threshold` a reduction cycle evicts entries by
//! ascending recency until the cache is halved. If pressure is still above
//! the threshold after a full cycle, the result is recorded as
//! insufficient. Every cycle emits a `CACHE_CLEARED` event with
//! `{size_before, size_after, trigger}`.

use crate::libs::cache::QueryCache;
use crate::libs::cancel::CancelToken;
use crate::libs::config::CacheConfig;
use crate::libs::events::{Event, EventBus, EventKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::time::{sleep, Duration};

/// One pressure observation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PressureSample {
    pub heap_ratio: f64,
    pub cache_ratio: f64,
    pub memory_pressure: f64,
    pub cache_pressure: f64,
    pub total: f64,
}

/// Samples pressure and triggers cache reduction.
pub struct PressureMonitor {
    config: CacheConfig,
    cache: Arc<QueryCache>,
    bus: Arc<EventBus>,
    system: Mutex<System>,
}

impl PressureMonitor {
    pub fn new(config: CacheConfig, cache: Arc<QueryCache>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            cache,
            bus,
            system: Mutex::new(System::new()),
        }
    }

    /// Current resident memory of this process in bytes.
    fn process_memory(&self) -> u64 {
        let pid = Pid::from_u32(std::process::id());
        let mut system = self.system.lock();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, ProcessRefreshKind::nothing().with_memory());
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }

    /// Computes the current pressure sample.
    pub fn sample(&self) -> PressureSample {
        let heap_ratio = if self.cache.max_memory() == 0 {
            0.0
        } else {
            self.process_memory() as f64 / self.cache.max_memory() as f64
        };
        let cache_ratio = self.cache.fill_ratio();

        let memory_pressure = ((heap_ratio - 0.7) / 0.3).max(0.0);
        let cache_pressure = ((cache_ratio - 0.6) / 0.4).max(0.0);

        PressureSample {
            heap_ratio,
            cache_ratio,
            memory_pressure,
            cache_pressure,
            total: 0.6 * memory_pressure + 0.4 * cache_pressure,
        }
    }

    /// One monitor tick: sample, reduce when above threshold, resample,
    /// record insufficient reductions. Returns the sample that drove the
    /// decision.
    pub fn check_once(&self) -> PressureSample {
        let sample = self.sample();
        if sample.total < self.config.pressure_threshold {
            return sample;
        }

        tracing::info!(
            total = sample.total,
            memory = sample.memory_pressure,
            cache = sample.cache_pressure,
            "pressure above threshold, reducing cache"
        );

        let result = self.cache.reduce("pressure");
        let after = self.sample();
        if after.total >= self.config.pressure_threshold {
            self.cache.record_insufficient_reduction();
            tracing::warn!(total = after.total, "insufficient reduction, pressure still above threshold");
        }

        self.bus.publish(Event::new(
            EventKind::CacheCleared,
            None,
            serde_json::json!({
                "size_before": result.size_before,
                "size_after": result.size_after,
                "trigger": result.trigger,
            }),
        ));

        after
    }

    /// Background loop. Runs until the token is cancelled.
    pub async fn run(&self, cancel: CancelToken) {
        let interval = Duration::from_secs(self.config.check_interval_s.max(1));
        tracing::debug!(interval_s = self.config.check_interval_s, "pressure monitor started");

        while !cancel.is_cancelled() {
            sleep(interval).await;
            if cancel.is_cancelled() {
                break;
            }
            self.check_once();
        }

        tracing::debug!("pressure monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(max_entries: usize, threshold: f64) -> (Arc<QueryCache>, Arc<EventBus>, PressureMonitor) {
        let config = CacheConfig {
            max_entries,
            pressure_threshold: threshold,
            ..CacheConfig::default()
        };
        let cache = Arc::new(QueryCache::new(&config));
        let bus = Arc::new(EventBus::default());
        let monitor = PressureMonitor::new(config, cache.clone(), bus.clone());
        (cache, bus, monitor)
    }

    #[test]
    fn below_threshold_is_a_no_op() {
        let (cache, bus, monitor) = fixture(1000, 0.8);
        cache.put("k", serde_json::json!(1), 1, vec!["e".into()]);

        monitor.check_once();
        assert_eq!(cache.len(), 1);
        assert_eq!(bus.published(), 0);
    }

    #[test]
    fn full_cache_triggers_reduction_and_event() {
        // tiny budget so cache_ratio alone crosses the threshold
        let (cache, bus, monitor) = fixture(32, 0.1);
        for i in 0..32 {
            cache.put(&format!("k{i}"), serde_json::json!(i), 1, vec![format!("e{i}")]);
        }

        let before = cache.len();
        monitor.check_once();
        assert!(cache.len() <= before / 2 + 1);
        assert_eq!(bus.published(), 1);
        let event = &bus.recent(1)[0];
        assert_eq!(event.payload["trigger"], "pressure");
    }
}
