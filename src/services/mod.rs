//! High-level services composing the storage core.
//!
//! [`CoreContext`] is the single value threaded through the process: it
//! builds the component graph in dependency order (identifiers and clock,
//! event bus, durable store, transaction coordinator, secondary indexes,
//! validation pipeline, cache, services) with explicit injection — no
//! globals. The admission [`Gate`] bounds in-flight operations; excess
//! callers wait up to the acquire timeout and then fail with OVERLOAD.

pub mod knowledge;
pub mod tasks;

use crate::db::backup::{self, BackupScheduler, SnapshotManifest};
use crate::db::db::Db;
use crate::db::index::coordinator::IndexCoordinator;
use crate::db::tasks::TaskStore;
use crate::db::transaction::{TxnCoordinator, TxnOptions};
use crate::libs::cache::QueryCache;
use crate::libs::cancel::CancelToken;
use crate::libs::config::Config;
use crate::libs::error::{CoreError, Result};
use crate::libs::events::{Event, EventBus, EventKind};
use crate::libs::ident::MonotonicClock;
use crate::libs::monitor::PressureMonitor;
use crate::libs::tracer::Tracer;
use crate::libs::validation::{Mode, Pipeline};
use knowledge::KnowledgeService;
use parking_lot::{Condvar, Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tasks::TaskService;

/// Counting admission gate with a bounded wait.
pub struct Gate {
    in_flight: Mutex<usize>,
    released: Condvar,
    max: usize,
    acquire_timeout: Duration,
}

/// RAII permit; dropping it releases the slot.
pub struct GatePermit<'a> {
    gate: &'a Gate,
}

impl Gate {
    pub fn new(max: usize, acquire_timeout: Duration) -> Self {
        Self {
            in_flight: Mutex::new(0),
            released: Condvar::new(),
            max: max.max(1),
            acquire_timeout,
        }
    }

    /// Waits for a slot up to the acquire timeout; failure is OVERLOAD.
    pub fn acquire(&self) -> Result<GatePermit<'_>> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut in_flight = self.in_flight.lock();

        while *in_flight >= self.max {
            if self.released.wait_until(&mut in_flight, deadline).timed_out() {
                return Err(CoreError::Overload);
            }
        }

        *in_flight += 1;
        Ok(GatePermit { gate: self })
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock()
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.gate.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        self.gate.released.notify_one();
    }
}

/// The assembled core: every component plus the public services.
pub struct CoreContext {
    pub config: Config,
    pub db: Arc<Db>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<MonotonicClock>,
    pub txn: Arc<TxnCoordinator>,
    pub indexes: Arc<IndexCoordinator>,
    pub cache: Arc<QueryCache>,
    pub tracer: Arc<Tracer>,
    pub gate: Arc<Gate>,
    pub tasks: TaskService,
    pub knowledge: KnowledgeService,
}

impl CoreContext {
    /// Builds the component graph in dependency order and rebuilds the
    /// secondary indexes from the store.
    pub fn build(config: Config) -> Result<Arc<Self>> {
        let clock = Arc::new(MonotonicClock::new());
        let bus = Arc::new(EventBus::default());
        let tracer = Arc::new(Tracer::new(config.tracer.clone()));

        let db = Arc::new(Db::open(&config.storage)?);
        let txn = Arc::new(TxnCoordinator::new(db.conn.clone(), bus.clone()));

        let indexes = Arc::new(IndexCoordinator::new(config.service.atomic_indexes));
        {
            let conn = db.conn.lock();
            let tasks = TaskStore::list_all(&conn)?;
            indexes.rebuild(&tasks)?;
        }

        let pipeline = Arc::new(RwLock::new(Pipeline::standard(config.service.allow_rule_mutation)));
        let cache = Arc::new(QueryCache::new(&config.cache));
        let gate = Arc::new(Gate::new(
            config.service.max_in_flight,
            Duration::from_secs(config.storage.connection.acquire_timeout_s),
        ));

        let mode = Mode::parse(&config.service.validation_mode).unwrap_or(Mode::Strict);
        let txn_timeout = Duration::from_millis(config.service.txn_timeout_ms);

        let tasks = TaskService::new(
            txn.clone(),
            indexes.clone(),
            cache.clone(),
            bus.clone(),
            tracer.clone(),
            clock.clone(),
            pipeline,
            gate.clone(),
            mode,
            txn_timeout,
        );
        let knowledge = KnowledgeService::new(
            txn.clone(),
            cache.clone(),
            bus.clone(),
            tracer.clone(),
            clock.clone(),
            gate.clone(),
            txn_timeout,
        );

        Ok(Arc::new(Self {
            config,
            db,
            bus,
            clock,
            txn,
            indexes,
            cache,
            tracer,
            gate,
            tasks,
            knowledge,
        }))
    }

    /// Writes a consistent snapshot of the whole store to `target`.
    pub fn export(&self, target: &Path) -> Result<SnapshotManifest> {
        let manifest = self.txn.execute(&TxnOptions::read_only(), |conn| backup::export(conn, target))?;

        self.bus.publish(Event::new(
            EventKind::BackupCompleted,
            None,
            serde_json::json!({ "tasks": manifest.task_count, "knowledge": manifest.knowledge_count }),
        ));
        Ok(manifest)
    }

    /// Restores a snapshot, replacing the current store contents, then
    /// rebuilds indexes and drops the cache.
    pub fn import(&self, source: &Path) -> Result<SnapshotManifest> {
        let manifest = self.txn.execute(&TxnOptions::default(), |conn| backup::import(conn, source))?;

        {
            let conn = self.db.conn.lock();
            let tasks = TaskStore::list_all(&conn)?;
            self.indexes.rebuild(&tasks)?;
        }
        self.cache.clear();

        Ok(manifest)
    }

    /// Spawns the background loops: transaction reaper, pressure monitor,
    /// store maintenance, scheduled backups. Returns the token that stops
    /// them all.
    pub fn spawn_background(self: &Arc<Self>) -> CancelToken {
        let cancel = CancelToken::new();

        // transaction reaper
        {
            let context = self.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                context.txn.run_reaper(token, Duration::from_millis(250)).await;
            });
        }

        // pressure monitor
        {
            let monitor = PressureMonitor::new(self.config.cache.clone(), self.cache.clone(), self.bus.clone());
            let token = cancel.clone();
            tokio::spawn(async move {
                monitor.run(token).await;
            });
        }

        // checkpoint / vacuum / tracer retention
        {
            let context = self.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                context.run_maintenance(token).await;
            });
        }

        // scheduled backups
        if self.config.backup.enabled {
            let context = self.clone();
            let token = cancel.clone();
            let scheduler = BackupScheduler::new(self.config.backup.clone(), self.db.base_dir());

            if self.config.backup.backup_on_start {
                let target = scheduler.archive_path();
                if let Err(err) = self.export(&target) {
                    tracing::error!(error = %err, "startup backup failed");
                }
            }

            tokio::spawn(async move {
                let exporter = |target: &Path| context.export(target);
                scheduler.run(token, exporter).await;
            });
        }

        cancel
    }

    /// Periodic store maintenance: WAL checkpoints, vacuum, and tracer
    /// cleanup on their configured intervals.
    pub async fn run_maintenance(&self, cancel: CancelToken) {
        let checkpoint_every = Duration::from_secs(self.config.storage.performance.checkpoint_interval_s.max(1));
        let vacuum_every = Duration::from_secs(self.config.storage.performance.vacuum_interval_s.max(1));
        let cleanup_every = Duration::from_secs(self.config.tracer.cleanup_interval_s.max(1));

        let mut last_checkpoint = Instant::now();
        let mut last_vacuum = Instant::now();
        let mut last_cleanup = Instant::now();

        while !cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if cancel.is_cancelled() {
                break;
            }

            if last_checkpoint.elapsed() >= checkpoint_every {
                last_checkpoint = Instant::now();
                match self.db.checkpoint() {
                    Ok(result) => tracing::debug!(frames = result.checkpointed_frames, "periodic checkpoint"),
                    Err(err) => tracing::warn!(error = %err, "periodic checkpoint failed"),
                }
            }

            if last_vacuum.elapsed() >= vacuum_every {
                last_vacuum = Instant::now();
                if let Err(err) = self.db.vacuum() {
                    tracing::warn!(error = %err, "periodic vacuum failed");
                }
            }

            if last_cleanup.elapsed() >= cleanup_every {
                last_cleanup = Instant::now();
                let dropped = self.tracer.cleanup();
                if dropped > 0 {
                    tracing::debug!(dropped, "trace retention cleanup");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_admits_up_to_capacity() {
        let gate = Gate::new(2, Duration::from_millis(10));
        let a = gate.acquire().unwrap();
        let _b = gate.acquire().unwrap();
        assert_eq!(gate.in_flight(), 2);

        // full: third caller times out with OVERLOAD
        assert!(matches!(gate.acquire(), Err(CoreError::Overload)));

        drop(a);
        assert!(gate.acquire().is_ok());
    }
}
