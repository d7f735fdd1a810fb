//! Transaction coordination: scoped begin/commit/rollback with nesting,
//! timeouts, and deadlock retry.
//!
//! The coordinator owns the process-wide writer connection. Scopes are
//! driven with explicit `BEGIN`/`COMMIT`/`ROLLBACK` statements so they are
//! addressable by minted `txn_` ids across service calls — something a
//! borrowing transaction handle cannot express.
//!
//! ## Contract
//!
//! - `begin` joins the active scope (incrementing its depth) only when the
//!   caller is the worker that owns it — genuine reentrant nesting on the
//!   same call stack. An unrelated concurrent worker is never merged into
//!   a foreign scope: it waits for the writer slot to clear, bounded by
//!   its own timeout, and then surfaces a retryable busy error.
//! - Only the outermost `commit`/`rollback` touches the store. Nested
//!   levels never change state independently.
//! - Per-key advisory write locks ([`lock_keys`]) are an admission layer
//!   acquired *before* the writer slot: two workers targeting the same
//!   entity contend on the key and the loser sees a retryable busy error,
//!   while workers on unrelated keys simply queue on the writer slot.
//!   Keys are always taken before the slot, so the two waits cannot form
//!   a cycle.
//! - Every scope carries a deadline. The reaper (or the next `commit`/
//!   `rollback` on the scope) rolls an expired scope back exactly once,
//!   emits `TRANSACTION_TIMEOUT`, and subsequent calls on the id fail.
//! - Busy/locked/deadlock-class failures are retried with exponential
//!   backoff (`min(100 * 2^n, 1000)` ms, three attempts).
//! - Entity snapshots recorded during the scope are handed back on
//!   rollback so in-memory caches and indexes can be restored.
//!
//! Lock order is connection before coordinator state wherever both are
//! held at once; `begin` touches them strictly in sequence, and waiting
//! (key contention, writer-slot contention) never happens while holding
//! the connection.
//!
//! [`lock_keys`]: TxnCoordinator::lock_keys

use crate::libs::cancel::CancelToken;
use crate::libs::error::{CoreError, Result};
use crate::libs::events::{Event, EventBus, EventKind};
use crate::libs::ident::IdGenerator;
use crate::libs::task::Task;
use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Transparent retry ceiling for busy/locked failures.
pub const RETRY_ATTEMPTS: u32 = 3;

/// Remembered timed-out scope ids, so late calls can be told apart from
/// calls on ids that never existed.
const TIMEOUT_MEMORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Isolation {
    Deferred,
    Immediate,
    Exclusive,
}

impl Isolation {
    fn begin_sql(&self) -> &'static str {
        match self {
            Isolation::Deferred => "BEGIN DEFERRED",
            Isolation::Immediate => "BEGIN IMMEDIATE",
            Isolation::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TxnOptions {
    pub isolation: Isolation,
    pub timeout: Duration,
}

impl Default for TxnOptions {
    fn default() -> Self {
        Self {
            isolation: Isolation::Immediate,
            timeout: Duration::from_secs(30),
        }
    }
}

impl TxnOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn read_only() -> Self {
        Self {
            isolation: Isolation::Deferred,
            ..Self::default()
        }
    }
}

/// Entity snapshots recorded during a scope. `None` marks an entity that
/// did not exist before the scope (a tombstone for rollback purposes).
pub type Backups = HashMap<String, Option<Task>>;

struct ActiveTxn {
    id: String,
    depth: u32,
    /// Worker that opened the scope; only this worker's `begin` calls nest.
    owner: ThreadId,
    deadline: Instant,
    operations: Vec<String>,
    backups: Backups,
}

#[derive(Default)]
struct CoordinatorState {
    active: Option<ActiveTxn>,
    recent_timeouts: VecDeque<String>,
    committed: u64,
    rolled_back: u64,
    timeouts: u64,
}

impl CoordinatorState {
    fn remember_timeout(&mut self, id: String) {
        if self.recent_timeouts.len() >= TIMEOUT_MEMORY {
            self.recent_timeouts.pop_front();
        }
        self.recent_timeouts.push_back(id);
        self.timeouts += 1;
    }

    fn recently_timed_out(&self, id: &str) -> bool {
        self.recent_timeouts.iter().any(|t| t == id)
    }

    fn unknown_scope_error(&self, txn_id: &str) -> CoreError {
        if self.recently_timed_out(txn_id) {
            CoreError::TransactionTimeout { id: txn_id.to_string() }
        } else {
            CoreError::TransactionNotFound { id: txn_id.to_string() }
        }
    }
}

/// Coordinator statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TxnStats {
    pub active: bool,
    pub depth: u32,
    pub committed: u64,
    pub rolled_back: u64,
    pub timeouts: u64,
}

/// RAII holder of per-key advisory write locks. Dropping it releases the
/// keys and wakes contenders.
pub struct KeyLockGuard<'a> {
    coordinator: &'a TxnCoordinator,
    keys: Vec<String>,
}

impl std::fmt::Debug for KeyLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard").field("keys", &self.keys).finish()
    }
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let mut locks = self.coordinator.key_locks.lock();
        for key in &self.keys {
            locks.remove(key);
        }
    }
}

/// Scoped transaction coordinator over the shared writer connection.
pub struct TxnCoordinator {
    conn: Arc<Mutex<Connection>>,
    bus: Arc<EventBus>,
    ids: IdGenerator,
    state: Mutex<CoordinatorState>,
    /// Signalled whenever the writer slot clears.
    scope_released: Condvar,
    key_locks: Mutex<HashSet<String>>,
}

impl TxnCoordinator {
    pub fn new(conn: Arc<Mutex<Connection>>, bus: Arc<EventBus>) -> Self {
        Self {
            conn,
            bus,
            ids: IdGenerator::new(),
            state: Mutex::new(CoordinatorState::default()),
            scope_released: Condvar::new(),
            key_locks: Mutex::new(HashSet::new()),
        }
    }

    /// The shared writer connection, for read paths outside any scope.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Acquires per-key advisory write locks, all-or-nothing. Contended
    /// keys surface as a retryable busy error and nothing is held.
    ///
    /// Callers take their keys *before* opening the scope; that fixed
    /// ordering (keys, then writer slot) keeps the two waits acyclic.
    pub fn lock_keys(&self, keys: &[String]) -> Result<KeyLockGuard<'_>> {
        let normalized: BTreeSet<String> = keys.iter().map(|k| crate::libs::task::path::normalize(k)).collect();

        let mut locks = self.key_locks.lock();
        for key in &normalized {
            if locks.contains(key) {
                return Err(CoreError::StorageIo {
                    message: format!("entity locked by another scope: {key}"),
                    retryable: true,
                });
            }
        }
        for key in &normalized {
            locks.insert(key.clone());
        }

        Ok(KeyLockGuard {
            coordinator: self,
            keys: normalized.into_iter().collect(),
        })
    }

    /// Opens a scope and returns its id.
    ///
    /// If this worker already owns the active scope, the call is genuine
    /// reentrant nesting: the depth counter is incremented and the existing
    /// id returned. If a *different* worker owns it, the call waits for the
    /// slot to clear (bounded by `options.timeout`) and then fails with a
    /// retryable busy error — unrelated operations are never merged into a
    /// foreign scope.
    pub fn begin(&self, options: &TxnOptions) -> Result<String> {
        let owner = std::thread::current().id();
        let wait_deadline = Instant::now() + options.timeout;

        let id = {
            let mut state = self.state.lock();
            loop {
                let owned_by_me = matches!(state.active.as_ref(), Some(active) if active.owner == owner);
                if owned_by_me {
                    if let Some(active) = state.active.as_mut() {
                        active.depth += 1;
                        return Ok(active.id.clone());
                    }
                }
                if state.active.is_none() {
                    break;
                }
                // foreign scope holds the writer slot; wait, never merge
                if self.scope_released.wait_until(&mut state, wait_deadline).timed_out() {
                    return Err(CoreError::StorageIo {
                        message: "writer scope busy".to_string(),
                        retryable: true,
                    });
                }
            }

            // reserve the slot; contenders wait on it, so the store BEGIN
            // below can run without holding the state lock
            let id = self.ids.mint("txn");
            state.active = Some(ActiveTxn {
                id: id.clone(),
                depth: 1,
                owner,
                deadline: Instant::now() + options.timeout,
                operations: Vec::new(),
                backups: Backups::new(),
            });
            id
        };

        let begun = {
            let conn = self.conn.lock();
            conn.execute_batch(options.isolation.begin_sql())
        };
        if let Err(err) = begun {
            let mut state = self.state.lock();
            state.active = None;
            drop(state);
            self.scope_released.notify_all();
            return Err(err.into());
        }

        self.bus.publish(Event::new(
            EventKind::TransactionStarted,
            Some(id.clone()),
            serde_json::json!({ "isolation": options.isolation }),
        ));

        Ok(id)
    }

    /// Commits the scope. Nested levels only decrement; the outermost level
    /// performs the store commit. An expired scope is rolled back instead
    /// and reported as timed out.
    pub fn commit(&self, txn_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let mut state = self.state.lock();

        let missing = state.unknown_scope_error(txn_id);
        let active = match state.active.as_mut() {
            Some(active) if active.id == txn_id => active,
            _ => return Err(missing),
        };

        if Instant::now() > active.deadline {
            let (_, event) = rollback_active_locked(&conn, &mut state, true);
            drop(state);
            drop(conn);
            self.scope_released.notify_all();
            if let Some(event) = event {
                self.bus.publish(event);
            }
            return Err(CoreError::TransactionTimeout { id: txn_id.to_string() });
        }

        if active.depth > 1 {
            active.depth -= 1;
            return Ok(());
        }

        if let Err(err) = conn.execute_batch("COMMIT") {
            // the scope is unusable; fold it back and surface the failure
            let _ = rollback_active_locked(&conn, &mut state, false);
            drop(state);
            drop(conn);
            self.scope_released.notify_all();
            return Err(err.into());
        }

        state.active = None;
        state.committed += 1;
        drop(state);
        drop(conn);
        self.scope_released.notify_all();

        self.bus.publish(Event::new(EventKind::TransactionCommitted, Some(txn_id.to_string()), serde_json::json!({})));

        Ok(())
    }

    /// Rolls the scope back. Nested levels only decrement; the outermost
    /// level performs the store rollback and returns the recorded entity
    /// snapshots so callers can restore caches and indexes.
    pub fn rollback(&self, txn_id: &str) -> Result<Backups> {
        let conn = self.conn.lock();
        let mut state = self.state.lock();

        let missing = state.unknown_scope_error(txn_id);
        let active = match state.active.as_mut() {
            Some(active) if active.id == txn_id => active,
            _ => return Err(missing),
        };

        if active.depth > 1 {
            active.depth -= 1;
            return Ok(Backups::new());
        }

        let (backups, event) = rollback_active_locked(&conn, &mut state, false);
        drop(state);
        drop(conn);
        self.scope_released.notify_all();

        self.bus.publish(Event::new(EventKind::TransactionRolledBack, Some(txn_id.to_string()), serde_json::json!({})));
        if let Some(event) = event {
            self.bus.publish(event);
        }

        Ok(backups)
    }

    /// Records a pre-change snapshot of an entity inside the scope. The
    /// first snapshot per key wins, so the scope always restores to its
    /// entry state.
    pub fn record_backup(&self, txn_id: &str, key: &str, snapshot: Option<Task>) -> Result<()> {
        let mut state = self.state.lock();
        let missing = state.unknown_scope_error(txn_id);
        let active = match state.active.as_mut() {
            Some(active) if active.id == txn_id => active,
            _ => return Err(missing),
        };

        active.backups.entry(key.to_string()).or_insert(snapshot);
        Ok(())
    }

    /// Appends an operation label to the scope's ordered op log.
    pub fn record_op(&self, txn_id: &str, label: &str) -> Result<()> {
        let mut state = self.state.lock();
        let missing = state.unknown_scope_error(txn_id);
        let active = match state.active.as_mut() {
            Some(active) if active.id == txn_id => active,
            _ => return Err(missing),
        };
        active.operations.push(label.to_string());
        Ok(())
    }

    /// Runs `work` against the writer connection inside the scope the
    /// caller already opened.
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Runs a whole unit of work in its own scope: begin, work, commit,
    /// with transparent retry on busy/locked failures and rollback on any
    /// error. This is the entry point the services use; `work` must not
    /// open nested scopes through [`execute`] again (compose at the store
    /// level instead).
    ///
    /// [`execute`]: TxnCoordinator::execute
    pub fn execute<R>(&self, options: &TxnOptions, mut work: impl FnMut(&Connection) -> Result<R>) -> Result<R> {
        let mut attempt: u32 = 0;

        loop {
            let txn_id = match self.begin(options) {
                Ok(id) => id,
                Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    attempt += 1;
                    backoff(attempt);
                    continue;
                }
                Err(err) => return Err(err),
            };

            let result = {
                let conn = self.conn.lock();
                // the reaper may have expired the scope between begin and
                // here; never run work in autocommit mode
                if !self.is_active(&txn_id) {
                    Err(CoreError::TransactionTimeout { id: txn_id.clone() })
                } else {
                    work(&conn)
                }
            };

            match result {
                Ok(value) => match self.commit(&txn_id) {
                    Ok(()) => return Ok(value),
                    Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                        attempt += 1;
                        backoff(attempt);
                    }
                    Err(err) => return Err(err),
                },
                Err(err) => {
                    let _ = self.rollback(&txn_id);
                    if err.is_retryable() && attempt < RETRY_ATTEMPTS {
                        attempt += 1;
                        backoff(attempt);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    pub fn is_active(&self, txn_id: &str) -> bool {
        self.state.lock().active.as_ref().map(|a| a.id == txn_id).unwrap_or(false)
    }

    /// Rolls back the active scope when its deadline has passed. Invoked
    /// periodically by the reaper; returns whether a scope was reaped.
    pub fn reap_expired(&self) -> bool {
        let conn = self.conn.lock();
        let mut state = self.state.lock();
        let expired = state.active.as_ref().map(|a| Instant::now() > a.deadline).unwrap_or(false);
        if !expired {
            return false;
        }

        let (_, event) = rollback_active_locked(&conn, &mut state, true);
        drop(state);
        drop(conn);
        self.scope_released.notify_all();
        if let Some(event) = event {
            self.bus.publish(event);
        }
        true
    }

    /// Background loop rolling back expired scopes until cancelled.
    pub async fn run_reaper(&self, cancel: CancelToken, tick: Duration) {
        while !cancel.is_cancelled() {
            tokio::time::sleep(tick).await;
            if cancel.is_cancelled() {
                break;
            }
            self.reap_expired();
        }
    }

    pub fn stats(&self) -> TxnStats {
        let state = self.state.lock();
        TxnStats {
            active: state.active.is_some(),
            depth: state.active.as_ref().map(|a| a.depth).unwrap_or(0),
            committed: state.committed,
            rolled_back: state.rolled_back,
            timeouts: state.timeouts,
        }
    }
}

/// Rolls back the active scope. Caller holds both the connection and the
/// state lock (and notifies `scope_released` after dropping them). Returns
/// the recorded backups and, for timeouts, the TIMEOUT event to publish
/// once the locks are released.
fn rollback_active_locked(conn: &Connection, state: &mut CoordinatorState, timed_out: bool) -> (Backups, Option<Event>) {
    let active = match state.active.take() {
        Some(active) => active,
        None => return (Backups::new(), None),
    };

    // tolerate an already-closed transaction
    let _ = conn.execute_batch("ROLLBACK");

    state.rolled_back += 1;

    let event = if timed_out {
        state.remember_timeout(active.id.clone());
        tracing::warn!(txn = %active.id, ops = active.operations.len(), "transaction timed out, rolled back");
        Some(Event::new(
            EventKind::TransactionTimeout,
            Some(active.id.clone()),
            serde_json::json!({ "operations": active.operations.len() }),
        ))
    } else {
        None
    };

    (active.backups, event)
}

/// Exponential backoff: 100 ms, 200 ms, 400 ms, capped at 1 s.
fn backoff(attempt: u32) {
    let delay = (100u64 << (attempt.saturating_sub(1))).min(1000);
    std::thread::sleep(Duration::from_millis(delay));
}
