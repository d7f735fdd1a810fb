//! High-level task service: the public mutation and query API over the
//! storage core.
//!
//! This module is the single place where the storage building blocks —
//! transaction coordinator, durable store, secondary indexes, validation
//! pipeline, cache, event bus, tracer — compose into caller-facing
//! operations. Every mutation follows one orchestration contract, and a
//! partially applied change is never observable from outside.
//!
//! ## Orchestration Contract
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌───────────┐   ┌──────────────┐
//! │ admission │──▶│  trace  │──▶│ key locks │──▶│  open scope  │
//! │   gate    │   │  start  │   │ (per-key) │   │ (coordinator)│
//! └──────────┘   └─────────┘   └───────────┘   └──────┬───────┘
//!                                                     │
//!                              ┌──────────────────────▼────────┐
//!                              │ validate → write store →      │
//!                              │ coordinate indexes →          │
//!                              │ invalidate cache              │
//!                              └──────────────────────┬────────┘
//!                                                     │
//!                    success ─────────────────────────┼───────── failure
//!                       │                                           │
//!               ┌───────▼────────┐                       ┌──────────▼─────────┐
//!               │ commit scope,  │                       │ roll back scope,   │
//!               │ publish events │                       │ restore projections│
//!               └────────────────┘                       │ from backups       │
//!                                                        └────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Operations run on a parallel worker pool. Two layers serialize them:
//!
//! - **Per-key advisory locks**: every write scope first claims the entity
//!   keys it will touch (all-or-nothing). Two workers aiming at the same
//!   key contend here, and the loser receives a retryable busy error that
//!   the scope loop absorbs with exponential backoff.
//! - **The writer slot**: SQLite under WAL has a single writer, so scopes
//!   on *unrelated* keys queue on the coordinator's writer slot. A worker
//!   is never merged into another worker's scope — only genuine reentrant
//!   calls on the same worker nest.
//!
//! Subtree operations (`move_task`, `delete_task`) lock the *entire*
//! affected subtree: the path set is peeked outside the scope, every path
//! is claimed, and the authoritative subtree collected inside the scope is
//! verified against the claimed set. If the subtree grew in between, the
//! scope retries with a freshly peeked set.
//!
//! ## Failure Semantics
//!
//! Any error aborts the scope: the store transaction rolls back, and the
//! in-memory projections (indexes, cache) are restored from the snapshots
//! recorded during the scope. Lifecycle events are only published once the
//! scope has committed, so listeners never observe events for rolled-back
//! work.

use crate::db::bulk::{BulkOp, BulkOptions, BulkPayload, BulkProcessor, BulkReport};
use crate::db::index::coordinator::IndexCoordinator;
use crate::db::index::IndexQuery;
use crate::db::tasks::TaskStore;
use crate::db::transaction::{Backups, TxnCoordinator, TxnOptions, RETRY_ATTEMPTS};
use crate::libs::cache::QueryCache;
use crate::libs::cancel::CancelToken;
use crate::libs::error::{CoreError, Result};
use crate::libs::events::{Event, EventBus, EventKind};
use crate::libs::ident::{IdGenerator, MonotonicClock};
use crate::libs::task::{
    self, path, Note, NoteCategory, Page, Pagination, Task, TaskFilter, TaskPatch, TaskStatus,
};
use crate::libs::tracer::Tracer;
use crate::libs::validation::{Candidate, Mode, Pipeline, ValidationView};
use crate::services::Gate;
use parking_lot::RwLock;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Deletion strategies for `delete_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteStrategy {
    /// Recursively remove the whole subtree.
    Cascade,
    /// Fail when children exist.
    Block,
}

/// Result of a deletion: every removed path, children before ancestors.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub deleted: Vec<String>,
}

/// Validation view backed by the live connection, so uncommitted writes of
/// the enclosing scope are visible to later checks (bulk batches rely on
/// this).
struct StoreView<'a> {
    conn: &'a Connection,
}

impl ValidationView for StoreView<'_> {
    fn get(&self, key: &str) -> Option<Task> {
        TaskStore::get(self.conn, key).ok().flatten()
    }

    fn children_of(&self, parent_path: &str) -> Vec<String> {
        TaskStore::get_children(self.conn, parent_path)
            .map(|children| children.into_iter().map(|t| t.path).collect())
            .unwrap_or_default()
    }

    fn dependents_of(&self, key: &str) -> Vec<String> {
        TaskStore::get_dependents(self.conn, key)
            .map(|dependents| dependents.into_iter().map(|t| t.path).collect())
            .unwrap_or_default()
    }
}

pub struct TaskService {
    txn: Arc<TxnCoordinator>,
    indexes: Arc<IndexCoordinator>,
    cache: Arc<QueryCache>,
    bus: Arc<EventBus>,
    tracer: Arc<Tracer>,
    clock: Arc<MonotonicClock>,
    ids: IdGenerator,
    pipeline: Arc<RwLock<Pipeline>>,
    gate: Arc<Gate>,
    mode: Mode,
    txn_timeout: Duration,
}

impl TaskService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        txn: Arc<TxnCoordinator>,
        indexes: Arc<IndexCoordinator>,
        cache: Arc<QueryCache>,
        bus: Arc<EventBus>,
        tracer: Arc<Tracer>,
        clock: Arc<MonotonicClock>,
        pipeline: Arc<RwLock<Pipeline>>,
        gate: Arc<Gate>,
        mode: Mode,
        txn_timeout: Duration,
    ) -> Self {
        Self {
            txn,
            indexes,
            cache,
            bus,
            tracer,
            clock,
            ids: IdGenerator::new(),
            pipeline,
            gate,
            mode,
            txn_timeout,
        }
    }

    /// Creates a new task from a draft and persists it atomically.
    ///
    /// The draft supplies the caller-controlled attributes (path, name,
    /// type, status, priority, dependencies, tags, metadata); identity and
    /// bookkeeping are assigned here. The operation is the canonical
    /// instance of the orchestration contract described in the module
    /// documentation.
    ///
    /// ## Automatic Field Handling
    ///
    /// - **ID Assignment**: a `task_` prefixed id is minted for the row
    /// - **Parent Derivation**: `parentPath` is derived from the path, so a
    ///   draft can never disagree with its own position in the hierarchy
    /// - **Timestamps**: creation and update stamps come from the monotonic
    ///   clock
    /// - **Versioning**: the stored version starts at 1
    ///
    /// ## Validation
    ///
    /// The full rule pipeline runs against the prepared task before any
    /// write: schema bounds, parent existence and depth, sibling name
    /// uniqueness, dependency existence and acyclicity, and the status
    /// rules for tasks created directly in COMPLETED.
    ///
    /// # Arguments
    ///
    /// * `draft` - Task draft, typically from [`Task::draft`]
    ///
    /// # Returns
    ///
    /// Returns the fully materialized task as stored, including its minted
    /// id and version.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use taskhive::libs::task::{Task, TaskType};
    /// # use taskhive::libs::config::Config;
    /// # use taskhive::services::CoreContext;
    /// # let core = CoreContext::build(Config::default())?;
    ///
    /// let created = core.tasks.create_task(Task::draft("proj/api", "API", TaskType::Milestone))?;
    /// assert!(created.id.starts_with("task_"));
    /// assert_eq!(created.version, 1);
    /// # taskhive::libs::error::Result::Ok(())
    /// ```
    ///
    /// # Error Scenarios
    ///
    /// - **DUPLICATE_NAME**: the path is already taken, or a sibling under
    ///   the same parent carries the same (case-insensitive) name
    /// - **NOT_FOUND**: the derived parent path does not exist
    /// - **VALIDATION**: path syntax, depth, field lengths, or metadata
    ///   bounds are violated
    /// - **LIMIT_EXCEEDED / DEPENDENCY_CYCLE**: the draft's dependency set
    ///   breaks the budget or would close a cycle
    /// - **OVERLOAD**: the admission gate is saturated
    pub fn create_task(&self, draft: Task) -> Result<Task> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("create_task");

        let result = self.with_scope(&[draft.path.clone()], |service, conn, txn_id, events| {
            service.create_in_scope(conn, txn_id, draft.clone(), events)
        });

        self.finish(&trace, result)
    }

    /// Looks a task up by path or id, read-through cached. The returned
    /// task carries its ordered `subtasks` derived from the hierarchy
    /// index. Cache entries are invalidated by any committed write to the
    /// task, so a stale value is never served.
    pub fn get_task(&self, key: &str) -> Result<Task> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("get_task");

        let fingerprint = QueryCache::fingerprint("get_task", &serde_json::json!({ "key": path::normalize(key) }));
        if let Some(cached) = self.cache.get(&fingerprint) {
            let task: Task = serde_json::from_value(cached)?;
            self.tracer.end(&trace);
            return Ok(task);
        }

        let result = (|| {
            let mut task = self
                .txn
                .with_conn(|conn| TaskStore::get(conn, key))?
                .ok_or_else(|| CoreError::NotFound { key: key.to_string() })?;
            task.subtasks = self.indexes.hierarchy.children_of(&task.path);

            let mut deps = vec![task.path.clone(), task.id.clone()];
            if let Some(parent) = &task.parent_path {
                deps.push(parent.clone());
            }
            self.cache.put(&fingerprint, serde_json::to_value(&task)?, task.version, deps);
            Ok(task)
        })();

        self.finish(&trace, result)
    }

    /// Pages through tasks matching the filter. The index planner answers
    /// status/type filters; the rest narrows on the fetched rows.
    pub fn query_tasks(&self, filter: &TaskFilter, pagination: Pagination) -> Result<Page<Task>> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("query_tasks");

        let result = (|| {
            let planned = self.indexes.query(&IndexQuery {
                key: None,
                status: filter.status,
                task_type: filter.task_type,
                parent: filter.parent_path.clone(),
            });

            let mut tasks = self.txn.with_conn(|conn| TaskStore::get_by_id_list(conn, &planned.ids))?;

            tasks.retain(|task| Self::matches_filter(task, filter));
            tasks.sort_by(|a, b| path::normalize(&a.path).cmp(&path::normalize(&b.path)));

            let total = tasks.len();
            let pagination = pagination.clamped();
            let items: Vec<Task> = tasks.into_iter().skip(pagination.offset).take(pagination.limit).collect();

            Ok(Page::new(items, total, pagination))
        })();

        self.finish(&trace, result)
    }

    /// Applies a partial update. The stored version is incremented and the
    /// full post-change state is validated before anything lands.
    pub fn update_task(&self, key: &str, patch: &TaskPatch) -> Result<Task> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("update_task");

        let result = self.with_scope(&[key.to_string()], |service, conn, txn_id, events| {
            service.update_in_scope(conn, txn_id, key, patch, events)
        });

        self.finish(&trace, result)
    }

    /// Transitions a task's status, enforcing the transition table and the
    /// dependency completion guard, then re-evaluates direct dependents
    /// (blocked dependents whose dependencies all completed are released to
    /// PENDING).
    pub fn change_status(&self, key: &str, status: TaskStatus) -> Result<Task> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("change_status");

        let result = self.with_scope(&[key.to_string()], |service, conn, txn_id, events| {
            let patch = TaskPatch {
                status: Some(status),
                ..TaskPatch::default()
            };
            let updated = service.update_in_scope(conn, txn_id, key, &patch, events)?;

            if status == TaskStatus::Completed {
                service.release_blocked_dependents(conn, txn_id, &updated.path, events)?;
            }
            Ok(updated)
        });

        self.finish(&trace, result)
    }

    /// Adds a dependency edge. The 51st dependency fails LIMIT_EXCEEDED;
    /// cycles and missing targets are rejected by the pipeline.
    pub fn add_dependency(&self, key: &str, dependency: &str) -> Result<Task> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("add_dependency");

        let result = self.with_scope(&[key.to_string()], |service, conn, txn_id, events| {
            let existing = service.must_get(conn, key)?;

            let mut dependencies = existing.dependencies.clone();
            let normalized = path::normalize(dependency);
            if dependencies.iter().any(|d| path::normalize(d) == normalized) {
                return Ok(existing);
            }
            if dependencies.len() >= task::MAX_DEPENDENCIES {
                return Err(CoreError::LimitExceeded {
                    what: "dependencies",
                    limit: task::MAX_DEPENDENCIES,
                    actual: dependencies.len() + 1,
                });
            }
            dependencies.push(dependency.to_string());

            let patch = TaskPatch {
                dependencies: Some(dependencies),
                ..TaskPatch::default()
            };
            service.update_in_scope(conn, txn_id, key, &patch, events)
        });

        self.finish(&trace, result)
    }

    /// Removes a dependency edge; absent edges are a no-op.
    pub fn remove_dependency(&self, key: &str, dependency: &str) -> Result<Task> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("remove_dependency");

        let result = self.with_scope(&[key.to_string()], |service, conn, txn_id, events| {
            let existing = service.must_get(conn, key)?;
            let normalized = path::normalize(dependency);
            let dependencies: Vec<String> = existing
                .dependencies
                .iter()
                .filter(|d| path::normalize(d) != normalized)
                .cloned()
                .collect();
            if dependencies.len() == existing.dependencies.len() {
                return Ok(existing);
            }

            let patch = TaskPatch {
                dependencies: Some(dependencies),
                ..TaskPatch::default()
            };
            service.update_in_scope(conn, txn_id, key, &patch, events)
        });

        self.finish(&trace, result)
    }

    /// Appends a categorized note, bounded by the per-task note budget.
    pub fn add_note(&self, key: &str, category: NoteCategory, content: &str) -> Result<Task> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("add_note");

        let result = self.with_scope(&[key.to_string()], |service, conn, txn_id, events| {
            let mut existing = service.must_get(conn, key)?;

            if existing.notes.len() >= task::MAX_NOTES {
                return Err(CoreError::LimitExceeded {
                    what: "notes",
                    limit: task::MAX_NOTES,
                    actual: existing.notes.len() + 1,
                });
            }
            if content.chars().count() > task::MAX_NOTE_LEN {
                return Err(CoreError::LimitExceeded {
                    what: "note length",
                    limit: task::MAX_NOTE_LEN,
                    actual: content.chars().count(),
                });
            }

            service.txn.record_backup(txn_id, &existing.path, Some(existing.clone()))?;

            let note = Note {
                id: Some(service.ids.mint("note")),
                category,
                content: content.to_string(),
                created_ms: service.clock.now_ms(),
            };
            TaskStore::insert_note(conn, &existing.id, &note)?;

            existing.notes.push(note);
            existing.updated_ms = service.clock.now_ms();
            existing.version += 1;
            let affected = TaskStore::update(conn, &existing)?;
            if affected == 0 {
                return Err(CoreError::NotFound { key: key.to_string() });
            }

            service.indexes.upsert(&existing)?;
            service.invalidate(&existing);
            events.push(Event::new(
                EventKind::TaskUpdated,
                Some(existing.path.clone()),
                serde_json::json!({ "note": existing.notes.len() }),
            ));

            Ok(existing)
        });

        self.finish(&trace, result)
    }

    /// Moves a task and its entire subtree under a new parent, rewriting
    /// every descendant path.
    ///
    /// ## Subtree Locking
    ///
    /// The set of affected paths is peeked outside the scope and claimed
    /// as advisory key locks — the moved root, every current descendant,
    /// the target path, and the target parent. Inside the scope the
    /// authoritative subtree is collected again and verified against the
    /// claimed set; if a descendant appeared in the window between peek
    /// and lock, the scope fails with a retryable busy error and the whole
    /// operation re-peeks a fresh set.
    ///
    /// ## Rewrite Order
    ///
    /// Parents are rewritten before their children so every hierarchy
    /// check along the way sees the moved parent already in place. Each
    /// rewritten task is validated, snapshot for rollback, and re-indexed.
    ///
    /// # Arguments
    ///
    /// * `key` - Path or id of the task to move
    /// * `new_parent` - Target parent path, or `None` to move to the root
    ///
    /// # Returns
    ///
    /// Returns the moved task at its new path.
    ///
    /// # Error Scenarios
    ///
    /// - **NOT_FOUND**: the task or the target parent does not exist
    /// - **CONFLICT**: the target parent lies inside the moved subtree
    /// - **DUPLICATE_NAME**: a sibling at the target already carries the
    ///   task's name
    /// - **VALIDATION**: a rewritten descendant would exceed the maximum
    ///   hierarchy depth
    pub fn move_task(&self, key: &str, new_parent: Option<&str>) -> Result<Task> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("move_task");

        let mut attempt: u32 = 0;
        let result = loop {
            let keys = match self.peek_move_keys(key, new_parent) {
                Ok(keys) => keys,
                Err(err) => break Err(err),
            };

            let outcome = self.with_scope(&keys, |service, conn, txn_id, events| {
                service.move_in_scope(conn, txn_id, key, new_parent, &keys, events)
            });

            match outcome {
                Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    // the subtree changed while we were locking it; peek a
                    // fresh path set and try again
                    attempt += 1;
                    continue;
                }
                other => break other,
            }
        };

        self.finish(&trace, result)
    }

    /// Deletes a task.
    ///
    /// `Block` fails when direct children exist; `Cascade` removes the
    /// whole subtree, children before ancestors, reporting every removed
    /// path. Dependents outside the removed subtree always fail the
    /// operation and are reported.
    ///
    /// ## Subtree Locking
    ///
    /// Exactly as for [`move_task`]: the subtree's path set is peeked
    /// outside the scope, claimed as advisory key locks, and re-verified
    /// against the authoritative subtree inside the scope. A subtree that
    /// grew in the window forces a retry with a fresh set, so a descendant
    /// created concurrently can never be deleted without having been
    /// locked.
    ///
    /// # Arguments
    ///
    /// * `key` - Path or id of the task to delete
    /// * `strategy` - [`DeleteStrategy::Cascade`] or [`DeleteStrategy::Block`]
    ///
    /// # Returns
    ///
    /// Returns the removed paths, children first — for a parent/child pair
    /// the result is `{deleted: ["parent/child", "parent"]}`.
    ///
    /// # Error Scenarios
    ///
    /// - **NOT_FOUND**: the task does not exist
    /// - **HAS_CHILDREN**: `Block` strategy with existing children
    /// - **HAS_DEPENDENTS**: tasks outside the subtree depend on a removed
    ///   task; the survivors are listed
    ///
    /// [`move_task`]: TaskService::move_task
    pub fn delete_task(&self, key: &str, strategy: DeleteStrategy) -> Result<DeleteResult> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("delete_task");

        let mut attempt: u32 = 0;
        let result = loop {
            let keys = match self.peek_subtree_keys(key) {
                Ok(keys) => keys,
                Err(err) => break Err(err),
            };

            let outcome = self.with_scope(&keys, |service, conn, txn_id, events| {
                service.delete_in_scope(conn, txn_id, key, strategy, &keys, events)
            });

            match outcome {
                Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    attempt += 1;
                    continue;
                }
                other => break other,
            }
        };

        self.finish(&trace, result)
    }

    /// Runs a dependency-ordered batch inside one outermost scope.
    ///
    /// The batch is first bounded (creates and total op budgets), then
    /// topologically ordered over the dependency edges declared within it;
    /// forward references to keys created later in the batch count as
    /// satisfied by the ordering, and a cycle fails the whole batch listing
    /// the loop. Execution is sequential inside a single scope whose key
    /// set is the union of all item keys.
    ///
    /// ## Modes
    ///
    /// - **Strict**: the first failing item aborts the batch; the scope
    ///   rolls back and no partial state survives
    /// - **Lenient**: a failing item is recorded with its error payload and
    ///   the batch continues
    ///
    /// Cancellation through the token marks untouched items as `cancelled`.
    ///
    /// # Returns
    ///
    /// Returns per-item outcomes plus the aggregate
    /// `{total, succeeded, failed, duration}` summary.
    pub fn bulk(&self, ops: &[BulkOp], options: BulkOptions, cancel: &CancelToken) -> Result<BulkReport> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("bulk");

        let keys: Vec<String> = ops.iter().map(|op| op.key.clone()).collect();
        let result = self.with_scope(&keys, |service, conn, txn_id, events| {
            BulkProcessor::run(ops, options, cancel, |op| match &op.payload {
                BulkPayload::Create(task) => service.create_in_scope(conn, txn_id, (**task).clone(), events).map(|_| ()),
                BulkPayload::Update(patch) => service.update_in_scope(conn, txn_id, &op.key, patch, events).map(|_| ()),
                BulkPayload::Delete => {
                    let existing = service.must_get(conn, &op.key)?;
                    service.txn.record_backup(txn_id, &existing.path, Some(existing.clone()))?;
                    TaskStore::delete(conn, &existing.path)?;
                    service.indexes.delete(&existing.id)?;
                    service.invalidate(&existing);
                    events.push(Event::new(
                        EventKind::TaskDeleted,
                        Some(existing.path.clone()),
                        serde_json::json!({ "id": existing.id }),
                    ));
                    Ok(())
                }
            })
        });

        self.finish(&trace, result)
    }

    /// Runtime pipeline mutation, gated by the service configuration flag.
    pub fn add_rule(&self, rule: Box<dyn crate::libs::validation::ValidationRule>) -> Result<()> {
        self.pipeline.write().add_rule(rule)
    }

    pub fn remove_rule(&self, name: &str) -> Result<()> {
        self.pipeline.write().remove_rule(name)
    }

    // ------------------------------------------------------------------
    // scope internals
    // ------------------------------------------------------------------

    /// Opens one write scope around `work` and sees it through to commit.
    ///
    /// The full sequence per attempt:
    ///
    /// 1. **Claim keys**: the entity keys are taken as advisory locks,
    ///    all-or-nothing, *before* the writer slot — contended keys are a
    ///    retryable busy error absorbed by the backoff loop.
    /// 2. **Open the scope**: the coordinator either starts a fresh store
    ///    transaction or, for reentrant calls on this same worker, joins
    ///    the existing one. A foreign worker's scope is waited out; a wait
    ///    timeout is again a retryable busy error.
    /// 3. **Run work**: with the writer connection held and the scope
    ///    verified still alive (the reaper may have expired it).
    /// 4. **Commit and publish**: events collected by `work` go out only
    ///    after the commit succeeds.
    ///
    /// On any failure the scope rolls back and the recorded snapshots are
    /// replayed into the indexes and cache, so the in-memory projections
    /// match the store again. Busy/locked failures retry the whole
    /// sequence up to the shared attempt ceiling; key locks are released
    /// between attempts.
    fn with_scope<R>(
        &self,
        keys: &[String],
        mut work: impl FnMut(&Self, &Connection, &str, &mut Vec<Event>) -> Result<R>,
    ) -> Result<R> {
        let options = TxnOptions::with_timeout(self.txn_timeout);
        let mut attempt: u32 = 0;

        loop {
            // per-key write serialization happens before the scope opens
            let key_guard = match self.txn.lock_keys(keys) {
                Ok(guard) => guard,
                Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    attempt += 1;
                    pause(attempt);
                    continue;
                }
                Err(err) => return Err(err),
            };

            let txn_id = match self.txn.begin(&options) {
                Ok(id) => id,
                Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    drop(key_guard);
                    attempt += 1;
                    pause(attempt);
                    continue;
                }
                Err(err) => return Err(err),
            };

            let mut events: Vec<Event> = Vec::new();
            let result = self.txn.with_conn(|conn| {
                if !self.txn.is_active(&txn_id) {
                    return Err(CoreError::TransactionTimeout { id: txn_id.clone() });
                }
                work(self, conn, &txn_id, &mut events)
            });

            match result {
                Ok(value) => match self.txn.commit(&txn_id) {
                    Ok(()) => {
                        drop(key_guard);
                        for event in events {
                            self.bus.publish(event);
                        }
                        return Ok(value);
                    }
                    Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                        drop(key_guard);
                        attempt += 1;
                        pause(attempt);
                    }
                    Err(err) => return Err(err),
                },
                Err(err) => {
                    if let Ok(backups) = self.txn.rollback(&txn_id) {
                        self.restore_projections(backups);
                    }
                    drop(key_guard);
                    if err.is_retryable() && attempt < RETRY_ATTEMPTS {
                        attempt += 1;
                        pause(attempt);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Restores indexes and cache from the snapshots a rolled-back scope
    /// recorded.
    fn restore_projections(&self, backups: Backups) {
        for (key, snapshot) in backups {
            self.cache.invalidate_entity(&key);
            match snapshot {
                Some(task) => {
                    let _ = self.indexes.upsert(&task);
                }
                None => {
                    if let Some(record) = self.indexes.primary.get(&key) {
                        let _ = self.indexes.delete(&record.id);
                    }
                }
            }
        }
    }

    /// Path set of a task and its whole subtree, read outside any scope.
    /// Used to claim key locks before a subtree operation; the in-scope
    /// collection re-verifies against this set.
    fn peek_subtree_keys(&self, key: &str) -> Result<Vec<String>> {
        self.txn.with_conn(|conn| {
            let Some(root) = TaskStore::get(conn, key)? else {
                // let the scope surface NOT_FOUND under the lock
                return Ok(vec![key.to_string()]);
            };

            let mut keys = vec![root.path.clone()];
            let mut frontier = vec![root.path];
            while let Some(parent) = frontier.pop() {
                for child in TaskStore::get_children(conn, &parent)? {
                    keys.push(child.path.clone());
                    frontier.push(child.path);
                }
            }
            Ok(keys)
        })
    }

    /// Key set for a move: the subtree plus the target path and target
    /// parent, so concurrent writers at the destination contend too.
    fn peek_move_keys(&self, key: &str, new_parent: Option<&str>) -> Result<Vec<String>> {
        let mut keys = self.peek_subtree_keys(key)?;

        let root_path = keys.first().cloned().unwrap_or_else(|| key.to_string());
        let leaf = path::leaf(&root_path).to_string();
        let new_path = match new_parent {
            Some(parent) => format!("{parent}/{leaf}"),
            None => leaf,
        };
        keys.push(new_path);
        if let Some(parent) = new_parent {
            keys.push(parent.to_string());
        }

        Ok(keys)
    }

    /// Fails with a retryable busy error when the authoritative subtree
    /// contains a path the caller did not claim (it appeared between peek
    /// and lock).
    fn verify_subtree_locked(locked_keys: &[String], subtree: &[Task]) -> Result<()> {
        let locked: BTreeSet<String> = locked_keys.iter().map(|k| path::normalize(k)).collect();
        for task in subtree {
            if !locked.contains(&path::normalize(&task.path)) {
                return Err(CoreError::StorageIo {
                    message: format!("subtree changed while locking: {}", task.path),
                    retryable: true,
                });
            }
        }
        Ok(())
    }

    fn create_in_scope(&self, conn: &Connection, txn_id: &str, mut draft: Task, events: &mut Vec<Event>) -> Result<Task> {
        draft.parent_path = path::parent(&draft.path).map(|p| p.to_string());

        if TaskStore::get_by_path(conn, &draft.path)?.is_some() {
            return Err(CoreError::DuplicateName { key: draft.path });
        }

        draft.id = self.ids.mint("task");
        let now = self.clock.now_ms();
        draft.created_ms = now;
        draft.updated_ms = now;
        draft.version = 1;
        draft.subtasks.clear();

        let view = StoreView { conn };
        let candidate = Candidate {
            task: &draft,
            previous: None,
        };
        self.pipeline.read().check(&view, &candidate, self.mode).map_err(refine_validation_error)?;

        self.txn.record_backup(txn_id, &draft.path, None)?;
        self.txn.record_op(txn_id, "create_task")?;
        TaskStore::insert(conn, &draft)?;

        self.indexes.upsert(&draft)?;
        self.invalidate(&draft);
        events.push(Event::new(
            EventKind::TaskCreated,
            Some(draft.path.clone()),
            serde_json::json!({ "id": draft.id, "type": draft.task_type }),
        ));

        Ok(draft)
    }

    fn update_in_scope(&self, conn: &Connection, txn_id: &str, key: &str, patch: &TaskPatch, events: &mut Vec<Event>) -> Result<Task> {
        let existing = self.must_get(conn, key)?;

        let mut next = patch.apply_to(&existing);
        next.updated_ms = self.clock.now_ms();
        next.version = existing.version + 1;

        let view = StoreView { conn };
        let candidate = Candidate {
            task: &next,
            previous: Some(&existing),
        };
        self.pipeline.read().check(&view, &candidate, self.mode).map_err(refine_validation_error)?;

        self.txn.record_backup(txn_id, &existing.path, Some(existing.clone()))?;
        self.txn.record_op(txn_id, "update_task")?;
        let affected = TaskStore::update(conn, &next)?;
        if affected == 0 {
            return Err(CoreError::NotFound { key: key.to_string() });
        }

        self.indexes.upsert(&next)?;
        self.invalidate(&next);
        events.push(Event::new(
            EventKind::TaskUpdated,
            Some(next.path.clone()),
            serde_json::json!({ "version": next.version }),
        ));

        Ok(next)
    }

    fn move_in_scope(
        &self,
        conn: &Connection,
        txn_id: &str,
        key: &str,
        new_parent: Option<&str>,
        locked_keys: &[String],
        events: &mut Vec<Event>,
    ) -> Result<Task> {
        let existing = self.must_get(conn, key)?;
        let leaf = path::leaf(&existing.path).to_string();
        let new_path = match new_parent {
            Some(parent) => format!("{parent}/{leaf}"),
            None => leaf,
        };

        if path::normalize(&new_path) == path::normalize(&existing.path) {
            return Ok(existing);
        }
        if let Some(parent) = new_parent {
            if path::normalize(parent).starts_with(&format!("{}/", path::normalize(&existing.path)))
                || path::normalize(parent) == path::normalize(&existing.path)
            {
                return Err(CoreError::Conflict {
                    message: format!("cannot move {} under its own subtree", existing.path),
                });
            }
        }

        let subtree = self.collect_subtree(conn, &existing.path)?;
        Self::verify_subtree_locked(locked_keys, &subtree)?;

        // rewrite parents before their children so every hierarchy check
        // sees the moved parent already in place
        let mut ordered = vec![existing.clone()];
        ordered.extend(subtree);

        let old_prefix = existing.path.clone();
        for task in ordered.iter() {
            let mut moved = task.clone();
            let suffix = task.path[old_prefix.len()..].to_string();
            moved.path = format!("{new_path}{suffix}");
            moved.parent_path = path::parent(&moved.path).map(|p| p.to_string());
            moved.updated_ms = self.clock.now_ms();
            moved.version += 1;

            let candidate = Candidate {
                task: &moved,
                previous: Some(task),
            };
            let view = StoreView { conn };
            self.pipeline
                .read()
                .check(&view, &candidate, self.mode)
                .map_err(refine_validation_error)?;

            self.txn.record_backup(txn_id, &task.path, Some(task.clone()))?;
            let affected = TaskStore::update(conn, &moved)?;
            if affected == 0 {
                return Err(CoreError::NotFound { key: moved.path });
            }

            self.indexes.upsert(&moved)?;
            self.invalidate(task);
            self.invalidate(&moved);
            events.push(Event::new(
                EventKind::TaskUpdated,
                Some(moved.path.clone()),
                serde_json::json!({ "moved_from": task.path }),
            ));
        }

        self.must_get(conn, &new_path)
    }

    fn delete_in_scope(
        &self,
        conn: &Connection,
        txn_id: &str,
        key: &str,
        strategy: DeleteStrategy,
        locked_keys: &[String],
        events: &mut Vec<Event>,
    ) -> Result<DeleteResult> {
        let existing = self.must_get(conn, key)?;

        if strategy == DeleteStrategy::Block {
            let children = TaskStore::get_children(conn, &existing.path)?;
            if !children.is_empty() {
                return Err(CoreError::HasChildren {
                    key: existing.path.clone(),
                    children: children.into_iter().map(|t| t.path).collect(),
                });
            }
        }
        let subtree = self.collect_subtree(conn, &existing.path)?;
        Self::verify_subtree_locked(locked_keys, &subtree)?;

        // dependents outside the subtree survive the deletion and must
        // be reported
        let mut doomed: Vec<Task> = subtree;
        doomed.push(existing.clone());
        let doomed_keys: Vec<String> = doomed.iter().map(|t| path::normalize(&t.path)).collect();

        let mut external_dependents: Vec<String> = Vec::new();
        for task in &doomed {
            for dependent in TaskStore::get_dependents(conn, &task.path)? {
                if !doomed_keys.contains(&path::normalize(&dependent.path)) && !external_dependents.contains(&dependent.path) {
                    external_dependents.push(dependent.path);
                }
            }
        }
        if !external_dependents.is_empty() {
            return Err(CoreError::HasDependents {
                key: existing.path.clone(),
                dependents: external_dependents,
            });
        }

        // children before ancestors
        doomed.sort_by_key(|t| std::cmp::Reverse(path::depth(&t.path)));

        let mut deleted = Vec::with_capacity(doomed.len());
        for task in &doomed {
            self.txn.record_backup(txn_id, &task.path, Some(task.clone()))?;
            TaskStore::delete(conn, &task.path)?;
            self.indexes.delete(&task.id)?;
            self.invalidate(task);
            events.push(Event::new(EventKind::TaskDeleted, Some(task.path.clone()), serde_json::json!({ "id": task.id })));
            deleted.push(task.path.clone());
        }

        Ok(DeleteResult { deleted })
    }

    /// Direct dependents that sit in BLOCKED and whose dependencies are all
    /// COMPLETED transition back to PENDING, leaves first.
    fn release_blocked_dependents(&self, conn: &Connection, txn_id: &str, completed_path: &str, events: &mut Vec<Event>) -> Result<()> {
        let dependents = TaskStore::get_dependents(conn, completed_path)?;
        let order = BulkProcessor::closure_leaves_first(
            &dependents.iter().map(|t| t.path.clone()).collect::<Vec<_>>(),
            |_| Vec::new(),
        );

        for dependent_path in order {
            let Some(dependent) = TaskStore::get_by_path(conn, &dependent_path)? else {
                continue;
            };
            if dependent.status != TaskStatus::Blocked {
                continue;
            }
            let all_done = dependent
                .dependencies
                .iter()
                .all(|dep| matches!(TaskStore::get(conn, dep), Ok(Some(t)) if t.status == TaskStatus::Completed));
            if !all_done {
                continue;
            }

            let patch = TaskPatch {
                status: Some(TaskStatus::Pending),
                ..TaskPatch::default()
            };
            self.update_in_scope(conn, txn_id, &dependent.path, &patch, events)?;
        }

        Ok(())
    }

    /// Full subtree below `root` (excluding it), via the store so the
    /// current scope's writes are visible.
    fn collect_subtree(&self, conn: &Connection, root: &str) -> Result<Vec<Task>> {
        let mut collected = Vec::new();
        let mut frontier = vec![root.to_string()];

        while let Some(parent) = frontier.pop() {
            for child in TaskStore::get_children(conn, &parent)? {
                frontier.push(child.path.clone());
                collected.push(child);
            }
        }

        Ok(collected)
    }

    fn must_get(&self, conn: &Connection, key: &str) -> Result<Task> {
        TaskStore::get(conn, key)?.ok_or_else(|| CoreError::NotFound { key: key.to_string() })
    }

    fn invalidate(&self, task: &Task) {
        self.cache.invalidate_entity(&task.path);
        self.cache.invalidate_entity(&task.id);
        if let Some(parent) = &task.parent_path {
            self.cache.invalidate_entity(parent);
        }
    }

    fn matches_filter(task: &Task, filter: &TaskFilter) -> bool {
        if let Some(project_id) = &filter.project_id {
            if task.project_id.as_deref() != Some(project_id.as_str()) {
                return false;
            }
        }
        if let Some(parent) = &filter.parent_path {
            if task.parent_path.as_deref().map(path::normalize) != Some(path::normalize(parent)) {
                return false;
            }
        }
        if let Some(tag) = &filter.tag {
            if !task.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(assigned_to) = &filter.assigned_to {
            if task.assigned_to.as_deref() != Some(assigned_to.as_str()) {
                return false;
            }
        }
        if let Some(pattern) = &filter.path_pattern {
            if !glob_match(&path::normalize(pattern), &path::normalize(&task.path)) {
                return false;
            }
        }
        true
    }

    fn finish<R>(&self, trace: &str, result: Result<R>) -> Result<R> {
        match result {
            Ok(value) => {
                self.tracer.end(trace);
                Ok(value)
            }
            Err(err) => {
                self.tracer.error(trace, &err.to_string());
                self.tracer.end(trace);
                Err(err)
            }
        }
    }
}

/// Lifts generic validation failures into their dedicated error kinds so
/// callers get the taxonomy the interface contract promises. Kinds are
/// scanned in a fixed priority order: the dependency guard outranks the
/// transition table (a PENDING task completed over unfinished dependencies
/// reports DEPENDENCY_NOT_MET, not STATUS_TRANSITION).
fn refine_validation_error(err: CoreError) -> CoreError {
    const PRIORITY: [&str; 8] = [
        "dependencies_not_met",
        "dependency_cycle",
        "too_many_dependencies",
        "missing_dependency",
        "duplicate_name",
        "missing_parent",
        "invalid_transition",
        "reopen_blocked",
    ];

    let CoreError::Validation { issues } = &err else {
        return err;
    };

    let mut prioritized: Vec<&crate::libs::error::ValidationIssue> = issues.iter().collect();
    prioritized.sort_by_key(|issue| PRIORITY.iter().position(|k| *k == issue.kind).unwrap_or(PRIORITY.len()));

    for issue in prioritized {
        match issue.kind.as_str() {
            "duplicate_name" => {
                let key = issue
                    .value
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .unwrap_or_else(|| issue.path.as_deref().unwrap_or_default())
                    .to_string();
                return CoreError::DuplicateName { key };
            }
            "missing_parent" => {
                return CoreError::NotFound {
                    key: issue.path.clone().unwrap_or_default(),
                }
            }
            "missing_dependency" => {
                let key = issue
                    .value
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                return CoreError::NotFound { key };
            }
            "invalid_transition" => {
                let from = issue
                    .value
                    .as_ref()
                    .and_then(|v| v.get("from"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("?")
                    .to_string();
                let to = issue
                    .value
                    .as_ref()
                    .and_then(|v| v.get("to"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("?")
                    .to_string();
                return CoreError::StatusTransition { from, to };
            }
            "dependencies_not_met" => {
                let unmet = issue
                    .value
                    .as_ref()
                    .and_then(|v| v.get("unmet"))
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                return CoreError::DependencyNotMet {
                    key: issue.path.clone().unwrap_or_default(),
                    unmet,
                };
            }
            "dependency_cycle" => {
                let cycle = issue
                    .value
                    .as_ref()
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                return CoreError::DependencyCycle { cycle };
            }
            "too_many_dependencies" => {
                return CoreError::LimitExceeded {
                    what: "dependencies",
                    limit: task::MAX_DEPENDENCIES,
                    actual: issue.value.as_ref().and_then(|v| v.as_u64()).unwrap_or(0) as usize,
                }
            }
            "reopen_blocked" => {
                return CoreError::Conflict {
                    message: issue.message.clone(),
                }
            }
            _ => {}
        }
    }

    err
}

/// Simple `*`/`?` glob over normalized paths.
fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(pattern: &[u8], value: &[u8]) -> bool {
        match (pattern.first(), value.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&pattern[1..], value) || (!value.is_empty() && inner(pattern, &value[1..])),
            (Some(b'?'), Some(_)) => inner(&pattern[1..], &value[1..]),
            (Some(p), Some(v)) if p == v => inner(&pattern[1..], &value[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

/// Backoff between scope attempts: 100 ms, 200 ms, 400 ms, capped at 1 s.
fn pause(attempt: u32) {
    let delay = (100u64 << (attempt.saturating_sub(1))).min(1000);
    std::thread::sleep(Duration::from_millis(delay));
}
