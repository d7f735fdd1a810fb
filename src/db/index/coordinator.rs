//! Index coordinator: atomic multi-index mutation with compensation.
//!
//! Applies every mutation to the primary, status, and hierarchy indexes in
//! that order. In atomic mode a partial failure is compensated by undoing
//! the entries already applied (reverse op) and the first failure is
//! returned; in non-atomic mode the primary result stands and divergences
//! are logged for the repair pass. Batches are bounded and each per-index
//! operation is retried with the shared backoff schedule.

use super::hierarchy::HierarchyIndex;
use super::primary::PrimaryIndex;
use super::status::StatusIndex;
use super::{IndexOp, IndexQuery, IndexQueryResult, IndexStats, TaskIndex, TaskRecord};
use crate::libs::error::{CoreError, Result};
use crate::libs::task::Task;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Batch ceiling for index operations.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Per-index retry ceiling.
pub const RETRY_ATTEMPTS: u32 = 3;

/// Coordinates the three secondary indexes as one unit.
pub struct IndexCoordinator {
    pub primary: Arc<PrimaryIndex>,
    pub status: Arc<StatusIndex>,
    pub hierarchy: Arc<HierarchyIndex>,
    atomic: bool,
    max_batch_size: usize,
    divergences: Mutex<Vec<String>>,
}

impl IndexCoordinator {
    pub fn new(atomic: bool) -> Self {
        Self {
            primary: Arc::new(PrimaryIndex::new()),
            status: Arc::new(StatusIndex::new()),
            hierarchy: Arc::new(HierarchyIndex::new()),
            atomic,
            max_batch_size: MAX_BATCH_SIZE,
            divergences: Mutex::new(Vec::new()),
        }
    }

    fn indexes(&self) -> [&dyn TaskIndex; 3] {
        [self.primary.as_ref(), self.status.as_ref(), self.hierarchy.as_ref()]
    }

    /// Applies an upsert across all indexes. See the module docs for the
    /// atomic/non-atomic contract.
    pub fn upsert(&self, task: &Task) -> Result<()> {
        let record = TaskRecord::from(task);
        let mut applied: Vec<&dyn TaskIndex> = Vec::with_capacity(3);

        for index in self.indexes() {
            match with_retry(|| index.upsert(&record)) {
                Ok(()) => applied.push(index),
                Err(err) => {
                    if self.atomic {
                        // reverse op: drop the partially-applied entries
                        for done in applied {
                            let _ = done.delete(&record.id);
                        }
                        return Err(err);
                    }
                    if index.name() == "primary" {
                        return Err(err);
                    }
                    self.note_divergence(format!("upsert {} diverged on {}: {err}", record.id, index.name()));
                }
            }
        }

        Ok(())
    }

    /// Applies a delete across all indexes, compensating a partial failure
    /// in atomic mode by restoring the pre-delete projection.
    pub fn delete(&self, id: &str) -> Result<()> {
        let snapshot = self.primary.get(id);
        let id = match &snapshot {
            Some(record) => record.id.clone(),
            None => id.to_string(),
        };
        let mut applied: Vec<&dyn TaskIndex> = Vec::with_capacity(3);

        for index in self.indexes() {
            match with_retry(|| index.delete(&id)) {
                Ok(()) => applied.push(index),
                Err(err) => {
                    if self.atomic {
                        if let Some(record) = &snapshot {
                            for done in applied {
                                let _ = done.upsert(record);
                            }
                        }
                        return Err(err);
                    }
                    if index.name() == "primary" {
                        return Err(err);
                    }
                    self.note_divergence(format!("delete {id} diverged on {}: {err}", index.name()));
                }
            }
        }

        Ok(())
    }

    /// Applies a bounded batch, returning one result per op. Oversized
    /// batches fail whole with LIMIT_EXCEEDED.
    pub fn batch(&self, ops: &[IndexOp]) -> Result<Vec<Result<()>>> {
        if ops.len() > self.max_batch_size {
            return Err(CoreError::LimitExceeded {
                what: "index batch",
                limit: self.max_batch_size,
                actual: ops.len(),
            });
        }

        Ok(ops
            .iter()
            .map(|op| match op {
                IndexOp::Upsert(record) => self.upsert_record(record),
                IndexOp::Delete(id) => self.delete(id),
            })
            .collect())
    }

    fn upsert_record(&self, record: &TaskRecord) -> Result<()> {
        let mut applied: Vec<&dyn TaskIndex> = Vec::with_capacity(3);
        for index in self.indexes() {
            match with_retry(|| index.upsert(record)) {
                Ok(()) => applied.push(index),
                Err(err) => {
                    if self.atomic {
                        for done in applied {
                            let _ = done.delete(&record.id);
                        }
                        return Err(err);
                    }
                    if index.name() == "primary" {
                        return Err(err);
                    }
                    self.note_divergence(format!("upsert {} diverged on {}: {err}", record.id, index.name()));
                }
            }
        }
        Ok(())
    }

    /// Routes a query to the narrowest useful index: status filters to the
    /// status index, type filters to the hierarchy index, everything else
    /// to the primary.
    pub fn query(&self, query: &IndexQuery) -> IndexQueryResult {
        if query.status.is_some() {
            self.status.query(query)
        } else if query.task_type.is_some() {
            self.hierarchy.query(query)
        } else {
            self.primary.query(query)
        }
    }

    pub fn clear(&self) {
        for index in self.indexes() {
            index.clear();
        }
    }

    /// Rebuilds every projection from the authoritative store contents.
    pub fn rebuild(&self, tasks: &[Task]) -> Result<()> {
        self.clear();
        for task in tasks {
            self.upsert(task)?;
        }
        tracing::debug!(count = tasks.len(), "secondary indexes rebuilt");
        Ok(())
    }

    pub fn stats(&self) -> Vec<IndexStats> {
        self.indexes().iter().map(|index| index.stats()).collect()
    }

    /// Divergences recorded in non-atomic mode, consumed by the repair
    /// pass.
    pub fn take_divergences(&self) -> Vec<String> {
        std::mem::take(&mut *self.divergences.lock())
    }

    fn note_divergence(&self, message: String) {
        tracing::warn!(%message, "index divergence");
        self.divergences.lock().push(message);
    }
}

/// Retries a transient-failing index op with the shared backoff schedule.
fn with_retry(mut op: impl FnMut() -> Result<()>) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                attempt += 1;
                let delay = (100u64 << (attempt - 1)).min(1000);
                std::thread::sleep(Duration::from_millis(delay));
            }
            Err(err) => return Err(err),
        }
    }
}
