//! Secondary indexes: in-memory projections of the durable store.
//!
//! Three indexes share one operation contract ([`TaskIndex`]): the primary
//! index (by id and path), the status index (status to id set), and the
//! hierarchy index (parent to ordered children, plus type to id set). They
//! are derivable projections — the [`coordinator`] rebuilds them from the
//! store at startup and keeps them consistent after every committed
//! mutation.

pub mod coordinator;
pub mod hierarchy;
pub mod primary;
pub mod status;

use crate::libs::error::Result;
use crate::libs::task::{path, Task, TaskStatus, TaskType};
use serde::Serialize;

/// The slice of a task the indexes project.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    /// Case-preserved canonical path.
    pub path: String,
    /// Normalized matching key.
    pub path_key: String,
    pub parent_key: Option<String>,
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub created_ms: i64,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            path: task.path.clone(),
            path_key: path::normalize(&task.path),
            parent_key: task.parent_path.as_deref().map(path::normalize),
            status: task.status,
            task_type: task.task_type,
            created_ms: task.created_ms,
        }
    }
}

/// A single index mutation, as carried by batches.
#[derive(Debug, Clone)]
pub enum IndexOp {
    Upsert(TaskRecord),
    Delete(String),
}

/// Filter evaluated by an index. The coordinator's planner picks which
/// index answers it.
#[derive(Debug, Clone, Default)]
pub struct IndexQuery {
    /// Exact id or path.
    pub key: Option<String>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub parent: Option<String>,
}

/// Ids matching a query, tagged with the index that answered it.
#[derive(Debug, Clone, Serialize)]
pub struct IndexQueryResult {
    pub ids: Vec<String>,
    pub answered_by: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub name: &'static str,
    pub entries: usize,
    pub upserts: u64,
    pub deletes: u64,
}

/// Shared contract of the three secondary indexes.
pub trait TaskIndex: Send + Sync {
    fn name(&self) -> &'static str;
    /// Inserts or replaces the projection of a task (keyed by id).
    fn upsert(&self, record: &TaskRecord) -> Result<()>;
    /// Removes a task's projection by id. Unknown ids are a no-op.
    fn delete(&self, id: &str) -> Result<()>;
    /// Applies a sequence of mutations, returning one result per op.
    fn batch(&self, ops: &[IndexOp]) -> Vec<Result<()>> {
        ops.iter()
            .map(|op| match op {
                IndexOp::Upsert(record) => self.upsert(record),
                IndexOp::Delete(id) => self.delete(id),
            })
            .collect()
    }
    fn query(&self, query: &IndexQuery) -> IndexQueryResult;
    fn clear(&self);
    fn stats(&self) -> IndexStats;
}
