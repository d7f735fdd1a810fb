//! Bulk batch processing: dependency-ordered execution of create/update/
//! delete sequences, and leaves-first ordering for cascading status
//! updates.
//!
//! The processor computes a topological order (Kahn's algorithm) over the
//! dependency edges declared *within* the batch; references to keys created
//! later in the batch are forward references and count as satisfied by the
//! ordering. A cycle fails the whole batch with DEPENDENCY_CYCLE listing
//! every member of the loop. Execution itself is delegated to the caller
//! item by item, so the service layer decides how an item is applied inside
//! its transaction scope.

use crate::libs::cancel::CancelToken;
use crate::libs::error::{CoreError, ErrorPayload, Result};
use crate::libs::task::{path, Task, TaskPatch};
use crate::libs::validation::Mode;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Creates per batch.
pub const MAX_CREATES_PER_BATCH: usize = 100;

/// Total operations per batch.
pub const MAX_OPS_PER_BATCH: usize = 1000;

/// Payload of one batch item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BulkPayload {
    Create(Box<Task>),
    Update(TaskPatch),
    Delete,
}

/// One batch item, addressed by task path or id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkOp {
    pub key: String,
    #[serde(flatten)]
    pub payload: BulkPayload,
}

impl BulkOp {
    /// Dependency keys this item declares inside the batch.
    fn declared_dependencies(&self) -> Vec<String> {
        match &self.payload {
            BulkPayload::Create(task) => task.dependencies.clone(),
            BulkPayload::Update(patch) => patch.dependencies.clone().unwrap_or_default(),
            BulkPayload::Delete => Vec::new(),
        }
    }
}

/// Batch execution options.
#[derive(Debug, Clone, Copy)]
pub struct BulkOptions {
    /// Strict aborts the batch (and its scope) on the first failure;
    /// lenient records the failure and continues. Nested batches inherit
    /// the outermost mode.
    pub mode: Mode,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self { mode: Mode::Strict }
    }
}

/// Outcome status of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Applied,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub key: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Aggregate batch summary.
#[derive(Debug, Clone, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkReport {
    pub outcomes: Vec<ItemOutcome>,
    pub summary: BulkSummary,
}

/// Dependency-ordered batch driver.
pub struct BulkProcessor;

impl BulkProcessor {
    /// Validates batch bounds: total ops and creates.
    pub fn check_limits(ops: &[BulkOp]) -> Result<()> {
        if ops.len() > MAX_OPS_PER_BATCH {
            return Err(CoreError::LimitExceeded {
                what: "bulk operations",
                limit: MAX_OPS_PER_BATCH,
                actual: ops.len(),
            });
        }
        let creates = ops.iter().filter(|op| matches!(op.payload, BulkPayload::Create(_))).count();
        if creates > MAX_CREATES_PER_BATCH {
            return Err(CoreError::LimitExceeded {
                what: "bulk creates",
                limit: MAX_CREATES_PER_BATCH,
                actual: creates,
            });
        }
        Ok(())
    }

    /// Computes the dependency-respecting execution order over the batch,
    /// returning indices into `ops`. Dependencies pointing outside the
    /// batch are ignored here (the validation pipeline checks their
    /// existence per item). A cycle fails with DEPENDENCY_CYCLE and lists
    /// the members as a closed loop.
    pub fn sort(ops: &[BulkOp]) -> Result<Vec<usize>> {
        let key_to_index: HashMap<String, usize> = ops.iter().enumerate().map(|(i, op)| (path::normalize(&op.key), i)).collect();

        // edges: dependency -> dependent
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ops.len()];
        let mut indegree: Vec<usize> = vec![0; ops.len()];

        for (i, op) in ops.iter().enumerate() {
            for dep in op.declared_dependencies() {
                if let Some(&dep_index) = key_to_index.get(&path::normalize(&dep)) {
                    dependents[dep_index].push(i);
                    indegree[i] += 1;
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..ops.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(ops.len());

        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() == ops.len() {
            return Ok(order);
        }

        // the leftover nodes contain at least one loop; walk it for the
        // error payload
        let remaining: Vec<usize> = (0..ops.len()).filter(|i| !order.contains(i)).collect();
        let cycle = extract_cycle(ops, &remaining).unwrap_or_else(|| remaining.iter().map(|&i| ops[i].key.clone()).collect());
        Err(CoreError::DependencyCycle { cycle })
    }

    /// Executes the batch in dependency order, delegating each item to
    /// `apply`. Strict mode returns the first failure (the caller rolls the
    /// scope back — no partial state survives); lenient mode records
    /// failures and keeps going. Cancellation marks untouched items as
    /// `cancelled`.
    pub fn run(
        ops: &[BulkOp],
        options: BulkOptions,
        cancel: &CancelToken,
        mut apply: impl FnMut(&BulkOp) -> Result<()>,
    ) -> Result<BulkReport> {
        Self::check_limits(ops)?;
        let order = Self::sort(ops)?;
        let started = Instant::now();

        let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; ops.len()];
        let mut failed = 0usize;
        let mut succeeded = 0usize;

        for &index in &order {
            let op = &ops[index];

            if cancel.is_cancelled() {
                outcomes[index] = Some(ItemOutcome {
                    key: op.key.clone(),
                    status: ItemStatus::Cancelled,
                    error: None,
                });
                continue;
            }

            match apply(op) {
                Ok(()) => {
                    succeeded += 1;
                    outcomes[index] = Some(ItemOutcome {
                        key: op.key.clone(),
                        status: ItemStatus::Applied,
                        error: None,
                    });
                }
                Err(err) => {
                    failed += 1;
                    if options.mode == Mode::Strict {
                        return Err(err);
                    }
                    tracing::warn!(key = %op.key, error = %err, "bulk item failed, continuing in lenient mode");
                    outcomes[index] = Some(ItemOutcome {
                        key: op.key.clone(),
                        status: ItemStatus::Failed,
                        error: Some(err.payload(None)),
                    });
                }
            }
        }

        let outcomes: Vec<ItemOutcome> = outcomes
            .into_iter()
            .enumerate()
            .map(|(i, outcome)| {
                outcome.unwrap_or(ItemOutcome {
                    key: ops[i].key.clone(),
                    status: ItemStatus::Skipped,
                    error: None,
                })
            })
            .collect();

        Ok(BulkReport {
            summary: BulkSummary {
                total: ops.len(),
                succeeded,
                failed,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            outcomes,
        })
    }

    /// Collects the closure of keys affected by a cascading update,
    /// expanding each key through `expand` (hierarchy children, dependents,
    /// or both), and orders it leaves-first so descendants are processed
    /// before their ancestors.
    pub fn closure_leaves_first(seeds: &[String], expand: impl Fn(&str) -> Vec<String>) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        let mut frontier: VecDeque<String> = seeds.iter().map(|s| path::normalize(s)).collect();

        while let Some(key) = frontier.pop_front() {
            if seen.contains(&key) {
                continue;
            }
            seen.push(key.clone());
            for next in expand(&key) {
                frontier.push_back(path::normalize(&next));
            }
        }

        seen.sort_by_key(|key| std::cmp::Reverse(path::depth(key)));
        seen
    }
}

/// Walks the unresolved nodes for one concrete loop, returned closed
/// (`[a, b, a]`).
fn extract_cycle(ops: &[BulkOp], remaining: &[usize]) -> Option<Vec<String>> {
    let key_to_index: HashMap<String, usize> = remaining.iter().map(|&i| (path::normalize(&ops[i].key), i)).collect();

    let start = *remaining.first()?;
    let mut trail: Vec<usize> = Vec::new();
    let mut current = start;

    loop {
        if let Some(position) = trail.iter().position(|&i| i == current) {
            let mut cycle: Vec<String> = trail[position..].iter().map(|&i| ops[i].key.clone()).collect();
            cycle.push(ops[current].key.clone());
            return Some(cycle);
        }
        trail.push(current);

        // follow the first in-batch dependency that is also unresolved
        let next = ops[current]
            .declared_dependencies()
            .into_iter()
            .find_map(|dep| key_to_index.get(&path::normalize(&dep)).copied())?;
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::task::{Task, TaskType};

    fn create_op(key: &str, deps: &[&str]) -> BulkOp {
        let mut task = Task::draft(key, key, TaskType::Task);
        task.dependencies = deps.iter().map(|d| d.to_string()).collect();
        BulkOp {
            key: key.to_string(),
            payload: BulkPayload::Create(Box::new(task)),
        }
    }

    #[test]
    fn forward_references_order_correctly() {
        // a depends on b, which appears later in the batch
        let ops = vec![create_op("a", &["b"]), create_op("b", &[])];
        let order = BulkProcessor::sort(&ops).unwrap();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn cycle_lists_all_members() {
        let ops = vec![create_op("a", &["b"]), create_op("b", &["a"])];
        let err = BulkProcessor::sort(&ops).unwrap_err();
        match err {
            CoreError::DependencyCycle { cycle } => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"a".to_string()) && cycle.contains(&"b".to_string()));
            }
            other => panic!("expected DependencyCycle, got {other:?}"),
        }
    }

    #[test]
    fn external_dependencies_do_not_constrain_order() {
        let ops = vec![create_op("a", &["outside/the/batch"])];
        let order = BulkProcessor::sort(&ops).unwrap();
        assert_eq!(order, vec![0]);
    }

    #[test]
    fn strict_mode_aborts_on_first_failure() {
        let ops = vec![create_op("a", &[]), create_op("b", &[])];
        let cancel = CancelToken::new();
        let err = BulkProcessor::run(&ops, BulkOptions::default(), &cancel, |op| {
            if op.key == "a" {
                Err(CoreError::internal("boom"))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert!(matches!(err, CoreError::Internal { .. }));
    }

    #[test]
    fn lenient_mode_records_and_continues() {
        let ops = vec![create_op("a", &[]), create_op("b", &[])];
        let cancel = CancelToken::new();
        let report = BulkProcessor::run(
            &ops,
            BulkOptions { mode: Mode::Lenient },
            &cancel,
            |op| {
                if op.key == "a" {
                    Err(CoreError::internal("boom"))
                } else {
                    Ok(())
                }
            },
        )
        .unwrap();

        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.succeeded, 1);
        let failed = report.outcomes.iter().find(|o| o.key == "a").unwrap();
        assert_eq!(failed.status, ItemStatus::Failed);
        assert!(failed.error.is_some());
    }

    #[test]
    fn cancellation_marks_untouched_items() {
        let ops = vec![create_op("a", &[]), create_op("b", &["a"])];
        let cancel = CancelToken::new();
        let report = BulkProcessor::run(&ops, BulkOptions { mode: Mode::Lenient }, &cancel, |op| {
            if op.key == "a" {
                cancel.cancel();
            }
            Ok(())
        })
        .unwrap();

        let b = report.outcomes.iter().find(|o| o.key == "b").unwrap();
        assert_eq!(b.status, ItemStatus::Cancelled);
    }

    #[test]
    fn create_budget_enforced() {
        let ops: Vec<BulkOp> = (0..MAX_CREATES_PER_BATCH + 1).map(|i| create_op(&format!("t{i}"), &[])).collect();
        let err = BulkProcessor::check_limits(&ops).unwrap_err();
        assert!(matches!(err, CoreError::LimitExceeded { .. }));
    }

    #[test]
    fn closure_orders_leaves_first() {
        let order = BulkProcessor::closure_leaves_first(&["proj".to_string()], |key| match key {
            "proj" => vec!["proj/a".to_string(), "proj/b".to_string()],
            "proj/a" => vec!["proj/a/x".to_string()],
            _ => Vec::new(),
        });

        let position = |k: &str| order.iter().position(|o| o == k).unwrap();
        assert!(position("proj/a/x") < position("proj/a"));
        assert!(position("proj/a") < position("proj"));
        assert!(position("proj/b") < position("proj"));
    }
}
