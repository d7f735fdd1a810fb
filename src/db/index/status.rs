//! Status index: status to id-set projection.

use super::{IndexQuery, IndexQueryResult, IndexStats, TaskIndex, TaskRecord};
use crate::libs::error::Result;
use crate::libs::task::TaskStatus;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

#[derive(Default)]
struct StatusInner {
    by_status: HashMap<TaskStatus, BTreeSet<String>>,
    id_status: HashMap<String, TaskStatus>,
    upserts: u64,
    deletes: u64,
}

#[derive(Default)]
pub struct StatusIndex {
    inner: RwLock<StatusInner>,
}

impl StatusIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids currently in a given status, ordered.
    pub fn ids_in(&self, status: TaskStatus) -> Vec<String> {
        self.inner
            .read()
            .by_status
            .get(&status)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.inner.read().id_status.get(id).copied()
    }

    /// Per-status cardinality snapshot.
    pub fn counts(&self) -> HashMap<TaskStatus, usize> {
        self.inner.read().by_status.iter().map(|(status, ids)| (*status, ids.len())).collect()
    }
}

impl TaskIndex for StatusIndex {
    fn name(&self) -> &'static str {
        "status"
    }

    fn upsert(&self, record: &TaskRecord) -> Result<()> {
        let mut inner = self.inner.write();

        if let Some(previous) = inner.id_status.insert(record.id.clone(), record.status) {
            if previous != record.status {
                if let Some(ids) = inner.by_status.get_mut(&previous) {
                    ids.remove(&record.id);
                }
            }
        }
        inner.by_status.entry(record.status).or_default().insert(record.id.clone());
        inner.upserts += 1;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(status) = inner.id_status.remove(id) {
            if let Some(ids) = inner.by_status.get_mut(&status) {
                ids.remove(id);
            }
            inner.deletes += 1;
        }
        Ok(())
    }

    fn query(&self, query: &IndexQuery) -> IndexQueryResult {
        let ids = match query.status {
            Some(status) => self.ids_in(status),
            None => {
                let inner = self.inner.read();
                let mut ids: Vec<String> = inner.id_status.keys().cloned().collect();
                ids.sort();
                ids
            }
        };

        IndexQueryResult {
            ids,
            answered_by: self.name(),
        }
    }

    fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_status.clear();
        inner.id_status.clear();
    }

    fn stats(&self) -> IndexStats {
        let inner = self.inner.read();
        IndexStats {
            name: self.name(),
            entries: inner.id_status.len(),
            upserts: inner.upserts,
            deletes: inner.deletes,
        }
    }
}
