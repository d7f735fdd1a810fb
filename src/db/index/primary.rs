//! Primary index: id and path lookups.

use super::{IndexQuery, IndexQueryResult, IndexStats, TaskIndex, TaskRecord};
use crate::libs::error::Result;
use crate::libs::task::path;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct PrimaryInner {
    by_id: HashMap<String, TaskRecord>,
    /// path_key -> id
    by_path: HashMap<String, String>,
    upserts: u64,
    deletes: u64,
}

#[derive(Default)]
pub struct PrimaryIndex {
    inner: RwLock<PrimaryInner>,
}

impl PrimaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a path or id to the indexed record.
    pub fn get(&self, key: &str) -> Option<TaskRecord> {
        let inner = self.inner.read();
        if let Some(record) = inner.by_id.get(key) {
            return Some(record.clone());
        }
        inner.by_path.get(&path::normalize(key)).and_then(|id| inner.by_id.get(id)).cloned()
    }

    pub fn resolve_id(&self, key: &str) -> Option<String> {
        self.get(key).map(|record| record.id)
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.inner.read().by_id.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskIndex for PrimaryIndex {
    fn name(&self) -> &'static str {
        "primary"
    }

    fn upsert(&self, record: &TaskRecord) -> Result<()> {
        let mut inner = self.inner.write();

        // a path change must not leave the old path resolvable
        if let Some(previous) = inner.by_id.get(&record.id) {
            if previous.path_key != record.path_key {
                let stale = previous.path_key.clone();
                inner.by_path.remove(&stale);
            }
        }

        inner.by_path.insert(record.path_key.clone(), record.id.clone());
        inner.by_id.insert(record.id.clone(), record.clone());
        inner.upserts += 1;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(record) = inner.by_id.remove(id) {
            inner.by_path.remove(&record.path_key);
            inner.deletes += 1;
        }
        Ok(())
    }

    fn query(&self, query: &IndexQuery) -> IndexQueryResult {
        let ids = match &query.key {
            Some(key) => self.resolve_id(key).into_iter().collect(),
            None => {
                let inner = self.inner.read();
                let mut ids: Vec<String> = inner
                    .by_id
                    .values()
                    .filter(|record| query.status.map(|s| record.status == s).unwrap_or(true))
                    .filter(|record| query.task_type.map(|t| record.task_type == t).unwrap_or(true))
                    .filter(|record| match query.parent.as_deref() {
                        Some(parent) => record.parent_key.as_deref() == Some(path::normalize(parent).as_str()),
                        None => true,
                    })
                    .map(|record| record.id.clone())
                    .collect();
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
        inner.by_id.clear();
        inner.by_path.clear();
    }

    fn stats(&self) -> IndexStats {
        let inner = self.inner.read();
        IndexStats {
            name: self.name(),
            entries: inner.by_id.len(),
            upserts: inner.upserts,
            deletes: inner.deletes,
        }
    }
}
