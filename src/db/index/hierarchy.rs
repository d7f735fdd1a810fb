//! Hierarchy index: parent to ordered children, and type to id set.

use super::{IndexQuery, IndexQueryResult, IndexStats, TaskIndex, TaskRecord};
use crate::libs::error::Result;
use crate::libs::task::{path, TaskType};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

#[derive(Clone)]
struct Entry {
    path: String,
    path_key: String,
    parent_key: Option<String>,
    task_type: TaskType,
    created_ms: i64,
}

#[derive(Default)]
struct HierarchyInner {
    /// parent_key -> ordered (created_ms, path) children
    children: HashMap<String, Vec<(i64, String)>>,
    by_type: HashMap<TaskType, BTreeSet<String>>,
    entries: HashMap<String, Entry>,
    upserts: u64,
    deletes: u64,
}

impl HierarchyInner {
    fn unlink(&mut self, id: &str, entry: &Entry) {
        if let Some(parent_key) = &entry.parent_key {
            if let Some(siblings) = self.children.get_mut(parent_key) {
                siblings.retain(|(_, child)| path::normalize(child) != entry.path_key);
                if siblings.is_empty() {
                    self.children.remove(parent_key);
                }
            }
        }
        if let Some(ids) = self.by_type.get_mut(&entry.task_type) {
            ids.remove(id);
        }
    }

    fn link(&mut self, id: &str, entry: &Entry) {
        if let Some(parent_key) = &entry.parent_key {
            let siblings = self.children.entry(parent_key.clone()).or_default();
            siblings.push((entry.created_ms, entry.path.clone()));
            siblings.sort();
        }
        self.by_type.entry(entry.task_type).or_default().insert(id.to_string());
    }
}

#[derive(Default)]
pub struct HierarchyIndex {
    inner: RwLock<HierarchyInner>,
}

impl HierarchyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordered child paths of a parent.
    pub fn children_of(&self, parent: &str) -> Vec<String> {
        self.inner
            .read()
            .children
            .get(&path::normalize(parent))
            .map(|children| children.iter().map(|(_, child)| child.clone()).collect())
            .unwrap_or_default()
    }

    pub fn ids_of_type(&self, task_type: TaskType) -> Vec<String> {
        self.inner
            .read()
            .by_type
            .get(&task_type)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Paths of the entire subtree below `root`, deepest first. The root
    /// itself is not included.
    pub fn subtree_of(&self, root: &str) -> Vec<String> {
        let mut frontier = vec![path::normalize(root)];
        let mut collected: Vec<String> = Vec::new();

        while let Some(parent) = frontier.pop() {
            for child in self.children_of(&parent) {
                frontier.push(path::normalize(&child));
                collected.push(child);
            }
        }

        collected.sort_by_key(|p| std::cmp::Reverse(path::depth(p)));
        collected
    }
}

impl TaskIndex for HierarchyIndex {
    fn name(&self) -> &'static str {
        "hierarchy"
    }

    fn upsert(&self, record: &TaskRecord) -> Result<()> {
        let mut inner = self.inner.write();

        if let Some(previous) = inner.entries.remove(&record.id) {
            inner.unlink(&record.id, &previous);
        }

        let entry = Entry {
            path: record.path.clone(),
            path_key: record.path_key.clone(),
            parent_key: record.parent_key.clone(),
            task_type: record.task_type,
            created_ms: record.created_ms,
        };
        inner.link(&record.id, &entry);
        inner.entries.insert(record.id.clone(), entry);
        inner.upserts += 1;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.remove(id) {
            inner.unlink(id, &entry);
            inner.deletes += 1;
        }
        Ok(())
    }

    fn query(&self, query: &IndexQuery) -> IndexQueryResult {
        let ids = match query.task_type {
            Some(task_type) => {
                let inner = self.inner.read();
                inner
                    .by_type
                    .get(&task_type)
                    .map(|ids| ids.iter().cloned().collect())
                    .unwrap_or_default()
            }
            None => {
                let inner = self.inner.read();
                let mut ids: Vec<String> = inner.entries.keys().cloned().collect();
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
        inner.children.clear();
        inner.by_type.clear();
        inner.entries.clear();
    }

    fn stats(&self) -> IndexStats {
        let inner = self.inner.read();
        IndexStats {
            name: self.name(),
            entries: inner.entries.len(),
            upserts: inner.upserts,
            deletes: inner.deletes,
        }
    }
}
