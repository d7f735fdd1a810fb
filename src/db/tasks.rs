//! Task persistence: CRUD and querying against the durable store.
//!
//! This module provides the storage-side functionality for tasks. It handles
//! all database interactions for task creation, modification, deletion, and
//! retrieval, including path-keyed lookups, glob patterns, status scans,
//! hierarchy walks, and reverse dependency queries.
//!
//! ## Storage Model
//!
//! The `tasks` table stores one row per task keyed by minted `id` and by
//! canonical `path`. Matching is case-insensitive via the `path_key` /
//! `parent_key` columns while the original casing is preserved in `path` /
//! `parent_path`. Set-valued attributes (dependencies, tags, links) and the
//! bounded metadata bag are stored as JSON columns; directed edges only,
//! reverse lookups are answered with `json_each` scans backed by indexes.
//!
//! Notes live in their own table and are attached to query results the way
//! the surrounding services expect them — always ordered by creation time.
//!
//! All functions borrow a [`Connection`] so they compose with whatever
//! transaction scope the coordinator currently holds.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use taskhive::db::tasks::TaskStore;
//! # let conn = rusqlite::Connection::open_in_memory().unwrap();
//!
//! let children = TaskStore::get_children(&conn, "proj/api")?;
//! let blocked = TaskStore::get_dependents(&conn, "proj/api/login")?;
//! # taskhive::libs::error::Result::Ok(())
//! ```

use crate::libs::error::Result;
use crate::libs::task::{path, Note, NoteCategory, Priority, Task, TaskStatus, TaskType};
use rusqlite::{params, Connection, ToSql};

/// Explicit column list shared by every SELECT so later migrations cannot
/// reorder what the row mapper sees.
const TASK_COLUMNS: &str = "id, path, path_key, parent_path, project_id, name, description, task_type, status, priority, \
     dependencies, tags, links, metadata, reasoning, assigned_to, completion_requirements, output_format, \
     created_ms, updated_ms, version";

/// Insert a task row with every attribute supplied by the service layer.
const INSERT_TASK: &str = "INSERT INTO tasks (id, path, path_key, parent_path, parent_key, project_id, name, description, task_type, status, \
     priority, dependencies, tags, links, metadata, reasoning, assigned_to, completion_requirements, output_format, \
     created_ms, updated_ms, version) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)";

/// Update every mutable attribute of a task row by id.
const UPDATE_TASK: &str = "UPDATE tasks SET name = ?1, description = ?2, status = ?3, priority = ?4, project_id = ?5, \
     dependencies = ?6, tags = ?7, links = ?8, metadata = ?9, reasoning = ?10, assigned_to = ?11, \
     completion_requirements = ?12, output_format = ?13, parent_path = ?14, parent_key = ?15, \
     path = ?16, path_key = ?17, updated_ms = ?18, version = ?19 WHERE id = ?20";

const DELETE_BY_ID: &str = "DELETE FROM tasks WHERE id = ?1";
const DELETE_BY_PATH: &str = "DELETE FROM tasks WHERE path_key = ?1";

const WHERE_PATH: &str = "WHERE path_key = ?1";
const WHERE_ID: &str = "WHERE id = ?1";
const WHERE_PATTERN: &str = "WHERE path_key LIKE ?1 ESCAPE '\\'";
const WHERE_STATUS: &str = "WHERE status = ?1";
const WHERE_CHILDREN: &str = "WHERE parent_key = ?1 ORDER BY created_ms, path_key";

/// Reverse dependency scan over the JSON edge list.
const WHERE_DEPENDENT: &str = "WHERE EXISTS (SELECT 1 FROM json_each(tasks.dependencies) je WHERE lower(je.value) = ?1)";

const INSERT_NOTE: &str = "INSERT INTO notes (id, task_id, category, content, created_ms) VALUES (?1, ?2, ?3, ?4, ?5)";
const SELECT_NOTES: &str = "SELECT id, category, content, created_ms FROM notes WHERE task_id = ?1 ORDER BY created_ms, id";

/// Storage interface for tasks. Stateless; every call borrows the caller's
/// connection so reads and writes join the active transaction scope.
pub struct TaskStore;

impl TaskStore {
    /// Inserts a new task row. The service has already minted the id,
    /// stamped the timestamps, and set `version` to 1.
    pub fn insert(conn: &Connection, task: &Task) -> Result<()> {
        conn.execute(
            INSERT_TASK,
            params![
                task.id,
                task.path,
                path::normalize(&task.path),
                task.parent_path,
                task.parent_path.as_deref().map(path::normalize),
                task.project_id,
                task.name,
                task.description,
                task.task_type.as_str(),
                task.status.as_str(),
                task.priority.as_str(),
                serde_json::to_string(&task.dependencies)?,
                serde_json::to_string(&task.tags)?,
                serde_json::to_string(&task.links)?,
                serde_json::to_string(&task.metadata)?,
                task.reasoning,
                task.assigned_to,
                task.completion_requirements,
                task.output_format,
                task.created_ms,
                task.updated_ms,
                task.version,
            ],
        )?;

        for note in &task.notes {
            Self::insert_note(conn, &task.id, note)?;
        }

        Ok(())
    }

    /// Rewrites a task row. Returns the number of rows touched (0 when the
    /// id is unknown — the caller turns that into NOT_FOUND).
    pub fn update(conn: &Connection, task: &Task) -> Result<usize> {
        let affected = conn.execute(
            UPDATE_TASK,
            params![
                task.name,
                task.description,
                task.status.as_str(),
                task.priority.as_str(),
                task.project_id,
                serde_json::to_string(&task.dependencies)?,
                serde_json::to_string(&task.tags)?,
                serde_json::to_string(&task.links)?,
                serde_json::to_string(&task.metadata)?,
                task.reasoning,
                task.assigned_to,
                task.completion_requirements,
                task.output_format,
                task.parent_path,
                task.parent_path.as_deref().map(path::normalize),
                task.path,
                path::normalize(&task.path),
                task.updated_ms,
                task.version,
                task.id,
            ],
        )?;

        Ok(affected)
    }

    /// Deletes by path or id. Returns affected row count; deleting a
    /// missing task is a no-op with `affected == 0`.
    pub fn delete(conn: &Connection, key: &str) -> Result<usize> {
        let affected = if looks_like_id(key) {
            conn.execute(DELETE_BY_ID, params![key])?
        } else {
            conn.execute(DELETE_BY_PATH, params![path::normalize(key)])?
        };
        Ok(affected)
    }

    /// Lookup by canonical path; `None` when absent.
    pub fn get_by_path(conn: &Connection, task_path: &str) -> Result<Option<Task>> {
        let mut tasks = Self::fetch(conn, WHERE_PATH, &[&path::normalize(task_path)])?;
        Ok(tasks.pop())
    }

    /// Lookup by minted id; `None` when absent.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<Task>> {
        let mut tasks = Self::fetch(conn, WHERE_ID, &[&id.to_string()])?;
        Ok(tasks.pop())
    }

    /// Lookup by either key shape.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Task>> {
        if looks_like_id(key) {
            Self::get_by_id(conn, key)
        } else {
            Self::get_by_path(conn, key)
        }
    }

    /// Batch lookup preserving input order; missing keys are skipped.
    pub fn get_by_id_list(conn: &Connection, keys: &[String]) -> Result<Vec<Task>> {
        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(task) = Self::get(conn, key)? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Glob lookup over paths (`*`/`?` wildcards).
    pub fn get_by_pattern(conn: &Connection, pattern: &str) -> Result<Vec<Task>> {
        let like = path::glob_to_like(&path::normalize(pattern));
        Self::fetch(conn, WHERE_PATTERN, &[&like])
    }

    pub fn get_by_status(conn: &Connection, status: TaskStatus) -> Result<Vec<Task>> {
        Self::fetch(conn, WHERE_STATUS, &[&status.as_str().to_string()])
    }

    /// Direct children of a parent, ordered by creation.
    pub fn get_children(conn: &Connection, parent_path: &str) -> Result<Vec<Task>> {
        Self::fetch(conn, WHERE_CHILDREN, &[&path::normalize(parent_path)])
    }

    /// Tasks whose dependency set references `key`.
    pub fn get_dependents(conn: &Connection, key: &str) -> Result<Vec<Task>> {
        Self::fetch(conn, WHERE_DEPENDENT, &[&path::normalize(key)])
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Task>> {
        Self::fetch(conn, "ORDER BY path_key", &[])
    }

    pub fn count(conn: &Connection) -> Result<usize> {
        let count: usize = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Appends a note row for a task.
    pub fn insert_note(conn: &Connection, task_id: &str, note: &Note) -> Result<()> {
        let note_id = note
            .id
            .clone()
            .unwrap_or_else(|| crate::libs::ident::IdGenerator::new().mint("note"));
        conn.execute(
            INSERT_NOTE,
            params![note_id, task_id, note.category.as_str(), note.content, note.created_ms],
        )?;
        Ok(())
    }

    fn notes_for(conn: &Connection, task_id: &str) -> Result<Vec<Note>> {
        let mut stmt = conn.prepare(SELECT_NOTES)?;
        let notes = stmt
            .query_map(params![task_id], |row| {
                let category_raw: String = row.get(1)?;
                Ok(Note {
                    id: Some(row.get(0)?),
                    category: NoteCategory::parse(&category_raw).unwrap_or(NoteCategory::Progress),
                    content: row.get(2)?,
                    created_ms: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    /// Executes `SELECT <columns> FROM tasks <suffix>` and enriches the
    /// resulting tasks with their notes.
    fn fetch(conn: &Connection, suffix: &str, args: &[&String]) -> Result<Vec<Task>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks {suffix}");
        let mut stmt = conn.prepare(&query)?;
        let params: Vec<&dyn ToSql> = args.iter().map(|a| *a as &dyn ToSql).collect();

        let mut tasks = stmt
            .query_map(&params[..], row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        for task in &mut tasks {
            task.notes = Self::notes_for(conn, &task.id)?;
        }

        Ok(tasks)
    }
}

/// Minted task ids never contain `/` and always carry the domain prefix.
fn looks_like_id(key: &str) -> bool {
    key.starts_with("task_") && !key.contains('/')
}

fn parse_failure(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, message.into())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let task_type_raw: String = row.get(7)?;
    let status_raw: String = row.get(8)?;
    let priority_raw: String = row.get(9)?;
    let dependencies_raw: String = row.get(10)?;
    let tags_raw: String = row.get(11)?;
    let links_raw: String = row.get(12)?;
    let metadata_raw: String = row.get(13)?;

    Ok(Task {
        id: row.get(0)?,
        path: row.get(1)?,
        parent_path: row.get(3)?,
        project_id: row.get(4)?,
        name: row.get(5)?,
        description: row.get(6)?,
        task_type: TaskType::parse(&task_type_raw).ok_or_else(|| parse_failure(7, format!("unknown task type: {task_type_raw}")))?,
        status: TaskStatus::parse(&status_raw).ok_or_else(|| parse_failure(8, format!("unknown status: {status_raw}")))?,
        priority: Priority::parse(&priority_raw).ok_or_else(|| parse_failure(9, format!("unknown priority: {priority_raw}")))?,
        dependencies: serde_json::from_str(&dependencies_raw).map_err(|e| parse_failure(10, e.to_string()))?,
        subtasks: Vec::new(),
        notes: Vec::new(),
        reasoning: row.get(14)?,
        links: serde_json::from_str(&links_raw).map_err(|e| parse_failure(12, e.to_string()))?,
        tags: serde_json::from_str(&tags_raw).map_err(|e| parse_failure(11, e.to_string()))?,
        assigned_to: row.get(15)?,
        completion_requirements: row.get(16)?,
        output_format: row.get(17)?,
        metadata: serde_json::from_str(&metadata_raw).map_err(|e| parse_failure(13, e.to_string()))?,
        created_ms: row.get(18)?,
        updated_ms: row.get(19)?,
        version: row.get(20)?,
    })
}
