//! Snapshot export/import and the scheduled backup loop.
//!
//! A snapshot is a `.tar.gz` archive holding one JSON document per entity
//! family plus a manifest. Export reads everything inside a single snapshot
//! read scope, so the archive is consistent with one committed state;
//! import clears the store and restores the archive inside one IMMEDIATE
//! scope, then the caller rebuilds the secondary indexes.
//!
//! Scheduled backups honor the minute/hour fields of the configured cron
//! expression (e.g. `"0 */6 * * *"`), keep at most `max_backups` archives,
//! and optionally run once right after startup.

use crate::db::knowledge::KnowledgeStore;
use crate::db::migrations;
use crate::db::projects::ProjectStore;
use crate::db::tasks::TaskStore;
use crate::libs::cancel::CancelToken;
use crate::libs::config::BackupConfig;
use crate::libs::error::{CoreError, Result};
use crate::libs::knowledge::{Knowledge, Project};
use crate::libs::task::Task;
use chrono::{Local, Timelike};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Directory for scheduled archives under the data directory.
pub const BACKUP_DIR: &str = "backups";

const MANIFEST_ENTRY: &str = "manifest.json";
const TASKS_ENTRY: &str = "tasks.json";
const KNOWLEDGE_ENTRY: &str = "knowledge.json";
const PROJECTS_ENTRY: &str = "projects.json";

/// Snapshot metadata written alongside the entity documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub created_ms: i64,
    pub task_count: usize,
    pub knowledge_count: usize,
    pub project_count: usize,
}

/// Writes a consistent snapshot of the store to `target`.
///
/// The caller must invoke this inside a read scope (the services wrap it in
/// a DEFERRED transaction) so all documents describe one committed state.
pub fn export(conn: &Connection, target: &Path) -> Result<SnapshotManifest> {
    let tasks = TaskStore::list_all(conn)?;
    let knowledge = KnowledgeStore::list_all(conn)?;
    let projects = ProjectStore::list_all(conn)?;

    let manifest = SnapshotManifest {
        schema_version: migrations::current_version(conn)?,
        created_ms: chrono::Utc::now().timestamp_millis(),
        task_count: tasks.len(),
        knowledge_count: knowledge.len(),
        project_count: projects.len(),
    };

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(target)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut archive = tar::Builder::new(encoder);

    append_json(&mut archive, MANIFEST_ENTRY, &manifest)?;
    append_json(&mut archive, TASKS_ENTRY, &tasks)?;
    append_json(&mut archive, KNOWLEDGE_ENTRY, &knowledge)?;
    append_json(&mut archive, PROJECTS_ENTRY, &projects)?;

    archive.into_inner()?.finish()?;

    tracing::info!(path = %target.display(), tasks = manifest.task_count, "snapshot exported");
    Ok(manifest)
}

/// Restores a snapshot archive into the store, replacing its contents.
///
/// The caller wraps this in one IMMEDIATE scope and rebuilds the secondary
/// indexes afterwards; a failed restore therefore leaves the previous state
/// untouched.
pub fn import(conn: &Connection, source: &Path) -> Result<SnapshotManifest> {
    let (manifest, tasks, knowledge, projects) = read_archive(source)?;

    conn.execute("DELETE FROM notes", [])?;
    conn.execute("DELETE FROM tasks", [])?;
    conn.execute("DELETE FROM citations", [])?;
    conn.execute("DELETE FROM knowledge", [])?;
    conn.execute("DELETE FROM projects", [])?;

    for project in &projects {
        ProjectStore::insert(conn, project)?;
    }
    for task in &tasks {
        TaskStore::insert(conn, task)?;
    }
    for entry in &knowledge {
        KnowledgeStore::insert(conn, entry)?;
    }

    tracing::info!(path = %source.display(), tasks = tasks.len(), "snapshot imported");
    Ok(manifest)
}

fn read_archive(source: &Path) -> Result<(SnapshotManifest, Vec<Task>, Vec<Knowledge>, Vec<Project>)> {
    let file = File::open(source)?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    let mut manifest: Option<SnapshotManifest> = None;
    let mut tasks: Option<Vec<Task>> = None;
    let mut knowledge: Option<Vec<Knowledge>> = None;
    let mut projects: Option<Vec<Project>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        let mut contents = String::new();
        entry.read_to_string(&mut contents)?;

        match name.as_str() {
            MANIFEST_ENTRY => manifest = Some(serde_json::from_str(&contents)?),
            TASKS_ENTRY => tasks = Some(serde_json::from_str(&contents)?),
            KNOWLEDGE_ENTRY => knowledge = Some(serde_json::from_str(&contents)?),
            PROJECTS_ENTRY => projects = Some(serde_json::from_str(&contents)?),
            other => tracing::debug!(entry = other, "ignoring unknown snapshot entry"),
        }
    }

    match (manifest, tasks, knowledge, projects) {
        (Some(manifest), Some(tasks), Some(knowledge), Some(projects)) => Ok((manifest, tasks, knowledge, projects)),
        _ => Err(CoreError::StorageIo {
            message: format!("snapshot archive incomplete: {}", source.display()),
            retryable: false,
        }),
    }
}

fn append_json<W: std::io::Write, T: Serialize>(archive: &mut tar::Builder<W>, name: &str, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, name, body.as_slice())?;
    Ok(())
}

/// Minute/hour cron schedule (`m h * * *`, `*` and `*/n` forms).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    minute: Field,
    hour: Field,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Any,
    Every(u32),
    Exact(u32),
}

impl Field {
    fn parse(raw: &str) -> Option<Self> {
        if raw == "*" {
            return Some(Field::Any);
        }
        if let Some(step) = raw.strip_prefix("*/") {
            return step.parse().ok().map(Field::Every);
        }
        raw.parse().ok().map(Field::Exact)
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Every(step) => *step > 0 && value % step == 0,
            Field::Exact(exact) => value == *exact,
        }
    }
}

impl Schedule {
    /// Parses the minute and hour fields of a five-field cron expression.
    pub fn parse(expression: &str) -> Option<Self> {
        let mut fields = expression.split_whitespace();
        let minute = Field::parse(fields.next()?)?;
        let hour = Field::parse(fields.next()?)?;
        Some(Self { minute, hour })
    }

    pub fn matches(&self, minute: u32, hour: u32) -> bool {
        self.minute.matches(minute) && self.hour.matches(hour)
    }
}

/// Scheduled backup loop. Ticks once a minute, exporting when the schedule
/// matches and pruning archives beyond the retention budget.
pub struct BackupScheduler {
    config: BackupConfig,
    backup_dir: PathBuf,
    schedule: Option<Schedule>,
}

impl BackupScheduler {
    pub fn new(config: BackupConfig, data_dir: &Path) -> Self {
        let schedule = Schedule::parse(&config.schedule);
        if schedule.is_none() {
            tracing::warn!(expression = %config.schedule, "unparseable backup schedule, scheduled backups disabled");
        }
        Self {
            config,
            backup_dir: data_dir.join(BACKUP_DIR),
            schedule,
        }
    }

    pub fn archive_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        self.backup_dir.join(format!("snapshot-{stamp}.tar.gz"))
    }

    /// Removes the oldest archives beyond `max_backups`.
    pub fn prune(&self) -> Result<usize> {
        if !self.backup_dir.exists() {
            return Ok(0);
        }

        let mut archives: Vec<PathBuf> = std::fs::read_dir(&self.backup_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.file_name().and_then(|n| n.to_str()).map(|n| n.starts_with("snapshot-")).unwrap_or(false))
            .collect();
        archives.sort();

        let mut pruned = 0;
        while archives.len() > self.config.max_backups {
            let stale = archives.remove(0);
            std::fs::remove_file(stale)?;
            pruned += 1;
        }
        Ok(pruned)
    }

    /// Background loop driving scheduled exports through `run_export`,
    /// which the context wires to a consistent-read export. Fires at most
    /// once per matching minute.
    pub async fn run(&self, cancel: CancelToken, run_export: impl Fn(&Path) -> Result<SnapshotManifest>) {
        let Some(schedule) = self.schedule else { return };
        if !self.config.enabled {
            return;
        }

        let mut last_fired: Option<(u32, u32)> = None;
        while !cancel.is_cancelled() {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            if cancel.is_cancelled() {
                break;
            }

            let now = Local::now();
            let slot = (now.hour(), now.minute());
            if !schedule.matches(now.minute(), now.hour()) || last_fired == Some(slot) {
                continue;
            }
            last_fired = Some(slot);

            let target = self.archive_path();
            match run_export(&target) {
                Ok(manifest) => {
                    tracing::info!(tasks = manifest.task_count, "scheduled backup completed");
                    if let Err(err) = self.prune() {
                        tracing::warn!(error = %err, "backup pruning failed");
                    }
                }
                Err(err) => tracing::error!(error = %err, "scheduled backup failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_parsing() {
        let every_six = Schedule::parse("0 */6 * * *").unwrap();
        assert!(every_six.matches(0, 0));
        assert!(every_six.matches(0, 6));
        assert!(every_six.matches(0, 18));
        assert!(!every_six.matches(0, 5));
        assert!(!every_six.matches(30, 6));

        let nightly = Schedule::parse("30 2 * * *").unwrap();
        assert!(nightly.matches(30, 2));
        assert!(!nightly.matches(30, 3));

        assert!(Schedule::parse("not a schedule").is_none());
    }
}
