//! Core database connection management and initialization infrastructure.
//!
//! Provides foundational database functionality including connection
//! management, WAL journal discipline, startup backups, schema migration
//! orchestration, and the maintenance operations of the durable store.
//!
//! ## Features
//!
//! - **Connection Management**: Establishing and configuring the writer
//!   connection with the journal pragmas from [`StorageConfig`]
//! - **Startup Backups**: Timestamped copies of the database and its WAL/SHM
//!   sidecars before the live file is opened, last five retained
//! - **WAL Discipline**: Checkpoint-to-truncate on startup, periodic
//!   checkpoints from the maintenance loop
//! - **Maintenance**: vacuum, analyze, integrity verification, relationship
//!   repair, stats and metrics
//! - **Migration Orchestration**: Coordinating automatic schema updates
//!
//! ## Startup Sequence
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │ snapshot old DB  │──▶│ open + configure │──▶│ checkpoint WAL   │
//! │ (+ WAL/SHM) into │   │ connection       │   │ (TRUNCATE) into  │
//! │ startup-backups/ │   │ (pragmas)        │   │ the main file    │
//! └──────────────────┘   └──────────────────┘   └────────┬─────────┘
//!                                                        │
//!                                               ┌────────▼─────────┐
//!                                               │ apply pending    │
//!                                               │ schema migrations│
//!                                               └──────────────────┘
//! ```
//!
//! A fresh directory (no database file) skips the snapshot and instead
//! removes any stray `-wal`/`-shm` sidecars a crashed predecessor may have
//! left behind without their main file.
//!
//! ## Durability Contract
//!
//! The store runs in WAL mode: a commit is durable once its frames survive
//! a checkpoint into the main file or the journal fsync. Startup performs
//! a checkpoint-to-truncate so every boot begins from a folded, minimal
//! WAL; the maintenance loop repeats the checkpoint on its configured
//! interval.
//!
//! ## Thread Safety
//!
//! The writer connection is guarded by a mutex and shared with the
//! transaction coordinator; all writes in the process funnel through it,
//! which matches SQLite's single-writer model under WAL. Maintenance
//! methods take the same mutex and therefore serialize naturally with
//! in-flight scopes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use taskhive::db::db::Db;
//! use taskhive::libs::config::StorageConfig;
//!
//! let db = Db::open(&StorageConfig::default())?;
//! let stats = db.stats()?;
//! println!("{} tasks on disk", stats.task_count);
//! # taskhive::libs::error::Result::Ok(())
//! ```

use crate::db::migrations;
use crate::libs::config::StorageConfig;
use crate::libs::data_storage::DataStorage;
use crate::libs::error::{CoreError, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory holding pre-open snapshots, sibling to the database file.
pub const STARTUP_BACKUP_DIR: &str = "startup-backups";

/// Number of startup snapshots retained.
const STARTUP_BACKUPS_KEPT: usize = 5;

/// Aggregate store statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub task_count: usize,
    pub knowledge_count: usize,
    pub project_count: usize,
    pub page_count: u64,
    pub page_size: u64,
    pub file_bytes: u64,
}

/// Lower-level engine metrics for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DbMetrics {
    pub schema_version: u32,
    pub freelist_pages: u64,
    pub wal_autocheckpoint: i64,
    pub journal_mode: String,
}

/// Outcome of a WAL checkpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CheckpointResult {
    /// Non-zero when the checkpoint could not complete (writers active).
    pub busy: i64,
    /// Frames in the WAL.
    pub log_frames: i64,
    /// Frames successfully moved into the main file.
    pub checkpointed_frames: i64,
}

/// Outcome of a relationship repair pass.
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub fixed: usize,
    pub issues: Vec<String>,
}

/// Core database manager owning the writer connection.
///
/// The `Db` struct serves as the primary gateway to durable storage. It
/// encapsulates a fully configured SQLite connection and provides both the
/// initialization path (backups, pragmas, checkpoint, migrations) and the
/// recurring maintenance operations the core schedules.
///
/// ## Design Philosophy
///
/// The struct follows the principle of "initialization with validation":
/// once `Db::open` returns, callers can be confident that
/// - the database file is accessible and writable,
/// - the previous generation was snapshot before being touched,
/// - the journal discipline from the configuration is in force,
/// - the schema is current and properly migrated.
pub struct Db {
    pub conn: Arc<Mutex<Connection>>,
    base_dir: PathBuf,
    db_path: PathBuf,
    config: StorageConfig,
}

impl Db {
    /// Opens (or creates) the database with complete initialization.
    ///
    /// This is the single constructor for durable storage. It performs the
    /// full startup sequence described in the module documentation:
    ///
    /// 1. **Base Directory Resolution**: an explicit `base_dir` wins,
    ///    otherwise the platform data directory is used
    /// 2. **Startup Backup**: an existing database (plus WAL/SHM sidecars)
    ///    is copied into a timestamped directory under `startup-backups/`,
    ///    retaining the newest five generations
    /// 3. **Sidecar Hygiene**: on a fresh directory, stray `-wal`/`-shm`
    ///    files without a main database are removed
    /// 4. **Connection Configuration**: busy timeout, statement cache,
    ///    page size, cache size, mmap window, temp store, locking mode,
    ///    auto vacuum, synchronous level, foreign keys, journal mode
    /// 5. **Checkpoint**: leftover WAL frames are folded into the main
    ///    file and the WAL truncated
    /// 6. **Migration**: all pending schema migrations are applied inside
    ///    an IMMEDIATE transaction
    ///
    /// # Arguments
    ///
    /// * `config` - Storage configuration; every field has a documented
    ///   default
    ///
    /// # Returns
    ///
    /// Returns a fully initialized `Db` ready for immediate use by the
    /// coordinator and the stores.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use taskhive::db::db::Db;
    /// use taskhive::libs::config::StorageConfig;
    ///
    /// let config = StorageConfig {
    ///     base_dir: Some("/var/lib/taskhive".to_string()),
    ///     ..StorageConfig::default()
    /// };
    /// let db = Db::open(&config)?;
    /// db.verify_integrity()?;
    /// # taskhive::libs::error::Result::Ok(())
    /// ```
    ///
    /// # Error Scenarios
    ///
    /// - **File System**: the base directory cannot be created, or the
    ///   snapshot copy fails
    /// - **Permissions**: insufficient permissions for the database file
    /// - **Corruption**: the file exists but is not a database
    ///   (surfaces as a fatal `StorageCorrupt`)
    /// - **Migration**: a schema migration fails; the transaction rolls
    ///   back and the process is expected to exit with the migration
    ///   failure code
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let base_dir = match &config.base_dir {
            Some(dir) => PathBuf::from(dir),
            None => DataStorage::new().base().to_path_buf(),
        };
        fs::create_dir_all(&base_dir)?;
        let db_path = base_dir.join(&config.name);

        // Snapshot the previous generation before touching the live file
        if db_path.exists() {
            backup_on_startup(&base_dir, &db_path)?;
        } else {
            remove_stray_sidecars(&db_path);
        }

        let conn = Connection::open(&db_path)?;
        apply_pragmas(&conn, config)?;

        // Fold any leftover WAL content into the main file so a crashed
        // predecessor leaves no pending frames behind
        let _ = checkpoint_truncate(&conn)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            base_dir,
            db_path,
            config: config.clone(),
        };

        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        migrations::init_with_migrations(&mut conn)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Rebuilds the database file, reclaiming free pages.
    ///
    /// ## When It Runs
    ///
    /// The maintenance loop invokes this on `vacuum_interval_s` (default
    /// one hour). It can also be called directly by operational tooling
    /// after large deletions.
    ///
    /// ## Performance Notes
    ///
    /// VACUUM rewrites the entire file and takes the writer mutex for its
    /// full duration; concurrent scopes queue behind it. On large stores
    /// this is the most expensive maintenance operation by far.
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("VACUUM")?;
        tracing::debug!("vacuum completed");
        Ok(())
    }

    /// Refreshes the query planner statistics.
    ///
    /// Cheap relative to [`vacuum`]; improves index selection for the
    /// path/status/type scans after the data distribution shifts.
    ///
    /// [`vacuum`]: Db::vacuum
    pub fn analyze(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("ANALYZE")?;
        Ok(())
    }

    /// Checkpoints the WAL into the main file and truncates it.
    ///
    /// A commit is durable once its frames survive this (or the journal
    /// fsync). The maintenance loop calls it on `checkpoint_interval_s`
    /// (default five minutes) and the binary performs a final checkpoint
    /// on shutdown.
    ///
    /// # Returns
    ///
    /// Returns the raw checkpoint counters: a non-zero `busy` means
    /// active readers prevented full truncation — harmless, the next
    /// cycle picks it up.
    pub fn checkpoint(&self) -> Result<CheckpointResult> {
        let conn = self.conn.lock();
        checkpoint_truncate(&conn)
    }

    /// Runs `PRAGMA integrity_check` over the whole file.
    ///
    /// # Returns
    ///
    /// Returns `Ok(())` when the engine answers `ok`.
    ///
    /// # Error Scenarios
    ///
    /// Any other answer surfaces as a fatal `StorageCorrupt`; per the
    /// failure model the process shuts down cleanly after attempting a
    /// final backup rather than serving from a damaged store.
    pub fn verify_integrity(&self) -> Result<()> {
        let conn = self.conn.lock();
        let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if verdict == "ok" {
            Ok(())
        } else {
            Err(CoreError::StorageCorrupt {
                message: format!("integrity check failed: {verdict}"),
            })
        }
    }

    /// Scans for parent/child inconsistencies in the task table and,
    /// unless `dry_run`, rewrites the stored parent references derived
    /// from each task's own path.
    ///
    /// ## Handled Classes
    ///
    /// - `parent_path` disagreeing with the parent derived from `path` —
    ///   repaired by rewriting the stored reference
    /// - `parent_path` referencing a task that does not exist (orphan) —
    ///   reported but never auto-deleted
    ///
    /// This is also the repair pass that consumes index divergences logged
    /// by the coordinator in non-atomic mode.
    ///
    /// # Arguments
    ///
    /// * `dry_run` - When true, only report; when false, rewrite drifted
    ///   parent references
    ///
    /// # Returns
    ///
    /// Returns `{fixed, issues}`: the number of rewritten rows and a
    /// human-readable description of every inconsistency found.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use taskhive::db::db::Db;
    /// # use taskhive::libs::config::StorageConfig;
    /// # let db = Db::open(&StorageConfig::default())?;
    /// let report = db.repair_relationships(true)?;
    /// for issue in &report.issues {
    ///     eprintln!("drift: {issue}");
    /// }
    /// # taskhive::libs::error::Result::Ok(())
    /// ```
    pub fn repair_relationships(&self, dry_run: bool) -> Result<RepairReport> {
        let conn = self.conn.lock();
        let mut issues = Vec::new();
        let mut fixed = 0;

        let mut stmt = conn.prepare("SELECT path, parent_path FROM tasks")?;
        let rows: Vec<(String, Option<String>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        for (path, stored_parent) in rows {
            let derived = crate::libs::task::path::parent(&path).map(|p| p.to_string());

            if stored_parent != derived {
                issues.push(format!("parent mismatch for {path}: stored {stored_parent:?}, derived {derived:?}"));
                if !dry_run {
                    conn.execute(
                        "UPDATE tasks SET parent_path = ?1, parent_key = ?2 WHERE path = ?3",
                        rusqlite::params![derived, derived.as_deref().map(crate::libs::task::path::normalize), path],
                    )?;
                    fixed += 1;
                }
                continue;
            }

            if let Some(parent) = &derived {
                let exists: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE path_key = ?1",
                    [crate::libs::task::path::normalize(parent)],
                    |row| row.get(0),
                )?;
                if exists == 0 {
                    issues.push(format!("orphaned task {path}: parent {parent} does not exist"));
                }
            }
        }

        Ok(RepairReport { fixed, issues })
    }

    /// Row counts and file geometry for operational dashboards.
    pub fn stats(&self) -> Result<DbStats> {
        let conn = self.conn.lock();
        let task_count: usize = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        let knowledge_count: usize = conn.query_row("SELECT COUNT(*) FROM knowledge", [], |row| row.get(0))?;
        let project_count: usize = conn.query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))?;
        let page_count: u64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: u64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(DbStats {
            task_count,
            knowledge_count,
            project_count,
            page_count,
            page_size,
            file_bytes: fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0),
        })
    }

    /// Engine-level diagnostics: schema version, freelist, journal state.
    pub fn metrics(&self) -> Result<DbMetrics> {
        let conn = self.conn.lock();
        Ok(DbMetrics {
            schema_version: migrations::current_version(&conn)?,
            freelist_pages: conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?,
            wal_autocheckpoint: conn.query_row("PRAGMA wal_autocheckpoint", [], |row| row.get(0))?,
            journal_mode: conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?,
        })
    }
}

fn apply_pragmas(conn: &Connection, config: &StorageConfig) -> Result<()> {
    conn.busy_timeout(std::time::Duration::from_millis(config.connection.busy_timeout_ms))?;
    conn.set_prepared_statement_cache_capacity(config.performance.statement_cache_size);

    // page_size must be set before the database is first written
    conn.pragma_update(None, "page_size", config.performance.page_size)?;
    conn.pragma_update(None, "cache_size", config.performance.cache_size)?;
    conn.pragma_update(None, "temp_store", config.journal.temp_store.as_str())?;
    conn.pragma_update(None, "auto_vacuum", config.journal.auto_vacuum.as_str())?;
    conn.pragma_update(None, "synchronous", config.journal.synchronous.as_str())?;
    conn.pragma_update(None, "foreign_keys", true)?;

    // these pragmas echo their new value back as a row
    let _: i64 = conn.query_row(&format!("PRAGMA mmap_size = {}", config.performance.mmap_size), [], |row| row.get(0))?;
    let _: String = conn.query_row(&format!("PRAGMA locking_mode = {}", config.journal.locking_mode), [], |row| row.get(0))?;
    let mode: String = conn.query_row(&format!("PRAGMA journal_mode = {}", config.journal.mode), [], |row| row.get(0))?;
    tracing::debug!(journal_mode = %mode, "database configured");

    Ok(())
}

fn checkpoint_truncate(conn: &Connection) -> Result<CheckpointResult> {
    let result = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
        Ok(CheckpointResult {
            busy: row.get(0)?,
            log_frames: row.get(1)?,
            checkpointed_frames: row.get(2)?,
        })
    })?;
    Ok(result)
}

/// Copies the database file plus WAL/SHM sidecars into a timestamped
/// directory under `startup-backups/`, retaining the newest five.
fn backup_on_startup(base_dir: &Path, db_path: &Path) -> Result<()> {
    let backup_root = base_dir.join(STARTUP_BACKUP_DIR);
    fs::create_dir_all(&backup_root)?;

    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f").to_string();
    let target = backup_root.join(&stamp);
    fs::create_dir_all(&target)?;

    for path in [db_path.to_path_buf(), sidecar(db_path, "-wal"), sidecar(db_path, "-shm")] {
        if path.exists() {
            if let Some(name) = path.file_name() {
                fs::copy(&path, target.join(name))?;
            }
        }
    }

    // retention: drop oldest directories beyond the keep budget
    let mut generations: Vec<PathBuf> = fs::read_dir(&backup_root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    generations.sort();
    while generations.len() > STARTUP_BACKUPS_KEPT {
        let stale = generations.remove(0);
        let _ = fs::remove_dir_all(stale);
    }

    Ok(())
}

/// Removes WAL/SHM files left behind without their main database file.
fn remove_stray_sidecars(db_path: &Path) {
    for suffix in ["-wal", "-shm"] {
        let sidecar = sidecar(db_path, suffix);
        if sidecar.exists() {
            tracing::warn!(path = %sidecar.display(), "removing stray sidecar");
            let _ = fs::remove_file(sidecar);
        }
    }
}

fn sidecar(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
