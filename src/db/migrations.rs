//! Database schema migration management and versioning system.
//!
//! Provides a migration framework for evolving the database schema over
//! time while maintaining data integrity and consistency.
//!
//! ## Features
//!
//! - **Version Tracking**: Maintains precise records of applied migrations
//!   in a `schema_migrations` table (`version`, `description`, `applied_at`)
//! - **Automatic Application**: Runs pending migrations during database
//!   initialization, inside a single IMMEDIATE transaction
//! - **Rollback Support**: Per-version `down` steps for reversing schema
//!   changes
//! - **History Tracking**: Complete audit trail of schema changes
//!
//! A failed migration rolls the transaction back and surfaces a fatal
//! error; the process is expected to exit with the migration failure code.

use crate::libs::error::{CoreError, Result};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};

/// SQL schema for the migrations tracking table.
const MIGRATIONS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    id INTEGER PRIMARY KEY,
    version INTEGER NOT NULL UNIQUE,
    description TEXT NOT NULL,
    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

type Step = fn(&Transaction) -> Result<()>;

/// A single database migration with its forward and reverse steps.
#[derive(Clone)]
struct Migration {
    version: u32,
    description: &'static str,
    up: Step,
    down: Option<Step>,
}

/// Central migration system manager that orchestrates schema evolution.
///
/// Designed for single-threaded use during startup; the caller holds the
/// writer connection for the duration.
pub struct MigrationManager {
    migrations: Vec<Migration>,
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationManager {
    pub fn new() -> Self {
        let mut manager = Self { migrations: Vec::new() };
        manager.register_migrations();
        manager
    }

    /// Registers all migrations in chronological order.
    fn register_migrations(&mut self) {
        // Version 1: task hierarchy core
        self.add_migration(
            1,
            "create_tasks_and_notes",
            |tx| {
                tx.execute(
                    "CREATE TABLE IF NOT EXISTS tasks (
                        id TEXT NOT NULL PRIMARY KEY,
                        path TEXT NOT NULL,
                        path_key TEXT NOT NULL UNIQUE,
                        parent_path TEXT,
                        parent_key TEXT,
                        project_id TEXT,
                        name TEXT NOT NULL,
                        description TEXT NOT NULL DEFAULT '',
                        task_type TEXT NOT NULL,
                        status TEXT NOT NULL,
                        priority TEXT NOT NULL,
                        dependencies TEXT NOT NULL DEFAULT '[]',
                        tags TEXT NOT NULL DEFAULT '[]',
                        links TEXT NOT NULL DEFAULT '[]',
                        metadata TEXT NOT NULL DEFAULT '{}',
                        reasoning TEXT NOT NULL DEFAULT '',
                        created_ms INTEGER NOT NULL,
                        updated_ms INTEGER NOT NULL,
                        version INTEGER NOT NULL DEFAULT 1
                    )",
                    [],
                )?;

                tx.execute(
                    "CREATE TABLE IF NOT EXISTS notes (
                        id TEXT NOT NULL PRIMARY KEY,
                        task_id TEXT NOT NULL,
                        category TEXT NOT NULL,
                        content TEXT NOT NULL,
                        created_ms INTEGER NOT NULL,
                        FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
                    )",
                    [],
                )?;

                // hot lookup paths: hierarchy, status, and type scans
                tx.execute("CREATE INDEX IF NOT EXISTS idx_tasks_parent_key ON tasks(parent_key)", [])?;
                tx.execute("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)", [])?;
                tx.execute("CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks(task_type)", [])?;
                tx.execute("CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id)", [])?;
                tx.execute("CREATE INDEX IF NOT EXISTS idx_notes_task ON notes(task_id)", [])?;

                Ok(())
            },
            Some(|tx: &Transaction| {
                tx.execute("DROP TABLE IF EXISTS notes", [])?;
                tx.execute("DROP TABLE IF EXISTS tasks", [])?;
                Ok(())
            }),
        );

        // Version 2: projects and knowledge
        self.add_migration(
            2,
            "create_projects_and_knowledge",
            |tx| {
                tx.execute(
                    "CREATE TABLE IF NOT EXISTS projects (
                        id TEXT NOT NULL PRIMARY KEY,
                        name TEXT NOT NULL UNIQUE,
                        description TEXT NOT NULL DEFAULT '',
                        created_ms INTEGER NOT NULL,
                        updated_ms INTEGER NOT NULL
                    )",
                    [],
                )?;

                tx.execute(
                    "CREATE TABLE IF NOT EXISTS knowledge (
                        id TEXT NOT NULL PRIMARY KEY,
                        project_id TEXT NOT NULL,
                        text TEXT NOT NULL,
                        domain TEXT,
                        tags TEXT NOT NULL DEFAULT '[]',
                        created_ms INTEGER NOT NULL,
                        updated_ms INTEGER NOT NULL,
                        version INTEGER NOT NULL DEFAULT 1,
                        FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
                    )",
                    [],
                )?;

                tx.execute(
                    "CREATE TABLE IF NOT EXISTS citations (
                        id TEXT NOT NULL PRIMARY KEY,
                        knowledge_id TEXT NOT NULL,
                        source TEXT NOT NULL,
                        title TEXT,
                        note TEXT,
                        created_ms INTEGER NOT NULL,
                        FOREIGN KEY (knowledge_id) REFERENCES knowledge(id) ON DELETE CASCADE
                    )",
                    [],
                )?;

                tx.execute("CREATE INDEX IF NOT EXISTS idx_knowledge_project ON knowledge(project_id)", [])?;
                tx.execute("CREATE INDEX IF NOT EXISTS idx_knowledge_domain ON knowledge(domain)", [])?;
                tx.execute("CREATE INDEX IF NOT EXISTS idx_citations_knowledge ON citations(knowledge_id)", [])?;

                Ok(())
            },
            Some(|tx: &Transaction| {
                tx.execute("DROP TABLE IF EXISTS citations", [])?;
                tx.execute("DROP TABLE IF EXISTS knowledge", [])?;
                tx.execute("DROP TABLE IF EXISTS projects", [])?;
                Ok(())
            }),
        );

        // Version 3: assignment and deliverable columns
        self.add_migration(
            3,
            "add_task_assignment_fields",
            |tx| {
                tx.execute("ALTER TABLE tasks ADD COLUMN assigned_to TEXT", [])?;
                tx.execute("ALTER TABLE tasks ADD COLUMN completion_requirements TEXT", [])?;
                tx.execute("ALTER TABLE tasks ADD COLUMN output_format TEXT", [])?;
                Ok(())
            },
            Some(|tx: &Transaction| {
                tx.execute("ALTER TABLE tasks DROP COLUMN output_format", [])?;
                tx.execute("ALTER TABLE tasks DROP COLUMN completion_requirements", [])?;
                tx.execute("ALTER TABLE tasks DROP COLUMN assigned_to", [])?;
                Ok(())
            }),
        );
    }

    fn add_migration(&mut self, version: u32, description: &'static str, up: Step, down: Option<Step>) {
        self.migrations.push(Migration {
            version,
            description,
            up,
            down,
        });
    }

    /// Executes all pending migrations in order within a single IMMEDIATE
    /// transaction. Either every pending migration lands or none do.
    pub fn run_migrations(&self, conn: &mut Connection) -> Result<()> {
        conn.execute(MIGRATIONS_TABLE, [])?;

        let current_version = self.get_current_version(conn)?;
        let pending: Vec<&Migration> = self.migrations.iter().filter(|m| m.version > current_version).collect();

        if pending.is_empty() {
            tracing::debug!(version = current_version, "schema is up to date");
            return Ok(());
        }

        tracing::info!(count = pending.len(), from = current_version, "applying schema migrations");

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for migration in pending {
            tracing::info!(version = migration.version, description = migration.description, "running migration");

            (migration.up)(&tx).map_err(|err| CoreError::StorageIo {
                message: format!("migration {} ({}) failed: {err}", migration.version, migration.description),
                retryable: false,
            })?;

            tx.execute(
                "INSERT INTO schema_migrations (version, description) VALUES (?1, ?2)",
                params![migration.version, migration.description],
            )?;
        }

        tx.commit()?;
        tracing::info!("all migrations completed");

        Ok(())
    }

    fn get_current_version(&self, conn: &Connection) -> Result<u32> {
        let version: Option<u32> = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .unwrap_or(Some(0));

        Ok(version.unwrap_or(0))
    }

    pub fn is_migration_applied(&self, conn: &Connection, version: u32) -> Result<bool> {
        let count: i32 = conn.query_row("SELECT COUNT(*) FROM schema_migrations WHERE version = ?1", params![version], |row| row.get(0))?;

        Ok(count > 0)
    }

    /// Complete migration history as `(version, description, applied_at)`.
    pub fn get_migration_history(&self, conn: &Connection) -> Result<Vec<(u32, String, String)>> {
        let mut stmt = conn.prepare("SELECT version, description, applied_at FROM schema_migrations ORDER BY version")?;

        let history = stmt
            .query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(history)
    }

    /// Rolls applied migrations back to `target_version`, newest first,
    /// running each version's `down` step inside one IMMEDIATE transaction.
    /// Fails if any migration in the range has no reverse step.
    pub fn rollback_to(&self, conn: &mut Connection, target_version: u32) -> Result<()> {
        let current_version = self.get_current_version(conn)?;

        if target_version >= current_version {
            tracing::info!("nothing to roll back");
            return Ok(());
        }

        let mut reversing: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.version > target_version && m.version <= current_version)
            .collect();
        reversing.sort_by(|a, b| b.version.cmp(&a.version));

        for migration in &reversing {
            if migration.down.is_none() {
                return Err(CoreError::Conflict {
                    message: format!("migration {} has no rollback step", migration.version),
                });
            }
        }

        tracing::info!(from = current_version, to = target_version, "rolling back schema");

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for migration in reversing {
            if let Some(down) = migration.down {
                down(&tx)?;
            }
            tx.execute("DELETE FROM schema_migrations WHERE version = ?1", params![migration.version])?;
        }
        tx.commit()?;

        Ok(())
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }
}

/// Initializes a connection by applying all pending migrations.
pub fn init_with_migrations(conn: &mut Connection) -> Result<()> {
    let manager = MigrationManager::new();
    manager.run_migrations(conn)?;
    Ok(())
}

/// Current schema version, 0 when no migration has been applied.
pub fn current_version(conn: &Connection) -> Result<u32> {
    let manager = MigrationManager::new();
    manager.get_current_version(conn)
}

/// Whether the schema lags behind the registered migrations.
pub fn needs_migration(conn: &Connection) -> Result<bool> {
    let manager = MigrationManager::new();
    let current = manager.get_current_version(conn)?;
    Ok(current < manager.latest_version())
}
