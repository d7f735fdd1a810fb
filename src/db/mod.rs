//! Database layer for the taskhive coordination core.
//!
//! Provides a complete data persistence layer built on SQLite, offering
//! type-safe database operations for all core entities, a migration system
//! for schema evolution, the scoped transaction coordinator, the secondary
//! index projections, and the snapshot backup machinery.
//!
//! ## Features
//!
//! - **Core Infrastructure**: Connection management, WAL discipline,
//!   migrations, startup backups
//! - **Entity Stores**: Tasks (with notes), knowledge (with citations),
//!   projects
//! - **Coordination**: Scoped transactions with nesting, timeout, and
//!   retry; atomic multi-index mutation
//! - **Batch Processing**: Dependency-ordered bulk execution and cascading
//!   status closures
//! - **Snapshots**: Consistent tar.gz export/import with scheduled backups
//!
//! ## Usage
//!
//! ```rust,no_run
//! use taskhive::db::{db::Db, tasks::TaskStore};
//! use taskhive::libs::config::StorageConfig;
//!
//! let db = Db::open(&StorageConfig::default())?;
//! let conn = db.conn.lock();
//! let children = TaskStore::get_children(&conn, "proj/api")?;
//! # taskhive::libs::error::Result::Ok(())
//! ```

pub mod backup;
pub mod bulk;
pub mod db;
pub mod index;
pub mod knowledge;
pub mod migrations;
pub mod projects;
pub mod tasks;
pub mod transaction;
