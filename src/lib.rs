//! # Taskhive - Hierarchical Task & Knowledge Coordination Core
//!
//! A transactional storage-and-coordination subsystem for managing
//! hierarchical tasks and knowledge entries on behalf of external agent
//! clients.
//!
//! ## Features
//!
//! - **Durable Store**: WAL-backed SQLite persistence with migrations,
//!   checkpointing, and integrity verification
//! - **Transaction Coordination**: Nested scopes, timeouts, deadlock retry
//! - **Secondary Indexes**: Primary, status, and hierarchy projections kept
//!   consistent with the store
//! - **Validation Pipeline**: Schema, hierarchy, dependency, status, and
//!   relationship rules with strict and lenient modes
//! - **Cache & Pressure**: Read-through result cache with memory-pressure
//!   driven reduction
//! - **Bulk Processing**: Dependency-ordered batches with cascading status
//!   updates
//! - **Lifecycle Events**: Process-wide publish/subscribe with bounded history
//!
//! ## Usage
//!
//! ```rust,no_run
//! use taskhive::libs::config::Config;
//! use taskhive::services::CoreContext;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::read()?;
//!     let core = CoreContext::build(config)?;
//!     let task = core.tasks.get_task("proj/api")?;
//!     Ok(())
//! }
//! ```

pub mod db;
pub mod libs;
pub mod services;
