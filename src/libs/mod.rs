//! Core library modules for the taskhive coordination core.
//!
//! Serves as the main entry point for shared infrastructure, providing a
//! centralized access point to models, configuration, and the ambient
//! services the storage layer composes.
//!
//! ## Features
//!
//! - **Core Infrastructure**: Configuration, data storage paths, identifiers,
//!   structured logging
//! - **Models**: Tasks, knowledge entries, projects, citations
//! - **Coordination**: Event bus, request tracer, cancellation tokens
//! - **Validation**: Pluggable rule pipeline with strict and lenient modes
//! - **Caching**: Read-through result cache with pressure-driven reduction
//!
//! ## Usage
//!
//! ```rust,no_run
//! use taskhive::libs::task::{Task, TaskType};
//!
//! let draft = Task::draft("proj/api", "API", TaskType::Milestone);
//! assert_eq!(draft.parent_path.as_deref(), Some("proj"));
//! ```
//!
//! ## Thread Safety
//!
//! Shared components (event bus, cache, tracer) guard their state with
//! short `parking_lot` critical sections and are safe to share behind
//! `Arc` across worker threads.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod data_storage;
pub mod error;
pub mod events;
pub mod ident;
pub mod knowledge;
pub mod logger;
pub mod monitor;
pub mod task;
pub mod tracer;
pub mod validation;
