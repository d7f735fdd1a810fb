//! Cross-platform data storage path management for application files.
//!
//! Provides a unified interface for resolving where the database file,
//! configuration, snapshot archives, and startup backups live. The base
//! directory follows OS conventions and can be overridden for tests and
//! embedded deployments.
//!
//! ## Platform-Specific Storage Locations
//!
//! - **Windows**: `%LOCALAPPDATA%\lacodda\taskhive\`
//! - **macOS**: `~/Library/Application Support/lacodda/taskhive/`
//! - **Linux/Unix**: `~/.local/share/lacodda/taskhive/`
//!
//! The `TASKHIVE_DATA_DIR` environment variable, when set, takes precedence
//! over all platform defaults. It is read once per `DataStorage` instance;
//! later changes are ignored until restart.
//!
//! ## Directory Structure
//!
//! ```text
//! {base}/lacodda/taskhive/
//! ├── taskhive.db          # SQLite database (+ -wal / -shm sidecars)
//! ├── config.json          # Application configuration
//! ├── startup-backups/     # Timestamped pre-open snapshots
//! └── backups/             # Scheduled export archives
//! ```

use anyhow::Result;
use std::env::consts::OS;
use std::env::var;
use std::path::{Path, PathBuf};
use std::{fs, str};

/// Organization directory under the platform data root.
pub const APP_OWNER: &str = "lacodda";

/// Application directory under the organization directory.
pub const APP_NAME: &str = "taskhive";

/// Environment variable overriding the resolved base directory.
pub const DATA_DIR_ENV: &str = "TASKHIVE_DATA_DIR";

/// Cross-platform data storage path manager.
///
/// The base path is resolved once during construction and remains constant
/// for the lifetime of the instance. Path resolution is deterministic, so
/// the struct can be shared freely across threads.
#[derive(Debug, Clone)]
pub struct DataStorage {
    /// Base directory for all application data.
    base_path: PathBuf,
}

impl Default for DataStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStorage {
    /// Creates a storage manager rooted at the platform-appropriate base
    /// path, honoring the `TASKHIVE_DATA_DIR` override.
    pub fn new() -> Self {
        if let Ok(dir) = var(DATA_DIR_ENV) {
            return Self { base_path: PathBuf::from(dir) };
        }

        // Determine platform-specific base directory
        let base_path = match OS {
            "windows" => var("LOCALAPPDATA").unwrap_or_else(|_| ".".into()),
            "macos" => var("HOME").unwrap_or_else(|_| ".".into()) + "/Library/Application Support",
            _ => var("HOME").unwrap_or_else(|_| ".".into()) + "/.local/share",
        };

        let base_path = Path::new(&base_path).join(APP_OWNER).join(APP_NAME);

        Self { base_path }
    }

    /// Creates a storage manager rooted at an explicit directory.
    pub fn at(base_path: impl Into<PathBuf>) -> Self {
        Self { base_path: base_path.into() }
    }

    /// Resolves a filename to a complete path within the data directory,
    /// creating the directory tree on first access.
    pub fn get_path(&self, file_name: &str) -> Result<PathBuf> {
        if !self.base_path.exists() {
            fs::create_dir_all(&self.base_path)?;
        }

        Ok(self.base_path.join(file_name))
    }

    /// Resolves a subdirectory within the data directory, creating it on
    /// first access.
    pub fn get_dir(&self, dir_name: &str) -> Result<PathBuf> {
        let dir = self.base_path.join(dir_name);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }

        Ok(dir)
    }

    /// The resolved base directory.
    pub fn base(&self) -> &Path {
        &self.base_path
    }
}
