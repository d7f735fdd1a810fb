//! Configuration management for the coordination core.
//!
//! Handles all tunable parameters of the storage engine, transaction
//! coordinator, cache, tracer, and backup scheduler. Configuration is
//! stored as JSON in the platform data directory and can be partially
//! specified: every section and field falls back to a documented default,
//! so an empty file (or no file at all) yields a fully working setup.
//!
//! ## Configuration Structure
//!
//! - **Storage**: database location, connection limits, performance pragmas,
//!   journal discipline
//! - **Logging**: minimum level, console/file sinks, rotation limits
//! - **Cache**: memory ceiling, pressure thresholds, monitor cadence
//! - **Tracer**: retention limits for per-operation traces
//! - **Backup**: schedule, retention, startup behavior
//! - **Service**: admission limits and validation mode for the high-level API
//!
//! ## Environment
//!
//! `.env` files are honored via `dotenv`. `TASKHIVE_DATA_DIR` relocates the
//! data directory and `TASKHIVE_LOG_LEVEL` overrides `logging.min_level`.
//! Environment is read once at startup; later changes are ignored until
//! restart.
//!
//! ## Usage Examples
//!
//! ```rust,no_run
//! use taskhive::libs::config::Config;
//!
//! let config = Config::read()?;
//! assert_eq!(config.storage.connection.max_retries, 3);
//! config.save()?;
//! # anyhow::Ok(())
//! ```

use super::data_storage::DataStorage;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

/// Configuration file name within the data directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Environment variable overriding `logging.min_level`.
pub const LOG_LEVEL_ENV: &str = "TASKHIVE_LOG_LEVEL";

/// Connection pool and retry parameters.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Upper bound on concurrently open reader connections.
    pub max_connections: u32,
    /// Transparent retries for busy/locked errors before surfacing them.
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    pub retry_delay_ms: u64,
    /// SQLite busy handler timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Idle reader connections are closed after this many seconds.
    pub idle_timeout_s: u64,
    /// Waiting for a free slot gives up after this many seconds.
    pub acquire_timeout_s: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_retries: 3,
            retry_delay_ms: 1000,
            busy_timeout_ms: 5000,
            idle_timeout_s: 60,
            acquire_timeout_s: 30,
        }
    }
}

/// Storage engine performance tuning.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Database page size in bytes. Applied before the first write.
    pub page_size: u32,
    /// Page cache size in pages.
    pub cache_size: u32,
    /// Memory-mapped I/O window in bytes.
    pub mmap_size: u64,
    /// Soft heap ceiling for the storage layer in bytes.
    pub max_memory: u64,
    /// Interval between periodic WAL checkpoints in seconds.
    pub checkpoint_interval_s: u64,
    /// Interval between periodic vacuums in seconds.
    pub vacuum_interval_s: u64,
    /// Prepared statement cache capacity.
    pub statement_cache_size: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_size: 2000,
            mmap_size: 64 * 1024 * 1024,
            max_memory: 256 * 1024 * 1024,
            checkpoint_interval_s: 5 * 60,
            vacuum_interval_s: 60 * 60,
            statement_cache_size: 100,
        }
    }
}

/// Journal discipline applied at connection open.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct JournalConfig {
    /// Journal mode pragma. WAL is the only mode the durability contract
    /// is specified for.
    pub mode: String,
    /// `synchronous` pragma.
    pub synchronous: String,
    /// `temp_store` pragma.
    pub temp_store: String,
    /// `locking_mode` pragma.
    pub locking_mode: String,
    /// `auto_vacuum` pragma.
    pub auto_vacuum: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            temp_store: "FILE".to_string(),
            locking_mode: "NORMAL".to_string(),
            auto_vacuum: "NONE".to_string(),
        }
    }
}

/// Durable store configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Explicit base directory. When absent the platform data directory
    /// (or `TASKHIVE_DATA_DIR`) is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<String>,
    /// Database file name.
    pub name: String,
    pub connection: ConnectionConfig,
    pub performance: PerformanceConfig,
    pub journal: JournalConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            name: "taskhive.db".to_string(),
            connection: ConnectionConfig::default(),
            performance: PerformanceConfig::default(),
            journal: JournalConfig::default(),
        }
    }
}

/// Structured logging configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level: trace, debug, info, warn, error.
    pub min_level: String,
    /// Directory for log files. Defaults to the data directory when file
    /// logging is enabled without an explicit directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
    /// Write human-readable output to the console.
    pub console: bool,
    /// Write output to rotating files in `log_dir`.
    pub file: bool,
    /// Keep at most this many log files.
    pub max_files: usize,
    /// Rotate a file once it exceeds this many bytes.
    pub max_file_size: u64,
    /// Disable ANSI colors on the console sink.
    pub no_colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            min_level: "info".to_string(),
            log_dir: None,
            console: true,
            file: false,
            max_files: 7,
            max_file_size: 8 * 1024 * 1024,
            no_colors: false,
        }
    }
}

/// Result cache and pressure monitor configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache memory ceiling in bytes used for the cache-pressure ratio.
    pub max_memory: u64,
    /// Upper bound on cached entries.
    pub max_entries: usize,
    /// Pressure sampling interval in seconds.
    pub check_interval_s: u64,
    /// Combined pressure at or above this triggers a reduction cycle.
    pub pressure_threshold: f64,
    /// Log every hit/miss/invalidation at debug level.
    pub debug_mode: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory: 512 * 1024 * 1024,
            max_entries: 10_000,
            check_interval_s: 60,
            pressure_threshold: 0.8,
            debug_mode: false,
        }
    }
}

/// Request tracer retention configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TracerConfig {
    /// Retain at most this many traces; oldest are evicted first.
    pub max_traces: usize,
    /// Events recorded per trace before further ones are dropped.
    pub max_events_per_trace: usize,
    /// Traces older than this many seconds are dropped during cleanup.
    pub trace_retention_s: u64,
    /// Cleanup cadence in seconds.
    pub cleanup_interval_s: u64,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            max_traces: 1000,
            max_events_per_trace: 100,
            trace_retention_s: 60 * 60,
            cleanup_interval_s: 60 * 60,
        }
    }
}

/// Scheduled backup configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    /// Compact cron expression, minute and hour fields honored
    /// (e.g. `"0 */6 * * *"` for every six hours).
    pub schedule: String,
    /// Retain at most this many scheduled archives.
    pub max_backups: usize,
    /// Produce an export archive immediately after startup.
    pub backup_on_start: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 */6 * * *".to_string(),
            max_backups: 10,
            backup_on_start: false,
        }
    }
}

/// High-level service behavior.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Operations admitted concurrently; excess waits up to
    /// `storage.connection.acquire_timeout_s` and then fails with OVERLOAD.
    pub max_in_flight: usize,
    /// Default validation mode: "strict" or "lenient".
    pub validation_mode: String,
    /// Permit `add_rule`/`remove_rule` on the validation pipeline at runtime.
    pub allow_rule_mutation: bool,
    /// Default transaction timeout in milliseconds.
    pub txn_timeout_ms: u64,
    /// Atomic multi-index mutation. When off, non-primary index failures
    /// are logged as divergences and left to the repair pass.
    pub atomic_indexes: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            validation_mode: "strict".to_string(),
            allow_rule_mutation: false,
            txn_timeout_ms: 30_000,
            atomic_indexes: true,
        }
    }
}

/// Main configuration container for the entire core.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub cache: CacheConfig,
    pub tracer: TracerConfig,
    pub backup: BackupConfig,
    pub service: ServiceConfig,
}

impl Config {
    /// Loads configuration from the data directory, merging defaults for
    /// anything unspecified, then applies environment overrides.
    ///
    /// A missing file yields the default configuration; a malformed file is
    /// an error rather than a silent fallback.
    pub fn read() -> Result<Self> {
        dotenv::dotenv().ok();

        let path = DataStorage::new().get_path(CONFIG_FILE_NAME)?;
        let mut config: Config = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            Config::default()
        };

        if let Ok(level) = env::var(LOG_LEVEL_ENV) {
            config.logging.min_level = level;
        }

        Ok(config)
    }

    /// Persists the configuration as pretty-printed JSON in the data
    /// directory.
    pub fn save(&self) -> Result<()> {
        let path = DataStorage::new().get_path(CONFIG_FILE_NAME)?;
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.storage.connection.max_connections, 10);
        assert_eq!(config.storage.performance.checkpoint_interval_s, 300);
        assert_eq!(config.storage.journal.mode, "WAL");
        assert_eq!(config.cache.pressure_threshold, 0.8);
        assert_eq!(config.tracer.max_traces, 1000);
        assert_eq!(config.backup.schedule, "0 */6 * * *");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"cache": {"max_entries": 5}}"#).unwrap();
        assert_eq!(config.cache.max_entries, 5);
        assert_eq!(config.cache.check_interval_s, 60);
        assert_eq!(config.storage.name, "taskhive.db");
    }
}
