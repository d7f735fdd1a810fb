//! Structured logger initialization and health probing.
//!
//! Wraps `tracing` / `tracing-subscriber` setup behind the [`LoggingConfig`]
//! contract: a level-filtered subscriber with console and/or file sinks,
//! a health probe, and a safe fallback to stderr when the preferred sink
//! cannot be installed. All core modules log through `tracing` macros with
//! child contexts (`target`/span fields); this module only owns the sink.

use crate::libs::config::LoggingConfig;
use crate::libs::data_storage::DataStorage;
use anyhow::Result;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// File name prefix for rotating log files.
const LOG_FILE_PREFIX: &str = "taskhive";

static INSTALLED: AtomicBool = AtomicBool::new(false);
static FELL_BACK: AtomicBool = AtomicBool::new(false);

/// Snapshot of the logging subsystem state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerHealth {
    /// A global subscriber was installed by [`init`].
    pub installed: bool,
    /// The configured sink failed and stderr is used instead.
    pub fell_back_to_stderr: bool,
}

/// Initializes the global tracing subscriber from the logging config.
///
/// Level filtering honors `RUST_LOG` when present, falling back to the
/// configured `min_level`. When file logging is requested the log directory
/// is created and old files beyond `max_files` are pruned. Installation
/// failures (e.g. a subscriber already set by the embedding process) are
/// not fatal: the core falls back to stderr and records the fact for the
/// health probe.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("taskhive={}", config.min_level)));

    let installed = if config.file {
        match open_log_file(config) {
            Ok(file) => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .try_init()
                .is_ok(),
            Err(err) => {
                eprintln!("taskhive: log file unavailable ({err}), falling back to stderr");
                FELL_BACK.store(true, Ordering::Relaxed);
                tracing_subscriber::fmt()
                    .with_env_filter(EnvFilter::new(format!("taskhive={}", config.min_level)))
                    .with_writer(std::io::stderr)
                    .try_init()
                    .is_ok()
            }
        }
    } else if config.console {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(!config.no_colors)
            .try_init()
            .is_ok()
    } else {
        // No sink requested; install a quiet stderr subscriber so that
        // warnings and errors still surface somewhere.
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("taskhive=warn"))
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok()
    };

    INSTALLED.store(installed, Ordering::Relaxed);
    if !installed {
        FELL_BACK.store(true, Ordering::Relaxed);
    }

    Ok(())
}

/// Reports whether the subscriber was installed and which sink is active.
pub fn health() -> LoggerHealth {
    LoggerHealth {
        installed: INSTALLED.load(Ordering::Relaxed),
        fell_back_to_stderr: FELL_BACK.load(Ordering::Relaxed),
    }
}

/// Opens today's log file in the configured directory, pruning files
/// beyond `max_files` (oldest first by name, which sorts by date).
fn open_log_file(config: &LoggingConfig) -> Result<File> {
    let dir: PathBuf = match &config.log_dir {
        Some(dir) => PathBuf::from(dir),
        None => DataStorage::new().get_dir("logs")?,
    };
    fs::create_dir_all(&dir)?;

    prune_old_files(&dir, config.max_files)?;

    let name = format!("{}-{}.log", LOG_FILE_PREFIX, chrono::Local::now().format("%Y-%m-%d"));
    let file = OpenOptions::new().create(true).append(true).open(dir.join(name))?;
    Ok(file)
}

fn prune_old_files(dir: &std::path::Path, max_files: usize) -> Result<()> {
    let mut logs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().map(|ext| ext == "log").unwrap_or(false)
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(LOG_FILE_PREFIX))
                    .unwrap_or(false)
        })
        .collect();

    if logs.len() >= max_files && max_files > 0 {
        logs.sort();
        for stale in logs.iter().take(logs.len() + 1 - max_files) {
            let _ = fs::remove_file(stale);
        }
    }

    Ok(())
}
