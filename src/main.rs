//! Main entry point for the taskhive coordination core.
//!
//! Handles initialization of the tracing system, configuration loading,
//! core context construction, background maintenance loops, and clean
//! shutdown with the documented exit codes.

use anyhow::Result;
use taskhive::libs::config::Config;
use taskhive::libs::error::CoreError;
use taskhive::libs::logger;
use taskhive::services::CoreContext;

/// Exit codes: 0 normal, 1 unhandled failure, 2 migration failed,
/// 3 corruption detected.
fn exit_code_for(err: &CoreError) -> i32 {
    match err {
        CoreError::StorageCorrupt { .. } => 3,
        CoreError::StorageIo { message, .. } if message.contains("migration") => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Environment and configuration are read once; later changes are
    // ignored until restart
    let config = match Config::read() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("taskhive: failed to read configuration: {err}");
            std::process::exit(1);
        }
    };

    logger::init(&config.logging)?;

    let core = match CoreContext::build(config) {
        Ok(core) => core,
        Err(err) => {
            tracing::error!(error = %err, "core startup failed");
            std::process::exit(exit_code_for(&err));
        }
    };

    // Fatal integrity problems are surfaced before serving anything
    if let Err(err) = core.db.verify_integrity() {
        tracing::error!(error = %err, "integrity check failed");
        std::process::exit(exit_code_for(&err));
    }

    let cancel = core.spawn_background();
    tracing::info!("taskhive core ready");

    // The RPC/tool-dispatch layer mounts on top of the services; the
    // binary itself only keeps the core and its background loops alive
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    cancel.cancel();

    // flush pending WAL frames so the next startup finds a clean store
    if let Err(err) = core.db.checkpoint() {
        tracing::warn!(error = %err, "final checkpoint failed");
    }

    Ok(())
}
