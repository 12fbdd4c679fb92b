//! Operational helpers: logging setup, startup preflight, run summaries.

use std::path::{Path, PathBuf};

use birdwatch_types::{
    config::{OpsConfig, StorageConfig},
    telemetry::CycleStats,
    BirdwatchError, Result,
};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_tracing(config: &OpsConfig) -> Result<()> {
    let filter = EnvFilter::try_new(config.effective_log_level())
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| BirdwatchError::Ops(format!("failed to create log filter: {err}")))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| BirdwatchError::Ops(format!("tracing init error: {err}")))?;
    Ok(())
}

/// Creates an archive root up front. Failure here is a configuration error:
/// a root that cannot be created will not start working on its own.
pub fn ensure_archive_root(path: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = path.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir).map_err(|err| {
        BirdwatchError::Configuration(format!("cannot create archive root {:?}: {err}", dir))
    })?;
    if !dir.is_dir() {
        return Err(BirdwatchError::Configuration(format!(
            "archive root {:?} is not a directory",
            dir
        )));
    }
    info!("Archive root ready at {:?}", dir);
    Ok(dir)
}

/// Every root the configuration will write to.
pub fn prepare_archive_roots(config: &StorageConfig) -> Result<Vec<PathBuf>> {
    let mut roots = vec![ensure_archive_root(&config.root)?];
    if config.store_annotated && config.annotated_root != config.root {
        roots.push(ensure_archive_root(&config.annotated_root)?);
    }
    Ok(roots)
}

pub fn log_run_summary(stats: &CycleStats) {
    info!(
        cycles = stats.cycles,
        capture_failures = stats.capture_failures,
        blurred = stats.blurred,
        subject_cycles = stats.subject_cycles,
        stored = stats.stored_captures,
        storage_failures = stats.storage_failures,
        "Run finished"
    );
}
