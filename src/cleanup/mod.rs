pub mod logic;
pub mod upload_record;

pub use logic::{CleanupOutcome, RetentionEngine, is_cleanup_day};
pub use upload_record::UploadRecord;

use anyhow::{Context, Result};
use chrono::{Datelike, Local};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::transfer::{RcloneExecutor, TransferClient};
use crate::config::AppConfig;
use crate::metrics::MetricsStore;
use crate::utils::prompt::Confirmer;

/// Which local artifacts may be removed. Fixed for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub cleanup_uploaded_files: bool,
    pub max_age_days: u32,
    pub weekend_only: bool,
    pub verify_cloud_exists: bool,
    pub databases: Vec<String>,
}

/// Flags of the `cleanup` command.
#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub dry_run: bool,
    pub force: bool,
}

/// Entry point for the `cleanup` command: age-based local retention, then
/// the remote retention pass when an upload destination is configured.
pub async fn run_cleanup_flow(
    app_config: &AppConfig,
    options: CleanupOptions,
    confirmer: &dyn Confirmer,
    metrics: Arc<MetricsStore>,
    cancel: CancellationToken,
) -> Result<CleanupOutcome> {
    let cleanup = &app_config.cleanup;
    if !cleanup.enabled && !options.force {
        info!("cleanup disabled in configuration; use --force to run anyway");
        return Ok(CleanupOutcome::default());
    }
    if !is_cleanup_day(Local::now().weekday(), cleanup.policy.weekend_only, options.force) {
        info!("cleanup runs on weekends only; use --force to run today");
        return Ok(CleanupOutcome::default());
    }

    let backup_dir = app_config.backup.directory.clone();
    if !options.dry_run {
        let question = format!(
            "Delete backups older than {} days under {}?",
            cleanup.policy.max_age_days,
            backup_dir.display()
        );
        if !confirmer.confirm(&question) {
            warn!("cleanup cancelled by user");
            return Ok(CleanupOutcome::default());
        }
    }

    let engine = RetentionEngine::new(backup_dir, cleanup.policy.clone(), options.dry_run);
    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || engine.cleanup_aged(SystemTime::now()))
        .await
        .context("cleanup task aborted")?;

    if !options.dry_run {
        let (success, outcome) = match &result {
            Ok(outcome) => (true, outcome.clone()),
            Err(_) => (false, CleanupOutcome::default()),
        };
        if let Err(e) = metrics.update_cleanup_metrics(success, outcome.files_removed, outcome.bytes_freed, started.elapsed()) {
            error!(error = %e, "failed to record cleanup metrics");
        }
    }
    let outcome = result.context("Local cleanup failed")?;
    info!(
        files_removed = outcome.files_removed,
        bytes_freed = outcome.bytes_freed,
        dry_run = options.dry_run,
        "local cleanup finished"
    );

    if let Some(upload) = &app_config.upload {
        let executor = RcloneExecutor::from_config(upload)?;
        let transfer = TransferClient::new(Arc::new(executor), upload);
        let pruned = transfer
            .prune_remote(options.dry_run, &cancel)
            .await
            .context("Remote cleanup failed")?;
        info!(outcome = ?pruned, "remote retention pass finished");
    }

    Ok(outcome)
}
