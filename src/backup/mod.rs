pub mod archive;
pub mod db_dump;
pub mod frequency;
pub mod logic;
pub mod transfer;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cleanup::RetentionEngine;
use crate::config::AppConfig;
use crate::metrics::MetricsStore;
use crate::utils::prompt::Confirmer;
use archive::ArchiveCodec;
use logic::{BackupOptions, BackupSummary, Orchestrator, Pipeline};
use transfer::{RcloneExecutor, TransferClient};

/// Wires the configured executors into an orchestrator.
pub fn build_orchestrator(
    app_config: &AppConfig,
    confirmer: Arc<dyn Confirmer>,
    metrics: Arc<MetricsStore>,
) -> Result<Orchestrator> {
    let backup = &app_config.backup;
    let dumper = db_dump::dump_executor_from_config(app_config)?;

    let mut pipeline = Pipeline::new(dumper, backup.directory.clone(), metrics);
    if backup.compress {
        let codec = ArchiveCodec::new(backup.archive_format, backup.compression_level, backup.keep_original)
            .context("Invalid archive settings")?;
        pipeline = pipeline.with_codec(codec);
    }
    if let Some(upload) = &app_config.upload {
        let executor = RcloneExecutor::from_config(upload)?;
        pipeline = pipeline.with_transfer(TransferClient::new(Arc::new(executor), upload));
    }

    let mut orchestrator = Orchestrator::new(backup.clone(), pipeline, confirmer);
    if app_config.cleanup.enabled {
        orchestrator = orchestrator.with_retention(RetentionEngine::new(
            backup.directory.clone(),
            app_config.cleanup.policy.clone(),
            false,
        ));
    }
    Ok(orchestrator)
}

/// Entry point for the `backup` command.
pub async fn run_backup_flow(
    app_config: &AppConfig,
    options: BackupOptions,
    confirmer: Arc<dyn Confirmer>,
    metrics: Arc<MetricsStore>,
    cancel: CancellationToken,
) -> Result<BackupSummary> {
    if !options.dry_run {
        std::fs::create_dir_all(&app_config.backup.directory).with_context(|| {
            format!(
                "Failed to create backup directory {}",
                app_config.backup.directory.display()
            )
        })?;
    }

    let orchestrator = build_orchestrator(app_config, confirmer, metrics)?;
    let summary = orchestrator.run(options, &cancel).await?;
    if summary.skipped {
        return Ok(summary);
    }

    summary.ensure_success()?;
    if !options.dry_run {
        info!(databases = summary.jobs.len(), "all backups completed successfully");
    }
    Ok(summary)
}
