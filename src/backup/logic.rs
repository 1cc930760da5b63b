// tenangdb/src/backup/logic.rs
use chrono::{Datelike, Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::archive::ArchiveCodec;
use super::db_dump::{DumpExecutor, dump_dir_name, month_dir};
use super::frequency::{FrequencyTracker, GateDecision, check_gate, human_duration};
use super::transfer::TransferClient;
use crate::cleanup::{RetentionEngine, UploadRecord, is_cleanup_day};
use crate::config::BackupConfig;
use crate::errors::{AppError, Result};
use crate::metrics::MetricsStore;
use crate::utils::disk_usage;
use crate::utils::prompt::Confirmer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    /// Dry run: listed, never executed.
    Planned,
    Succeeded,
    Failed(String),
    Cancelled,
}

/// One database's trip through dump, pack and upload.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub database: String,
    pub dump_path: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
    pub remote_uri: Option<String>,
    pub attempts: u32,
    pub status: JobStatus,
    pub size_bytes: u64,
    pub duration: Duration,
    local_complete: bool,
}

impl BackupJob {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            dump_path: None,
            archive_path: None,
            remote_uri: None,
            attempts: 0,
            status: JobStatus::Pending,
            size_bytes: 0,
            duration: Duration::ZERO,
            local_complete: false,
        }
    }

    /// The file or directory that gets uploaded.
    pub fn artifact(&self) -> Option<&Path> {
        self.archive_path.as_deref().or(self.dump_path.as_deref())
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupSummary {
    pub jobs: Vec<BackupJob>,
    /// The frequency gate stopped the run before any job started.
    pub skipped: bool,
}

impl BackupSummary {
    fn skipped() -> Self {
        Self {
            jobs: Vec::new(),
            skipped: true,
        }
    }

    pub fn failed(&self) -> Vec<&BackupJob> {
        self.jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Failed(_) | JobStatus::Cancelled))
            .collect()
    }

    pub fn ensure_success(&self) -> anyhow::Result<()> {
        let failed = self.failed();
        if failed.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = failed.iter().map(|j| j.database.as_str()).collect();
        anyhow::bail!(
            "{} of {} database backups failed: {}",
            failed.len(),
            self.jobs.len(),
            names.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackupOptions {
    pub dry_run: bool,
    /// Ignore the frequency gate.
    pub force: bool,
}

/// Stages shared by every job of a run.
pub struct Pipeline {
    dumper: Arc<dyn DumpExecutor>,
    codec: Option<ArchiveCodec>,
    transfer: Option<Arc<TransferClient>>,
    metrics: Arc<MetricsStore>,
    upload_record: Arc<UploadRecord>,
    backup_root: PathBuf,
}

impl Pipeline {
    pub fn new(dumper: Arc<dyn DumpExecutor>, backup_root: PathBuf, metrics: Arc<MetricsStore>) -> Self {
        Self {
            dumper,
            codec: None,
            transfer: None,
            metrics,
            upload_record: Arc::new(UploadRecord::new()),
            backup_root,
        }
    }

    pub fn with_codec(mut self, codec: ArchiveCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_transfer(mut self, transfer: TransferClient) -> Self {
        self.transfer = Some(Arc::new(transfer));
        self
    }

    pub fn upload_record(&self) -> &Arc<UploadRecord> {
        &self.upload_record
    }

    /// One attempt: dump, then pack, then upload.
    async fn execute(&self, job: &mut BackupJob, cancel: &CancellationToken) -> Result<()> {
        let target = month_dir(&self.backup_root, &job.database, Local::now());
        let dump_path = self.dumper.dump(&job.database, &target, cancel).await?;
        job.dump_path = Some(dump_path.clone());

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!("backup of {}", job.database)));
        }

        let artifact = match &self.codec {
            Some(codec) => {
                let codec = codec.clone();
                let source = dump_path.clone();
                let report = tokio::task::spawn_blocking(move || codec.pack(&source))
                    .await
                    .map_err(|e| AppError::Compression(format!("pack task aborted: {}", e)))??;
                if !dump_path.exists() {
                    job.dump_path = None;
                }
                job.archive_path = Some(report.archive_path.clone());
                report.archive_path
            }
            None => dump_path,
        };
        job.size_bytes = disk_usage(&artifact);
        job.local_complete = true;

        let Some(transfer) = &self.transfer else {
            return Ok(());
        };
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!("upload of {}", job.database)));
        }

        let started = Instant::now();
        match transfer.upload(&artifact, cancel).await {
            Ok(remote) => {
                record_metric(self.metrics.update_upload_metrics(&job.database, true, job.size_bytes, started.elapsed()));
                self.upload_record.record(&artifact, Utc::now());
                job.remote_uri = Some(remote);
                Ok(())
            }
            Err(e) => {
                if !e.is_cancelled() {
                    record_metric(self.metrics.update_upload_metrics(&job.database, false, job.size_bytes, started.elapsed()));
                }
                Err(e)
            }
        }
    }

    /// Drops what a failed attempt left on disk. With `keep_complete`, a
    /// finished local backup survives (only its upload failed).
    fn discard_artifacts(&self, job: &mut BackupJob, keep_complete: bool) {
        if keep_complete && job.local_complete {
            if let Some(artifact) = job.artifact() {
                warn!(database = %job.database, path = %artifact.display(), "keeping local backup that failed to upload");
            }
            return;
        }

        for path in [job.archive_path.take(), job.dump_path.take()].into_iter().flatten() {
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else if path.exists() {
                std::fs::remove_file(&path)
            } else {
                Ok(())
            };
            if let Err(e) = removed {
                warn!(database = %job.database, path = %path.display(), error = %e, "failed to remove partial backup");
            }
        }
        job.local_complete = false;
        job.size_bytes = 0;
    }
}

fn record_metric(result: Result<()>) {
    if let Err(e) = result {
        error!(error = %e, "failed to update metrics");
    }
}

/// Runs the pipeline for every selected database, retrying each as a unit.
async fn run_job(
    pipeline: Arc<Pipeline>,
    database: String,
    retry_count: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
) -> BackupJob {
    let started = Instant::now();
    let mut job = BackupJob::new(&database);

    for attempt in 1..=retry_count {
        if cancel.is_cancelled() {
            job.status = JobStatus::Cancelled;
            break;
        }
        job.attempts = attempt;
        info!(database = %database, attempt, max_attempts = retry_count, "starting backup");

        match pipeline.execute(&mut job, &cancel).await {
            Ok(()) => {
                job.status = JobStatus::Succeeded;
                break;
            }
            Err(e) if e.is_cancelled() => {
                pipeline.discard_artifacts(&mut job, false);
                job.status = JobStatus::Cancelled;
                break;
            }
            Err(e) => {
                warn!(database = %database, attempt, error = %e, "backup attempt failed");
                job.status = JobStatus::Failed(e.to_string());
                let last = attempt == retry_count;
                pipeline.discard_artifacts(&mut job, last);
                if last {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        job.status = JobStatus::Cancelled;
                        break;
                    }
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
    }

    job.duration = started.elapsed();
    match &job.status {
        JobStatus::Succeeded => info!(
            database = %database,
            attempts = job.attempts,
            size_bytes = job.size_bytes,
            duration_secs = job.duration.as_secs(),
            "backup complete"
        ),
        JobStatus::Failed(reason) => error!(database = %database, attempts = job.attempts, reason = %reason, "backup failed"),
        _ => warn!(database = %database, "backup cancelled"),
    }
    record_metric(pipeline.metrics.update_backup_metrics(
        &database,
        job.succeeded(),
        job.size_bytes,
        job.duration,
    ));
    job
}

/// Drives a whole backup run.
pub struct Orchestrator {
    config: BackupConfig,
    pipeline: Arc<Pipeline>,
    tracker: FrequencyTracker,
    confirmer: Arc<dyn Confirmer>,
    retention: Option<RetentionEngine>,
}

impl Orchestrator {
    pub fn new(config: BackupConfig, pipeline: Pipeline, confirmer: Arc<dyn Confirmer>) -> Self {
        let tracker = FrequencyTracker::for_backup_dir(&config.directory, &config.state_dir);
        Self {
            config,
            pipeline: Arc::new(pipeline),
            tracker,
            confirmer,
            retention: None,
        }
    }

    /// Upload-tracked cleanup after each run.
    pub fn with_retention(mut self, engine: RetentionEngine) -> Self {
        self.retention = Some(engine);
        self
    }

    pub fn tracker(&self) -> &FrequencyTracker {
        &self.tracker
    }

    /// `false` when the run should be skipped.
    fn pass_gate(&self, options: BackupOptions) -> bool {
        if options.force || !self.config.check_last_backup_time {
            return true;
        }
        let last_run = match self.tracker.last_run() {
            Ok(last_run) => last_run,
            Err(e) => {
                warn!(path = %self.tracker.path().display(), error = %e, "unreadable backup tracker, ignoring");
                None
            }
        };

        let GateDecision::TooSoon { last_run, elapsed, remaining } =
            check_gate(last_run, Utc::now(), self.config.min_backup_interval)
        else {
            return true;
        };

        let automated = self.config.skip_confirmation || !self.confirmer.is_interactive();
        if automated {
            info!(
                last_run = %last_run,
                elapsed = %human_duration(elapsed),
                next_allowed_in = %human_duration(remaining),
                "last backup is too recent, skipping run"
            );
            return false;
        }

        let question = format!(
            "Last backup finished {} ago (minimum interval {}). Run another backup now?",
            human_duration(elapsed),
            human_duration(self.config.min_backup_interval)
        );
        if self.confirmer.confirm(&question) {
            true
        } else {
            info!("backup skipped by user");
            false
        }
    }

    fn plan(&self) -> BackupSummary {
        let now = Local::now();
        let jobs = self
            .config
            .databases
            .iter()
            .map(|database| {
                let mut job = BackupJob::new(database);
                let dump_path = month_dir(&self.config.directory, database, now).join(dump_dir_name(database, now));
                if let Some(codec) = &self.pipeline.codec {
                    job.archive_path = codec.archive_path_for(&dump_path).ok();
                }
                job.remote_uri = self
                    .pipeline
                    .transfer
                    .as_ref()
                    .map(|t| t.remote_uri_for(job.archive_path.as_deref().unwrap_or(&dump_path)));
                info!(
                    database = %database,
                    dump_path = %dump_path.display(),
                    archive = ?job.archive_path,
                    remote = ?job.remote_uri,
                    "dry run: planned backup"
                );
                job.dump_path = Some(dump_path);
                job.status = JobStatus::Planned;
                job
            })
            .collect();
        BackupSummary { jobs, skipped: false }
    }

    async fn run_batch(&self, batch: &[String], cancel: &CancellationToken) -> Vec<BackupJob> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for (index, database) in batch.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let pipeline = Arc::clone(&self.pipeline);
            let database = database.clone();
            let cancel = cancel.clone();
            let (retry_count, retry_delay) = (self.config.retry_count, self.config.retry_delay);

            join_set.spawn(async move {
                let job = match semaphore.acquire_owned().await {
                    Ok(_permit) => run_job(pipeline, database, retry_count, retry_delay, cancel).await,
                    Err(_) => {
                        let mut job = BackupJob::new(&database);
                        job.status = JobStatus::Cancelled;
                        job
                    }
                };
                (index, job)
            });
        }

        let mut finished: Vec<Option<BackupJob>> = vec![None; batch.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, job)) => finished[index] = Some(job),
                Err(e) => error!(error = %e, "backup task panicked"),
            }
        }

        finished
            .into_iter()
            .zip(batch)
            .map(|(job, database)| {
                job.unwrap_or_else(|| {
                    let mut job = BackupJob::new(database);
                    job.status = JobStatus::Failed("backup task aborted".to_string());
                    job
                })
            })
            .collect()
    }

    pub async fn run(&self, options: BackupOptions, cancel: &CancellationToken) -> Result<BackupSummary> {
        let databases = &self.config.databases;
        if databases.is_empty() {
            return Err(AppError::Config("No databases selected for backup".to_string()));
        }
        if !self.pass_gate(options) {
            return Ok(BackupSummary::skipped());
        }
        if options.dry_run {
            return Ok(self.plan());
        }

        let total = databases.len() as u64;
        let metrics = &self.pipeline.metrics;
        record_metric(metrics.update(|doc| {
            doc.system.run_active = true;
            doc.system.total_databases = total;
        }));
        info!(
            databases = total,
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "starting backup run"
        );

        let mut summary = BackupSummary::default();
        for (batch_no, batch) in databases.chunks(self.config.batch_size.max(1)).enumerate() {
            if cancel.is_cancelled() {
                summary.jobs.extend(batch.iter().map(|db| {
                    let mut job = BackupJob::new(db);
                    job.status = JobStatus::Cancelled;
                    job
                }));
                continue;
            }
            info!(batch = batch_no + 1, size = batch.len(), "running batch");
            summary.jobs.extend(self.run_batch(batch, cancel).await);
        }

        let healthy = summary.failed().is_empty();
        record_metric(metrics.update_system_metrics(total, false, healthy));

        if healthy {
            if let Err(e) = self.tracker.record_run(Utc::now()) {
                warn!(path = %self.tracker.path().display(), error = %e, "failed to record backup time");
            }
        }

        if let Some(engine) = &self.retention {
            self.cleanup_uploaded(engine, cancel).await;
        }

        info!(
            succeeded = summary.jobs.iter().filter(|j| j.succeeded()).count(),
            failed = summary.failed().len(),
            "backup run finished"
        );
        Ok(summary)
    }

    async fn cleanup_uploaded(&self, engine: &RetentionEngine, cancel: &CancellationToken) {
        let policy = engine.policy();
        if !policy.cleanup_uploaded_files || self.pipeline.upload_record.is_empty() {
            return;
        }
        if !is_cleanup_day(Local::now().weekday(), policy.weekend_only, false) {
            info!("upload-tracked cleanup runs on weekends only");
            return;
        }

        let started = Instant::now();
        let transfer = self.pipeline.transfer.as_deref();
        match engine
            .cleanup_uploaded(&self.pipeline.upload_record, transfer, Utc::now(), cancel)
            .await
        {
            Ok(outcome) => {
                info!(files_removed = outcome.files_removed, bytes_freed = outcome.bytes_freed, "upload-tracked cleanup finished");
                record_metric(self.pipeline.metrics.update_cleanup_metrics(
                    true,
                    outcome.files_removed,
                    outcome.bytes_freed,
                    started.elapsed(),
                ));
            }
            Err(e) => {
                error!(error = %e, "upload-tracked cleanup failed");
                record_metric(self.pipeline.metrics.update_cleanup_metrics(false, 0, 0, started.elapsed()));
            }
        }
    }
}
