// tenangdb/src/backup/transfer.rs
use async_trait::async_trait;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::UploadConfig;
use crate::errors::{AppError, Result};
use crate::utils::find_executable;
use crate::utils::process::run_command;

pub const UPLOAD_ATTEMPTS: u32 = 3;
pub const UPLOAD_RETRY_DELAY: Duration = Duration::from_secs(10);

static MONTH_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{4}-[0-9]{2}$").expect("month pattern is valid"));

/// Whether a path segment names a month directory (`YYYY-MM`).
pub fn is_month_segment(segment: &str) -> bool {
    MONTH_SEGMENT.is_match(segment)
}

/// Copies and deletes objects on remote storage.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// Copies a file (or a directory tree) into `remote_uri`, verifying checksums.
    async fn copy(&self, local_path: &Path, remote_uri: &str, cancel: &CancellationToken) -> Result<()>;

    /// Deletes objects under `remote_uri` older than `min_age_days`.
    async fn delete(
        &self,
        remote_uri: &str,
        min_age_days: u32,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Whether a single remote object exists.
    async fn exists(&self, remote_object: &str, cancel: &CancellationToken) -> Result<bool>;
}

/// Splits `<root>/<database>/<YYYY-MM>/<file>` into its database and month.
///
/// Without a month segment the database is the filename text before the first dash.
pub fn database_and_month(local_path: &Path) -> (Option<String>, Option<String>) {
    let segments: Vec<&str> = local_path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();

    if let Some(idx) = segments.iter().position(|s| is_month_segment(s)) {
        let database = idx
            .checked_sub(1)
            .and_then(|i| segments.get(i))
            .map(|s| s.to_string());
        return (database, Some(segments[idx].to_string()));
    }

    let database = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('-').next())
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    (database, None)
}

/// `<destination>/<database>[/<YYYY-MM>]`
pub fn remote_destination(destination: &str, local_path: &Path) -> String {
    let mut uri = destination.trim_end_matches('/').to_string();
    let (database, month) = database_and_month(local_path);
    if let Some(database) = database {
        uri.push('/');
        uri.push_str(&database);
        if let Some(month) = month {
            uri.push('/');
            uri.push_str(&month);
        }
    }
    uri
}

/// What a remote prune actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePrune {
    Disabled,
    Previewed,
    Deleted,
}

/// Uploads artifacts to templated remote paths and prunes old remote objects.
pub struct TransferClient {
    executor: Arc<dyn TransferExecutor>,
    destination: String,
    upload_timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
    retention_days: u32,
    remote_cleanup_enabled: bool,
}

impl TransferClient {
    pub fn new(executor: Arc<dyn TransferExecutor>, config: &UploadConfig) -> Self {
        Self {
            executor,
            destination: config.destination.clone(),
            upload_timeout: config.timeout,
            attempts: UPLOAD_ATTEMPTS,
            retry_delay: UPLOAD_RETRY_DELAY,
            retention_days: config.retention_days,
            remote_cleanup_enabled: config.remote_cleanup_enabled,
        }
    }

    pub fn with_retry(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn remote_uri_for(&self, local_path: &Path) -> String {
        remote_destination(&self.destination, local_path)
    }

    /// Uploads `local_path`, retrying a fixed number of times. Returns the remote URI.
    pub async fn upload(&self, local_path: &Path, cancel: &CancellationToken) -> Result<String> {
        let remote = self.remote_uri_for(local_path);
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled(format!("upload of {}", local_path.display())));
            }
            info!(local = %local_path.display(), remote = %remote, attempt, "uploading");

            match tokio::time::timeout(self.upload_timeout, self.executor.copy(local_path, &remote, cancel)).await {
                Ok(Ok(())) => {
                    info!(local = %local_path.display(), remote = %remote, attempt, "upload complete");
                    return Ok(remote);
                }
                Ok(Err(e)) if e.is_cancelled() => return Err(e),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("attempt timed out after {}s", self.upload_timeout.as_secs())
                }
            }
            warn!(local = %local_path.display(), attempt, error = %last_error, "upload attempt failed");

            if attempt < self.attempts {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(AppError::Cancelled(format!("upload of {}", local_path.display())));
                    }
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        Err(AppError::Upload(format!(
            "{} -> {} failed after {} attempts: {}",
            local_path.display(),
            remote,
            self.attempts,
            last_error
        )))
    }

    /// Whether the uploaded copy of `local_path` is present remotely.
    pub async fn verify_uploaded(&self, local_path: &Path, cancel: &CancellationToken) -> Result<bool> {
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AppError::Upload(format!("Invalid artifact name: {}", local_path.display())))?;
        let object = format!("{}/{}", self.remote_uri_for(local_path), name);
        self.executor.exists(&object, cancel).await
    }

    /// Deletes remote objects older than the retention age.
    ///
    /// Without `remote_cleanup_enabled`, or when `dry_run` is set, this only
    /// previews what would be removed.
    pub async fn prune_remote(&self, dry_run: bool, cancel: &CancellationToken) -> Result<RemotePrune> {
        if self.retention_days == 0 {
            return Ok(RemotePrune::Disabled);
        }
        let preview = dry_run || !self.remote_cleanup_enabled;
        if preview {
            info!(
                destination = %self.destination,
                retention_days = self.retention_days,
                "previewing remote retention; set upload.remote_cleanup_enabled to delete"
            );
        } else {
            warn!(
                destination = %self.destination,
                retention_days = self.retention_days,
                "deleting remote backups past retention"
            );
        }

        self.executor
            .delete(&self.destination, self.retention_days, preview, cancel)
            .await?;
        Ok(if preview { RemotePrune::Previewed } else { RemotePrune::Deleted })
    }
}

/// `rclone` backed transfers.
pub struct RcloneExecutor {
    binary: PathBuf,
    config_path: Option<PathBuf>,
    timeout: Duration,
}

impl RcloneExecutor {
    pub fn new(binary: PathBuf, config_path: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary,
            config_path,
            timeout,
        }
    }

    pub fn from_config(config: &UploadConfig) -> anyhow::Result<Self> {
        let binary = find_executable("rclone", config.rclone_path.as_deref())?;
        Ok(Self::new(binary, config.rclone_config_path.clone(), config.timeout))
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        cmd
    }

    fn copy_command(&self, local_path: &Path, remote_uri: &str) -> Command {
        // rclone copies a directory's contents, so keep its name on the remote side.
        let target = match local_path.file_name().and_then(|n| n.to_str()) {
            Some(name) if local_path.is_dir() => format!("{}/{}", remote_uri, name),
            _ => remote_uri.to_string(),
        };
        let mut cmd = self.base_command();
        cmd.arg("copy")
            .arg(local_path)
            .arg(target)
            .arg("--checksum")
            .arg("--retries")
            .arg("1");
        cmd
    }

    fn delete_command(&self, remote_uri: &str, min_age_days: u32, dry_run: bool) -> Command {
        let mut cmd = self.base_command();
        cmd.arg("delete")
            .arg(remote_uri)
            .arg("--min-age")
            .arg(format!("{}d", min_age_days));
        if dry_run {
            cmd.arg("--dry-run");
        }
        cmd
    }
}

#[async_trait]
impl TransferExecutor for RcloneExecutor {
    async fn copy(&self, local_path: &Path, remote_uri: &str, cancel: &CancellationToken) -> Result<()> {
        let cmd = self.copy_command(local_path, remote_uri);
        run_command(cmd, "rclone copy", self.timeout, cancel).await?;
        Ok(())
    }

    async fn delete(
        &self,
        remote_uri: &str,
        min_age_days: u32,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cmd = self.delete_command(remote_uri, min_age_days, dry_run);
        let output = run_command(cmd, "rclone delete", self.timeout, cancel).await?;
        let report = String::from_utf8_lossy(&output.stderr);
        if !report.trim().is_empty() {
            info!(report = %report.trim(), "rclone delete output");
        }
        Ok(())
    }

    async fn exists(&self, remote_object: &str, cancel: &CancellationToken) -> Result<bool> {
        let mut cmd = self.base_command();
        cmd.arg("lsf").arg(remote_object);
        match run_command(cmd, "rclone lsf", self.timeout, cancel).await {
            Ok(output) => Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty()),
            Err(AppError::Command { stderr, .. }) => {
                warn!(remote = remote_object, error = %stderr, "remote object not confirmed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
