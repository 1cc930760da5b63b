// tenangdb/src/restore/logic.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::db_restore::{DumpLayout, RestoreExecutor, detect_layout};
use crate::backup::archive::{ArchiveCodec, ArchiveFormat, unpacked_dir_for};
use crate::errors::{AppError, Result};
use crate::metrics::MetricsStore;
use crate::utils::disk_usage;
use crate::utils::prompt::Confirmer;

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub backup_path: PathBuf,
    pub target_database: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { layout: DumpLayout, size_bytes: u64 },
    Declined,
}

/// Directory unpacked from an archive for one restore; removed on drop.
struct Extracted {
    dir: Option<PathBuf>,
}

impl Drop for Extracted {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => info!(path = %dir.display(), "removed extracted backup"),
                Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove extracted backup"),
            }
        }
    }
}

async fn prepare_source(backup_path: &Path) -> Result<(PathBuf, Extracted)> {
    let Some(format) = ArchiveFormat::from_path(backup_path) else {
        return Ok((backup_path.to_path_buf(), Extracted { dir: None }));
    };
    if !backup_path.is_file() {
        return Err(AppError::Restore(format!("Archive not found: {}", backup_path.display())));
    }

    let existing = unpacked_dir_for(backup_path)?;
    if existing.is_dir() {
        info!(path = %existing.display(), "archive already extracted, using existing directory");
        return Ok((existing, Extracted { dir: None }));
    }

    let codec = ArchiveCodec::new(format, 6, true)?;
    let archive = backup_path.to_path_buf();
    info!(archive = %archive.display(), "extracting backup archive");
    let dir = tokio::task::spawn_blocking(move || codec.unpack(&archive))
        .await
        .map_err(|e| AppError::Restore(format!("extract task aborted: {}", e)))??;
    Ok((dir.clone(), Extracted { dir: Some(dir) }))
}

/// Confirms, unpacks when needed, picks a tool for the dump layout and runs it.
pub async fn perform_restore<F>(
    request: &RestoreRequest,
    select_executor: F,
    confirmer: &dyn Confirmer,
    metrics: Arc<MetricsStore>,
    cancel: &CancellationToken,
) -> anyhow::Result<RestoreOutcome>
where
    F: Fn(&DumpLayout) -> anyhow::Result<Arc<dyn RestoreExecutor>>,
{
    let target = &request.target_database;
    if !request.backup_path.exists() {
        anyhow::bail!("Backup path does not exist: {}", request.backup_path.display());
    }

    let question = format!(
        "Restore {} into database '{}'? Existing tables will be overwritten.",
        request.backup_path.display(),
        target
    );
    if !confirmer.confirm(&question) {
        warn!(target = %target, "restore cancelled by user");
        return Ok(RestoreOutcome::Declined);
    }

    let started = Instant::now();
    let result = async {
        let (source, _extracted) = prepare_source(&request.backup_path).await?;
        let layout = detect_layout(&source)?;
        let dump_path = match &layout {
            DumpLayout::Mydumper(dir) => dir.clone(),
            DumpLayout::SqlFile(file) => file.clone(),
        };
        let size_bytes = disk_usage(&dump_path);
        let executor = select_executor(&layout)?;
        executor.restore(&dump_path, target, cancel).await?;
        anyhow::Ok(RestoreOutcome::Restored { layout, size_bytes })
    }
    .await;

    let (success, size) = match &result {
        Ok(RestoreOutcome::Restored { size_bytes, .. }) => (true, *size_bytes),
        _ => (false, 0),
    };
    let cancelled = matches!(&result, Err(e) if e.downcast_ref::<AppError>().is_some_and(AppError::is_cancelled));
    if !cancelled {
        if let Err(e) = metrics.update_restore_metrics(target, success, size, started.elapsed()) {
            error!(error = %e, "failed to record restore metrics");
        }
    }

    match &result {
        Ok(_) => info!(target = %target, duration_secs = started.elapsed().as_secs(), "restore complete"),
        Err(e) => error!(target = %target, error = %e, "restore failed"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::prompt::AutoConfirm;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingRestore {
        calls: Mutex<Vec<(PathBuf, String, bool)>>,
    }

    #[async_trait]
    impl RestoreExecutor for RecordingRestore {
        async fn restore(&self, source: &Path, target: &str, _cancel: &CancellationToken) -> Result<()> {
            // Record whether the extracted source existed while restoring.
            self.calls
                .lock()
                .unwrap()
                .push((source.to_path_buf(), target.to_string(), source.exists()));
            Ok(())
        }
    }

    fn mydumper_archive(root: &Path) -> PathBuf {
        let dump = root.join("shopdb").join("2024-03").join("shopdb-2024-03-01_02-00-00");
        fs::create_dir_all(&dump).unwrap();
        fs::write(dump.join("metadata"), b"Started dump at: 2024-03-01").unwrap();
        fs::write(dump.join("shopdb.orders.00000.sql"), b"INSERT INTO orders VALUES (1);").unwrap();
        ArchiveCodec::new(ArchiveFormat::TarGz, 1, false)
            .unwrap()
            .pack(&dump)
            .unwrap()
            .archive_path
    }

    #[tokio::test]
    async fn test_restore_from_archive_uses_directory_tool_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let archive = mydumper_archive(dir.path());
        let fake = Arc::new(RecordingRestore::default());
        let metrics = Arc::new(MetricsStore::new(dir.path().join("metrics.json")));
        let request = RestoreRequest {
            backup_path: archive.clone(),
            target_database: "shopdb_copy".to_string(),
        };

        let selected = fake.clone();
        let outcome = perform_restore(
            &request,
            move |layout| {
                assert!(matches!(layout, DumpLayout::Mydumper(_)));
                Ok(selected.clone() as Arc<dyn RestoreExecutor>)
            },
            &AutoConfirm(true),
            metrics.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, RestoreOutcome::Restored { .. }));
        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "shopdb_copy");
        assert!(calls[0].2);
        assert!(!calls[0].0.exists());
        assert!(archive.exists());
        assert_eq!(metrics.load().unwrap().restores["shopdb_copy"].success_count, 1);
    }

    #[tokio::test]
    async fn test_declined_restore_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let sql = dir.path().join("shopdb.sql");
        fs::write(&sql, b"SELECT 1;").unwrap();
        let fake = Arc::new(RecordingRestore::default());
        let request = RestoreRequest {
            backup_path: sql,
            target_database: "shopdb".to_string(),
        };

        let selected = fake.clone();
        let outcome = perform_restore(
            &request,
            move |_| Ok(selected.clone() as Arc<dyn RestoreExecutor>),
            &AutoConfirm(false),
            Arc::new(MetricsStore::disabled()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RestoreOutcome::Declined);
        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_backup_path_fails() {
        let request = RestoreRequest {
            backup_path: PathBuf::from("/definitely/not/here.tar.gz"),
            target_database: "shopdb".to_string(),
        };
        let err = perform_restore(
            &request,
            |_| anyhow::bail!("no tool needed"),
            &AutoConfirm(true),
            Arc::new(MetricsStore::disabled()),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
