// tenangdb/src/metrics/store.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::{AppError, Result};

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemMetrics {
    pub total_databases: u64,
    pub last_run_time: Option<DateTime<Utc>>,
    pub run_active: bool,
    pub healthy: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationMetrics {
    pub last_time: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    pub duration_seconds: f64,
    pub status: String,
    pub success_count: u64,
    pub failure_count: u64,
}

impl OperationMetrics {
    fn record(&mut self, success: bool, size_bytes: u64, duration: Duration, at: DateTime<Utc>) {
        self.last_time = Some(at);
        self.size_bytes = size_bytes;
        self.duration_seconds = duration.as_secs_f64();
        if success {
            self.status = STATUS_SUCCESS.to_string();
            self.success_count += 1;
        } else {
            self.status = STATUS_FAILED.to_string();
            self.failure_count += 1;
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupMetrics {
    pub last_time: Option<DateTime<Utc>>,
    /// Totals over every recorded cleanup.
    pub files_removed: u64,
    pub bytes_freed: u64,
    /// Last run only.
    pub duration_seconds: f64,
    pub success_count: u64,
    pub failure_count: u64,
}

/// Everything the exporter publishes, as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsDocument {
    pub system: SystemMetrics,
    pub backups: BTreeMap<String, OperationMetrics>,
    pub uploads: BTreeMap<String, OperationMetrics>,
    pub restores: BTreeMap<String, OperationMetrics>,
    pub cleanup: CleanupMetrics,
}

/// One JSON file, rewritten whole on every update.
///
/// Updates are serialized within this process only; two processes writing the
/// same file race and the last rename wins.
#[derive(Debug)]
pub struct MetricsStore {
    path: Option<PathBuf>,
    lock: RwLock<()>,
}

impl MetricsStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            lock: RwLock::new(()),
        }
    }

    /// A store that accepts updates and writes nothing.
    pub fn disabled() -> Self {
        Self {
            path: None,
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> Result<MetricsDocument> {
        let Some(path) = &self.path else {
            return Ok(MetricsDocument::default());
        };
        let _guard = self
            .lock
            .read()
            .map_err(|_| AppError::Metrics("metrics lock poisoned".to_string()))?;
        read_document(path)
    }

    pub fn save(&self, doc: &MetricsDocument) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self
            .lock
            .write()
            .map_err(|_| AppError::Metrics("metrics lock poisoned".to_string()))?;
        write_document(path, doc)
    }

    /// Load, mutate, save under the write lock.
    pub fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut MetricsDocument),
    {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self
            .lock
            .write()
            .map_err(|_| AppError::Metrics("metrics lock poisoned".to_string()))?;
        let mut doc = read_document(path)?;
        mutate(&mut doc);
        write_document(path, &doc)?;
        debug!(path = %path.display(), "metrics updated");
        Ok(())
    }

    pub fn update_backup_metrics(&self, database: &str, success: bool, size_bytes: u64, duration: Duration) -> Result<()> {
        self.update(|doc| {
            doc.backups
                .entry(database.to_string())
                .or_default()
                .record(success, size_bytes, duration, Utc::now())
        })
    }

    pub fn update_upload_metrics(&self, database: &str, success: bool, size_bytes: u64, duration: Duration) -> Result<()> {
        self.update(|doc| {
            doc.uploads
                .entry(database.to_string())
                .or_default()
                .record(success, size_bytes, duration, Utc::now())
        })
    }

    pub fn update_restore_metrics(&self, database: &str, success: bool, size_bytes: u64, duration: Duration) -> Result<()> {
        self.update(|doc| {
            doc.restores
                .entry(database.to_string())
                .or_default()
                .record(success, size_bytes, duration, Utc::now())
        })
    }

    pub fn update_cleanup_metrics(&self, success: bool, files_removed: u64, bytes_freed: u64, duration: Duration) -> Result<()> {
        self.update(|doc| {
            let cleanup = &mut doc.cleanup;
            cleanup.last_time = Some(Utc::now());
            cleanup.files_removed += files_removed;
            cleanup.bytes_freed += bytes_freed;
            cleanup.duration_seconds = duration.as_secs_f64();
            if success {
                cleanup.success_count += 1;
            } else {
                cleanup.failure_count += 1;
            }
        })
    }

    pub fn update_system_metrics(&self, total_databases: u64, run_active: bool, healthy: bool) -> Result<()> {
        self.update(|doc| {
            let system = &mut doc.system;
            system.total_databases = total_databases;
            system.run_active = run_active;
            system.healthy = healthy;
            if !run_active {
                system.last_run_time = Some(Utc::now());
            }
        })
    }
}

fn read_document(path: &Path) -> Result<MetricsDocument> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .map_err(|e| AppError::Metrics(format!("cannot parse {}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MetricsDocument::default()),
        Err(e) => Err(AppError::Metrics(format!("cannot read {}: {}", path.display(), e))),
    }
}

/// Sibling temp file, fsync, rename over the target.
fn write_document(path: &Path, doc: &MetricsDocument) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let body = serde_json::to_vec_pretty(doc)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| AppError::Metrics(format!("cannot replace {}: {}", path.display(), e.error)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> MetricsStore {
        MetricsStore::new(dir.path().join("state").join("metrics.json"))
    }

    #[test]
    fn test_missing_file_loads_default() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.load().unwrap(), MetricsDocument::default());
    }

    #[test]
    fn test_counters_accumulate_and_gauges_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.update_backup_metrics("shopdb", true, 100, Duration::from_secs(2)).unwrap();
        store.update_backup_metrics("shopdb", false, 0, Duration::from_secs(1)).unwrap();
        store.update_backup_metrics("shopdb", true, 300, Duration::from_secs(3)).unwrap();

        let doc = store.load().unwrap();
        let shop = &doc.backups["shopdb"];
        assert_eq!(shop.success_count, 2);
        assert_eq!(shop.failure_count, 1);
        assert_eq!(shop.size_bytes, 300);
        assert_eq!(shop.duration_seconds, 3.0);
        assert!(shop.succeeded());
        assert!(doc.uploads.is_empty());
    }

    #[test]
    fn test_system_and_cleanup_sections() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.update_system_metrics(4, true, true).unwrap();
        let doc = store.load().unwrap();
        assert!(doc.system.run_active);
        assert!(doc.system.last_run_time.is_none());

        store.update_system_metrics(4, false, false).unwrap();
        store.update_cleanup_metrics(true, 3, 4096, Duration::from_millis(500)).unwrap();
        let doc = store.load().unwrap();
        assert!(!doc.system.run_active);
        assert!(!doc.system.healthy);
        assert!(doc.system.last_run_time.is_some());
        assert_eq!(doc.cleanup.files_removed, 3);
        assert_eq!(doc.cleanup.bytes_freed, 4096);
        assert_eq!(doc.cleanup.success_count, 1);
    }

    #[test]
    fn test_cleanup_totals_accumulate_across_runs() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.update_cleanup_metrics(true, 3, 1000, Duration::from_secs(2)).unwrap();
        store.update_cleanup_metrics(true, 2, 500, Duration::from_secs(1)).unwrap();
        store.update_cleanup_metrics(false, 0, 0, Duration::from_millis(10)).unwrap();

        let cleanup = store.load().unwrap().cleanup;
        assert_eq!(cleanup.files_removed, 5);
        assert_eq!(cleanup.bytes_freed, 1500);
        assert_eq!(cleanup.success_count, 2);
        assert_eq!(cleanup.failure_count, 1);
        assert!(cleanup.duration_seconds < 1.0);
    }

    #[test]
    fn test_save_leaves_complete_document_and_ignores_stray_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.update_restore_metrics("shopdb", true, 10, Duration::from_secs(1)).unwrap();

        // A writer that died before renaming leaves only a partial temp file behind.
        let parent = store.path().unwrap().parent().unwrap();
        std::fs::write(parent.join(".tmpPARTIAL"), b"{\"system\": {").unwrap();

        let raw = std::fs::read_to_string(store.path().unwrap()).unwrap();
        let parsed: MetricsDocument = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.restores["shopdb"].success_count, 1);
        assert_eq!(store.load().unwrap(), parsed);
    }

    #[test]
    fn test_corrupt_file_is_a_metrics_error() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::create_dir_all(store.path().unwrap().parent().unwrap()).unwrap();
        std::fs::write(store.path().unwrap(), b"not json").unwrap();

        assert!(matches!(store.load(), Err(AppError::Metrics(_))));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&dir));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .update_upload_metrics(&format!("db{}", i % 2), true, 1, Duration::ZERO)
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let doc = store.load().unwrap();
        assert_eq!(doc.uploads["db0"].success_count, 4);
        assert_eq!(doc.uploads["db1"].success_count, 4);
    }

    #[test]
    fn test_disabled_store_writes_nothing() {
        let store = MetricsStore::disabled();
        store.update_backup_metrics("shopdb", true, 1, Duration::ZERO).unwrap();
        assert_eq!(store.load().unwrap(), MetricsDocument::default());
    }
}
