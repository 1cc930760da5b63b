// tenangdb/src/cleanup/logic.rs
use chrono::{DateTime, Utc, Weekday};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::RetentionPolicy;
use super::upload_record::UploadRecord;
use crate::backup::transfer::{TransferClient, is_month_segment};
use crate::errors::{AppError, Result};
use crate::utils::disk_usage;

const SECS_PER_DAY: u64 = 86_400;
pub const FALLBACK_MAX_AGE_DAYS: u32 = 7;
/// How long an uploaded artifact stays on disk after its upload completed.
pub const UPLOADED_MIN_AGE_SECS: i64 = 3600;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub files_removed: u64,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub age_days: u64,
    pub size_bytes: u64,
}

pub fn is_cleanup_day(today: Weekday, weekend_only: bool, force: bool) -> bool {
    force || !weekend_only || matches!(today, Weekday::Sat | Weekday::Sun)
}

/// Whole days between `modified` and `now`; a future mtime counts as zero.
pub fn age_in_days(modified: SystemTime, now: SystemTime) -> u64 {
    now.duration_since(modified)
        .map(|d| d.as_secs() / SECS_PER_DAY)
        .unwrap_or(0)
}

/// `relative` is the artifact's path below the backup root.
///
/// A database matches on an exact path segment, or when the filename starts
/// with its name followed by `-`, `_` or `.`. No databases means everything matches.
pub fn matches_database(relative: &Path, databases: &[String]) -> bool {
    if databases.is_empty() {
        return true;
    }

    let segments: Vec<&str> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();
    let file_name = segments.last().copied().unwrap_or_default();

    databases.iter().any(|db| {
        segments.iter().any(|s| s == db)
            || file_name
                .strip_prefix(db.as_str())
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| matches!(c, '-' | '_' | '.'))
    })
}

/// Removes local backups by age or once their upload is confirmed.
#[derive(Debug, Clone)]
pub struct RetentionEngine {
    backup_dir: PathBuf,
    policy: RetentionPolicy,
    dry_run: bool,
}

impl RetentionEngine {
    pub fn new(backup_dir: PathBuf, policy: RetentionPolicy, dry_run: bool) -> Self {
        Self {
            backup_dir,
            policy,
            dry_run,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    fn max_age_days(&self) -> u64 {
        match self.policy.max_age_days {
            0 => FALLBACK_MAX_AGE_DAYS as u64,
            days => days as u64,
        }
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.backup_dir).unwrap_or(path)
    }

    /// Regular files anywhere under the root, and dump directories sitting
    /// directly inside a `YYYY-MM` directory, that are old enough.
    pub fn aged_candidates(&self, now: SystemTime) -> Result<Vec<Candidate>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }

        let max_age = self.max_age_days();
        let mut candidates = Vec::new();
        let mut walker = WalkDir::new(&self.backup_dir)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| AppError::Cleanup(format!("cannot scan backups: {}", e)))?;
            let path = entry.path();

            let is_dump_dir = entry.file_type().is_dir()
                && path
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                    .is_some_and(is_month_segment);
            if is_dump_dir {
                walker.skip_current_dir();
            } else if !entry.file_type().is_file() {
                continue;
            }

            if !matches_database(self.relative(path), &self.policy.databases) {
                continue;
            }

            let modified = entry
                .metadata()
                .map_err(|e| AppError::Cleanup(format!("cannot stat {}: {}", path.display(), e)))?
                .modified()?;
            let age_days = age_in_days(modified, now);
            if age_days >= max_age {
                candidates.push(Candidate {
                    path: path.to_path_buf(),
                    age_days,
                    size_bytes: disk_usage(path),
                });
            } else {
                debug!(path = %path.display(), age_days, "keeping backup");
            }
        }
        Ok(candidates)
    }

    /// Age-based mode; ignores upload status.
    pub fn cleanup_aged(&self, now: SystemTime) -> Result<CleanupOutcome> {
        let candidates = self.aged_candidates(now)?;
        info!(
            backup_dir = %self.backup_dir.display(),
            max_age_days = self.max_age_days(),
            candidates = candidates.len(),
            dry_run = self.dry_run,
            "age-based cleanup"
        );
        self.remove_candidates(&candidates)
    }

    /// Removes `candidates` in order. The first failure ends the pass;
    /// entries removed before it stay removed.
    pub fn remove_candidates(&self, candidates: &[Candidate]) -> Result<CleanupOutcome> {
        let mut outcome = CleanupOutcome::default();
        for candidate in candidates {
            self.remove(candidate, &mut outcome)?;
        }
        Ok(outcome)
    }

    /// Upload-tracked mode: artifacts uploaded at least an hour ago.
    pub async fn cleanup_uploaded(
        &self,
        record: &UploadRecord,
        transfer: Option<&TransferClient>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CleanupOutcome> {
        let mut outcome = CleanupOutcome::default();
        if !self.policy.cleanup_uploaded_files {
            return Ok(outcome);
        }

        for (path, uploaded_at) in record.entries() {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled("upload-tracked cleanup".to_string()));
            }
            if (now - uploaded_at).num_seconds() < UPLOADED_MIN_AGE_SECS {
                continue;
            }
            if !path.exists() {
                record.forget(&path);
                continue;
            }
            if !matches_database(self.relative(&path), &self.policy.databases) {
                continue;
            }

            if self.policy.verify_cloud_exists {
                let Some(transfer) = transfer else {
                    warn!(path = %path.display(), "cannot verify upload without a remote destination, keeping");
                    continue;
                };
                if !transfer.verify_uploaded(&path, cancel).await? {
                    warn!(path = %path.display(), "uploaded copy not found remotely, keeping");
                    continue;
                }
            }

            let candidate = Candidate {
                age_days: (now - uploaded_at).num_days().max(0) as u64,
                size_bytes: disk_usage(&path),
                path,
            };
            self.remove(&candidate, &mut outcome)?;
            if !self.dry_run {
                record.forget(&candidate.path);
            }
        }
        Ok(outcome)
    }

    fn remove(&self, candidate: &Candidate, outcome: &mut CleanupOutcome) -> Result<()> {
        let path = &candidate.path;
        if self.dry_run {
            info!(path = %path.display(), age_days = candidate.age_days, size_bytes = candidate.size_bytes, "would remove backup");
        } else {
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            removed.map_err(|e| AppError::Cleanup(format!("cannot remove {}: {}", path.display(), e)))?;
            info!(path = %path.display(), age_days = candidate.age_days, size_bytes = candidate.size_bytes, "removed backup");
        }
        outcome.files_removed += 1;
        outcome.bytes_freed += candidate.size_bytes;
        Ok(())
    }
}
