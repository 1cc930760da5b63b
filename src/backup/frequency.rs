// tenangdb/src/backup/frequency.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

use crate::errors::{AppError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct TrackerFile {
    last_backup_time: DateTime<Utc>,
}

/// Remembers when the last successful run finished for one backup root.
#[derive(Debug, Clone)]
pub struct FrequencyTracker {
    path: PathBuf,
}

impl FrequencyTracker {
    /// One tracker per backup root, keyed by a hash of the root path.
    pub fn for_backup_dir(backup_dir: &Path, state_dir: &Path) -> Self {
        let digest = Sha256::digest(backup_dir.to_string_lossy().as_bytes());
        let key = hex::encode(digest);
        Self {
            path: state_dir.join(format!("last_backup_{}.json", &key[..16])),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no run has been recorded yet.
    pub fn last_run(&self) -> Result<Option<DateTime<Utc>>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let tracker: TrackerFile = serde_json::from_str(&content)?;
        Ok(Some(tracker.last_backup_time))
    }

    pub fn record_run(&self, at: DateTime<Utc>) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| AppError::Config(format!("Invalid tracker path: {}", self.path.display())))?;
        std::fs::create_dir_all(parent)?;

        let body = serde_json::to_vec_pretty(&TrackerFile { last_backup_time: at })?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| AppError::Io(e.error))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    TooSoon {
        last_run: DateTime<Utc>,
        elapsed: Duration,
        remaining: Duration,
    },
}

/// Decides whether enough time has passed since `last_run`.
///
/// A recorded time in the future counts as zero elapsed.
pub fn check_gate(last_run: Option<DateTime<Utc>>, now: DateTime<Utc>, min_interval: Duration) -> GateDecision {
    let Some(last_run) = last_run else {
        return GateDecision::Proceed;
    };
    let elapsed = (now - last_run).to_std().unwrap_or(Duration::ZERO);
    if elapsed >= min_interval {
        GateDecision::Proceed
    } else {
        GateDecision::TooSoon {
            last_run,
            elapsed,
            remaining: min_interval - elapsed,
        }
    }
}

/// `1h 5m`, `12m 30s`, `45s`
pub fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_gate_blocks_recent_run() {
        let now = Utc::now();
        let decision = check_gate(Some(now - ChronoDuration::minutes(30)), now, HOUR);
        match decision {
            GateDecision::TooSoon { elapsed, remaining, .. } => {
                assert_eq!(elapsed, Duration::from_secs(30 * 60));
                assert_eq!(remaining, Duration::from_secs(30 * 60));
            }
            other => panic!("expected TooSoon, got {:?}", other),
        }
    }

    #[test]
    fn test_gate_allows_after_interval() {
        let now = Utc::now();
        assert_eq!(
            check_gate(Some(now - ChronoDuration::minutes(61)), now, HOUR),
            GateDecision::Proceed
        );
        assert_eq!(check_gate(None, now, HOUR), GateDecision::Proceed);
    }

    #[test]
    fn test_tracker_round_trip() {
        let state = TempDir::new().unwrap();
        let tracker = FrequencyTracker::for_backup_dir(Path::new("/backups"), &state.path().join("nested"));
        assert_eq!(tracker.last_run().unwrap(), None);

        let at = Utc::now();
        tracker.record_run(at).unwrap();
        assert_eq!(tracker.last_run().unwrap(), Some(at));

        let raw = std::fs::read_to_string(tracker.path()).unwrap();
        assert!(raw.contains("last_backup_time"));
    }

    #[test]
    fn test_tracker_is_per_backup_root() {
        let state = Path::new("/state");
        let a = FrequencyTracker::for_backup_dir(Path::new("/backups/a"), state);
        let b = FrequencyTracker::for_backup_dir(Path::new("/backups/b"), state);
        assert_ne!(a.path(), b.path());

        let name = a.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("last_backup_"));
        assert_eq!(name.len(), "last_backup_".len() + 16 + ".json".len());
    }

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(Duration::from_secs(45)), "45s");
        assert_eq!(human_duration(Duration::from_secs(750)), "12m 30s");
        assert_eq!(human_duration(Duration::from_secs(3900)), "1h 5m");
    }
}
