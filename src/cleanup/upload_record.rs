use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Local artifacts uploaded during this process, with their completion time.
#[derive(Debug, Default)]
pub struct UploadRecord {
    entries: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
}

impl UploadRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// A panic elsewhere while holding the lock leaves the map itself intact.
    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, DateTime<Utc>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, local_path: &Path, uploaded_at: DateTime<Utc>) {
        self.lock().insert(local_path.to_path_buf(), uploaded_at);
    }

    pub fn forget(&self, local_path: &Path) {
        self.lock().remove(local_path);
    }

    /// Snapshot sorted by path.
    pub fn entries(&self) -> Vec<(PathBuf, DateTime<Utc>)> {
        let mut snapshot: Vec<_> = self.lock().iter().map(|(p, t)| (p.clone(), *t)).collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
