//! Platform locations for state that outlives a single invocation.

use std::path::PathBuf;

const APP_DIR: &str = "tenangdb";

/// Directory holding the frequency tracker files.
///
/// Prefers the XDG state dir, then the local data dir, then the temp dir so a
/// container without a home directory still gets a writable location.
pub fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

pub fn default_metrics_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join("metrics.json")
}
