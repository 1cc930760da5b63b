pub mod logger;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod shutdown;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use which::which;

/// Resolves an external tool: the configured path when given, otherwise a PATH lookup.
pub fn find_executable(name: &str, configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("{} executable not found at configured path {}", name, path.display());
    }
    which(name).with_context(|| {
        format!("{} executable not found in PATH. Please ensure it is installed and in your PATH.", name)
    })
}

/// Total size in bytes of a file, or of every regular file below a directory.
pub fn disk_usage(path: &Path) -> u64 {
    if path.is_file() {
        return path.metadata().map(|m| m.len()).unwrap_or(0);
    }
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_disk_usage_sums_nested_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("a/b"))?;
        fs::write(dir.path().join("a/one.sql"), vec![0u8; 10])?;
        fs::write(dir.path().join("a/b/two.sql"), vec![0u8; 32])?;

        assert_eq!(disk_usage(dir.path()), 42);
        assert_eq!(disk_usage(&dir.path().join("a/one.sql")), 10);
        Ok(())
    }

    #[test]
    fn test_find_executable_rejects_missing_configured_path() {
        let missing = Path::new("/definitely/not/here/mydumper");
        assert!(find_executable("mydumper", Some(missing)).is_err());
    }
}
