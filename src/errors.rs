use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dump failed for {database}: {reason}")]
    Dump { database: String, reason: String },

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("Restore operation failed: {0}")]
    Restore(String),

    #[error("Metrics store error: {0}")]
    Metrics(String),

    #[error("Unsupported archive format '{0}': only tar.gz is implemented")]
    UnsupportedFormat(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Command `{program}` failed ({status}): {stderr}")]
    Command {
        program: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Cancellation is a deliberate shutdown, not a pipeline failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
