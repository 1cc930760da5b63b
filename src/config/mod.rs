// tenangdb/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::backup::archive::ArchiveFormat;
use crate::cleanup::RetentionPolicy;
use crate::errors::AppError;
use crate::utils::paths;

pub const CONFIG_PATH_ENV: &str = "TENANGDB_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

const DEFAULT_BATCH_SIZE: usize = 5;
const DEFAULT_CONCURRENCY: usize = 3;
const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 30;
const DEFAULT_DUMP_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_RESTORE_TIMEOUT_SECS: u64 = 60 * 60;
const DEFAULT_MIN_BACKUP_INTERVAL_SECS: u64 = 60 * 60;
const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 5 * 60;
const DEFAULT_MAX_AGE_DAYS: u32 = 7;
const DEFAULT_EXPORTER_PORT: u16 = 9090;
const DEFAULT_MYSQL_PORT: u16 = 3306;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonMysqlConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBackupOptions {
    pub directory: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub retry_count: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub check_last_backup_time: Option<bool>,
    pub min_backup_interval_secs: Option<u64>,
    pub skip_confirmation: Option<bool>,
    pub state_dir: Option<PathBuf>,
    pub compress: Option<bool>,
    pub archive_format: Option<String>,
    pub compression_level: Option<u32>,
    pub keep_original: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDumpOptions {
    pub use_mydumper: Option<bool>,
    pub mydumper_path: Option<PathBuf>,
    pub myloader_path: Option<PathBuf>,
    pub mysqldump_path: Option<PathBuf>,
    pub mysql_path: Option<PathBuf>,
    pub threads: Option<u32>,
    pub chunk_filesize_mb: Option<u32>,
    pub restore_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonUploadOptions {
    pub enabled: Option<bool>,
    pub destination: Option<String>,
    pub rclone_path: Option<PathBuf>,
    pub rclone_config_path: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub retention_days: Option<u32>,
    pub remote_cleanup_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonCleanupOptions {
    pub enabled: Option<bool>,
    pub cleanup_uploaded_files: Option<bool>,
    pub max_age_days: Option<u32>,
    pub weekend_only: Option<bool>,
    pub verify_cloud_exists: Option<bool>,
    pub databases: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonMetricsOptions {
    pub enabled: Option<bool>,
    pub file_path: Option<PathBuf>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonLoggingOptions {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub mysql: Option<JsonMysqlConfig>,
    pub database_list: Option<serde_json::Value>,
    pub backup: Option<JsonBackupOptions>,
    pub dump: Option<JsonDumpOptions>,
    pub upload: Option<JsonUploadOptions>,
    pub cleanup: Option<JsonCleanupOptions>,
    pub metrics: Option<JsonMetricsOptions>,
    pub logging: Option<JsonLoggingOptions>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub socket: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub databases: Vec<String>,
    pub directory: PathBuf,
    pub batch_size: usize,
    pub concurrency: usize,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub dump_timeout: Duration,
    pub check_last_backup_time: bool,
    pub min_backup_interval: Duration,
    pub skip_confirmation: bool,
    pub state_dir: PathBuf,
    pub compress: bool,
    pub archive_format: ArchiveFormat,
    pub compression_level: u32,
    pub keep_original: bool,
}

#[derive(Debug, Clone)]
pub struct DumpConfig {
    pub use_mydumper: bool,
    pub mydumper_path: Option<PathBuf>,
    pub myloader_path: Option<PathBuf>,
    pub mysqldump_path: Option<PathBuf>,
    pub mysql_path: Option<PathBuf>,
    pub threads: u32,
    pub chunk_filesize_mb: u32,
    pub restore_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub destination: String,
    pub rclone_path: Option<PathBuf>,
    pub rclone_config_path: Option<PathBuf>,
    pub timeout: Duration,
    pub retention_days: u32,
    pub remote_cleanup_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub policy: RetentionPolicy,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub file_path: PathBuf,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mysql: MysqlConfig,
    pub backup: BackupConfig,
    pub dump: DumpConfig,
    pub upload: Option<UploadConfig>,
    pub cleanup: CleanupConfig,
    pub metrics: MetricsConfig,
    pub log_level: String,
    /// Source database → restore target, from a mapping-style `database_list`.
    pub restore_targets: HashMap<String, String>,
}

impl AppConfig {
    /// Resolves the config path: explicit flag, then `TENANGDB_CONFIG`, then `./config.json`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        Self::from_raw(&raw_json_config).with_context(|| {
            format!("Invalid configuration in {}", config_path.display())
        })
    }

    pub fn from_raw(raw: &RawJsonConfig) -> Result<Self> {
        let databases = parse_database_list_for_backup(&raw.database_list)?.unwrap_or_default();
        let restore_targets = parse_database_list_for_restore(&raw.database_list)?.unwrap_or_default();

        let backup = load_backup_config(raw, databases)?;
        let cleanup = load_cleanup_config(raw, &backup.databases)?;

        Ok(AppConfig {
            mysql: load_mysql_config(raw),
            dump: load_dump_config(raw),
            upload: load_upload_config(raw)?,
            metrics: load_metrics_config(raw),
            log_level: raw
                .logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or_else(|| "info".to_string()),
            backup,
            cleanup,
            restore_targets,
        })
    }

    /// Replaces the configured database selection with the `--databases` override.
    pub fn override_databases(&mut self, databases: &[String]) -> Result<()> {
        if databases.is_empty() {
            return Ok(());
        }
        validate_database_names(databases)?;
        self.backup.databases = databases.to_vec();
        if self.cleanup.policy.databases.is_empty() {
            return Ok(());
        }
        self.cleanup.policy.databases = databases.to_vec();
        Ok(())
    }

    pub fn restore_target_for<'a>(&'a self, database: &'a str) -> &'a str {
        self.restore_targets
            .get(database)
            .map(String::as_str)
            .unwrap_or(database)
    }
}

fn load_mysql_config(raw: &RawJsonConfig) -> MysqlConfig {
    let mysql = raw.mysql.clone().unwrap_or_default();
    MysqlConfig {
        host: mysql.host.unwrap_or_else(|| "localhost".to_string()),
        port: mysql.port.unwrap_or(DEFAULT_MYSQL_PORT),
        username: mysql.username.unwrap_or_else(|| "root".to_string()),
        password: mysql.password.filter(|p| !p.is_empty()),
        socket: mysql.socket,
    }
}

fn load_backup_config(raw: &RawJsonConfig, databases: Vec<String>) -> Result<BackupConfig> {
    let opts = raw.backup.clone().unwrap_or_default();

    let directory = opts
        .directory
        .context("backup.directory must be set in config.json")?;
    if directory.to_string_lossy().is_empty() {
        return Err(AppError::Config("backup.directory cannot be empty".to_string()).into());
    }

    let archive_format: ArchiveFormat = opts
        .archive_format
        .as_deref()
        .unwrap_or("tar.gz")
        .parse()?;
    let compress = opts.compress.unwrap_or(true);
    if compress && !archive_format.is_implemented() {
        return Err(AppError::UnsupportedFormat(archive_format.name().to_string()).into());
    }

    let compression_level = opts.compression_level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
    if !(1..=9).contains(&compression_level) {
        return Err(AppError::Config(format!(
            "backup.compression_level must be between 1 and 9, got {}",
            compression_level
        ))
        .into());
    }

    let batch_size = opts.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
    let concurrency = opts.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
    if batch_size == 0 || concurrency == 0 {
        return Err(AppError::Config(
            "backup.batch_size and backup.concurrency must be greater than zero".to_string(),
        )
        .into());
    }

    let state_dir = match opts.state_dir {
        Some(dir) => dir,
        None => paths::default_state_dir(),
    };

    Ok(BackupConfig {
        databases,
        directory,
        batch_size,
        concurrency,
        retry_count: opts.retry_count.unwrap_or(DEFAULT_RETRY_COUNT).max(1),
        retry_delay: Duration::from_secs(opts.retry_delay_secs.unwrap_or(DEFAULT_RETRY_DELAY_SECS)),
        dump_timeout: Duration::from_secs(opts.timeout_secs.unwrap_or(DEFAULT_DUMP_TIMEOUT_SECS)),
        check_last_backup_time: opts.check_last_backup_time.unwrap_or(true),
        min_backup_interval: Duration::from_secs(
            opts.min_backup_interval_secs
                .unwrap_or(DEFAULT_MIN_BACKUP_INTERVAL_SECS),
        ),
        skip_confirmation: opts.skip_confirmation.unwrap_or(false),
        state_dir,
        compress,
        archive_format,
        compression_level,
        keep_original: opts.keep_original.unwrap_or(false),
    })
}

fn load_dump_config(raw: &RawJsonConfig) -> DumpConfig {
    let opts = raw.dump.clone().unwrap_or_default();
    DumpConfig {
        use_mydumper: opts.use_mydumper.unwrap_or(true),
        mydumper_path: opts.mydumper_path,
        myloader_path: opts.myloader_path,
        mysqldump_path: opts.mysqldump_path,
        mysql_path: opts.mysql_path,
        threads: opts.threads.unwrap_or(4).max(1),
        chunk_filesize_mb: opts.chunk_filesize_mb.unwrap_or(100),
        restore_timeout: Duration::from_secs(
            opts.restore_timeout_secs
                .unwrap_or(DEFAULT_RESTORE_TIMEOUT_SECS),
        ),
    }
}

fn load_upload_config(raw: &RawJsonConfig) -> Result<Option<UploadConfig>> {
    let Some(opts) = raw.upload.as_ref() else {
        return Ok(None);
    };
    if !opts.enabled.unwrap_or(false) {
        if opts.destination.is_some() {
            warn!("upload.destination is set but upload.enabled is false; uploads are disabled");
        }
        return Ok(None);
    }

    let destination = opts
        .destination
        .clone()
        .filter(|d| !d.trim().is_empty())
        .context("upload.destination must be set when upload.enabled is true")?;

    Ok(Some(UploadConfig {
        destination: destination.trim_end_matches('/').to_string(),
        rclone_path: opts.rclone_path.clone(),
        rclone_config_path: opts.rclone_config_path.clone(),
        timeout: Duration::from_secs(opts.timeout_secs.unwrap_or(DEFAULT_UPLOAD_TIMEOUT_SECS)),
        retention_days: opts.retention_days.unwrap_or(0),
        remote_cleanup_enabled: opts.remote_cleanup_enabled.unwrap_or(false),
    }))
}

fn load_cleanup_config(raw: &RawJsonConfig, backup_databases: &[String]) -> Result<CleanupConfig> {
    let opts = raw.cleanup.clone().unwrap_or_default();

    let databases = match opts.databases {
        Some(list) if !list.is_empty() => {
            validate_database_names(&list)?;
            list
        }
        _ => backup_databases.to_vec(),
    };

    let max_age_days = match opts.max_age_days {
        Some(0) => {
            warn!(
                "cleanup.max_age_days is 0; falling back to {} days",
                DEFAULT_MAX_AGE_DAYS
            );
            DEFAULT_MAX_AGE_DAYS
        }
        Some(days) => days,
        None => DEFAULT_MAX_AGE_DAYS,
    };

    Ok(CleanupConfig {
        enabled: opts.enabled.unwrap_or(false),
        policy: RetentionPolicy {
            cleanup_uploaded_files: opts.cleanup_uploaded_files.unwrap_or(false),
            max_age_days,
            weekend_only: opts.weekend_only.unwrap_or(true),
            verify_cloud_exists: opts.verify_cloud_exists.unwrap_or(false),
            databases,
        },
    })
}

fn load_metrics_config(raw: &RawJsonConfig) -> MetricsConfig {
    let opts = raw.metrics.clone().unwrap_or_default();
    MetricsConfig {
        enabled: opts.enabled.unwrap_or(true),
        file_path: opts.file_path.unwrap_or_else(paths::default_metrics_file),
        port: opts.port.unwrap_or(DEFAULT_EXPORTER_PORT),
    }
}

fn validate_database_names(names: &[String]) -> Result<()> {
    if let Some(bad) = names.iter().find(|name| {
        name.trim().is_empty()
            || name.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-' && c != '$')
    }) {
        return Err(AppError::Config(format!(
            "Invalid database name in database list: {:?}",
            bad
        ))
        .into());
    }
    Ok(())
}

/// Parses the database_list configuration for backup and cleanup
/// Returns source database names in the order they appear in the file
fn parse_database_list_for_backup(database_list: &Option<serde_json::Value>) -> Result<Option<Vec<String>>> {
    let databases = match database_list {
        Some(value) => {
            if value.is_array() {
                // ["db1", "db2"]
                let databases: Vec<String> = serde_json::from_value(value.clone())
                    .context("Failed to parse database_list as array")?;
                databases
            } else if let Some(mapping) = value.as_object() {
                // {"source_db": "target_db"}; only source names matter here
                mapping.keys().cloned().collect()
            } else {
                return Err(anyhow::anyhow!("database_list must be either an array of database names or a mapping object"));
            }
        }
        None => return Ok(None),
    };
    validate_database_names(&databases)?;
    Ok(Some(databases))
}

/// Parses the database_list configuration for restore operations
/// Returns a mapping of source database names to target database names
fn parse_database_list_for_restore(database_list: &Option<serde_json::Value>) -> Result<Option<HashMap<String, String>>> {
    match database_list {
        Some(value) => {
            if value.is_array() {
                // ["db1", "db2"] maps each database to itself
                let databases: Vec<String> = serde_json::from_value(value.clone())
                    .context("Failed to parse database_list as array")?;
                let mapping: HashMap<String, String> = databases.into_iter().map(|db| (db.clone(), db)).collect();
                Ok(Some(mapping))
            } else if value.is_object() {
                let mapping: HashMap<String, String> = serde_json::from_value(value.clone())
                    .context("Failed to parse database_list as mapping object")?;
                Ok(Some(mapping))
            } else {
                Err(anyhow::anyhow!("database_list must be either an array of database names or a mapping object"))
            }
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_from(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).expect("valid raw config")
    }

    #[test]
    fn test_parse_database_list_for_backup_array() -> anyhow::Result<()> {
        let value = Some(json!(["db1", "db2", "db3"]));
        let result = parse_database_list_for_backup(&value)?;

        assert_eq!(result, Some(vec!["db1".to_string(), "db2".to_string(), "db3".to_string()]));
        Ok(())
    }

    #[test]
    fn test_parse_database_list_for_backup_mapping() -> anyhow::Result<()> {
        let value = Some(json!({
            "shop_prod": "shop_staging",
            "analytics_db": "analytics_staging"
        }));
        let result_vec = parse_database_list_for_backup(&value)?.unwrap();

        assert_eq!(result_vec, vec!["shop_prod".to_string(), "analytics_db".to_string()]);
        Ok(())
    }

    #[test]
    fn test_parse_database_list_for_restore_mapping() -> anyhow::Result<()> {
        let value = Some(json!({
            "shop_prod": "shop_staging",
            "analytics_db": "analytics_staging"
        }));
        let result = parse_database_list_for_restore(&value)?.unwrap();

        assert_eq!(result.get("shop_prod"), Some(&"shop_staging".to_string()));
        assert_eq!(result.get("analytics_db"), Some(&"analytics_staging".to_string()));
        Ok(())
    }

    #[test]
    fn test_parse_database_list_invalid_format() {
        let value = Some(json!("invalid_string"));
        assert!(parse_database_list_for_backup(&value).is_err());
        assert!(parse_database_list_for_restore(&value).is_err());
    }

    #[test]
    fn test_invalid_database_name_rejected() {
        let value = Some(json!(["good_db", "bad;db"]));
        assert!(parse_database_list_for_backup(&value).is_err());
    }

    #[test]
    fn test_defaults_applied() -> anyhow::Result<()> {
        let raw = raw_from(json!({
            "database_list": ["shopdb", "billing"],
            "backup": { "directory": "/var/backups/mysql", "state_dir": "/tmp/tenangdb-state" },
            "metrics": { "file_path": "/tmp/tenangdb-metrics.json" }
        }));
        let config = AppConfig::from_raw(&raw)?;

        assert_eq!(config.backup.databases, vec!["shopdb", "billing"]);
        assert_eq!(config.backup.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.backup.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.backup.retry_count, DEFAULT_RETRY_COUNT);
        assert_eq!(config.backup.archive_format, ArchiveFormat::TarGz);
        assert_eq!(config.cleanup.policy.max_age_days, DEFAULT_MAX_AGE_DAYS);
        assert_eq!(config.cleanup.policy.databases, vec!["shopdb", "billing"]);
        assert!(config.upload.is_none());
        assert_eq!(config.restore_target_for("shopdb"), "shopdb");
        Ok(())
    }

    #[test]
    fn test_unimplemented_archive_format_rejected_at_load() {
        let raw = raw_from(json!({
            "database_list": ["shopdb"],
            "backup": { "directory": "/var/backups/mysql", "archive_format": "tar.zst" }
        }));
        let err = AppConfig::from_raw(&raw).unwrap_err();
        assert!(err.to_string().contains("Unsupported archive format"));
    }

    #[test]
    fn test_compression_level_out_of_range() {
        let raw = raw_from(json!({
            "database_list": ["shopdb"],
            "backup": { "directory": "/var/backups/mysql", "compression_level": 12 }
        }));
        assert!(AppConfig::from_raw(&raw).is_err());
    }

    #[test]
    fn test_zero_max_age_falls_back_to_seven_days() -> anyhow::Result<()> {
        let raw = raw_from(json!({
            "database_list": ["shopdb"],
            "backup": { "directory": "/var/backups/mysql", "state_dir": "/tmp/s" },
            "cleanup": { "enabled": true, "max_age_days": 0 }
        }));
        let config = AppConfig::from_raw(&raw)?;
        assert_eq!(config.cleanup.policy.max_age_days, 7);
        Ok(())
    }

    #[test]
    fn test_upload_requires_destination() {
        let raw = raw_from(json!({
            "database_list": ["shopdb"],
            "backup": { "directory": "/var/backups/mysql", "state_dir": "/tmp/s" },
            "upload": { "enabled": true }
        }));
        assert!(AppConfig::from_raw(&raw).is_err());
    }

    #[test]
    fn test_databases_override_and_restore_mapping() -> anyhow::Result<()> {
        let raw = raw_from(json!({
            "database_list": { "shopdb": "shopdb_restored" },
            "backup": { "directory": "/var/backups/mysql", "state_dir": "/tmp/s" },
            "upload": { "enabled": true, "destination": "s3remote:bucket/mysql/" }
        }));
        let mut config = AppConfig::from_raw(&raw)?;
        assert_eq!(config.restore_target_for("shopdb"), "shopdb_restored");
        assert_eq!(config.upload.as_ref().unwrap().destination, "s3remote:bucket/mysql");

        config.override_databases(&["billing".to_string()])?;
        assert_eq!(config.backup.databases, vec!["billing"]);
        assert_eq!(config.cleanup.policy.databases, vec!["billing"]);
        Ok(())
    }
}
