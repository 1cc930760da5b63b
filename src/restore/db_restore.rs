// tenangdb/src/restore/db_restore.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backup::db_dump::{mydumper_connection_args, mysql_client_connection_args};
use crate::config::{AppConfig, MysqlConfig};
use crate::errors::{AppError, Result};
use crate::utils::find_executable;
use crate::utils::process::run_command;

/// Loads a dump back into a database.
#[async_trait]
pub trait RestoreExecutor: Send + Sync {
    async fn restore(&self, source: &Path, target_database: &str, cancel: &CancellationToken) -> Result<()>;
}

/// What kind of dump sits at a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpLayout {
    /// mydumper output: a directory with a `metadata` file.
    Mydumper(PathBuf),
    /// A single `.sql` file from mysqldump.
    SqlFile(PathBuf),
}

/// Inspects `path`. A directory holding exactly one `.sql` file counts as that file.
pub fn detect_layout(path: &Path) -> Result<DumpLayout> {
    if path.is_file() {
        return match path.extension().and_then(|e| e.to_str()) {
            Some("sql") => Ok(DumpLayout::SqlFile(path.to_path_buf())),
            _ => Err(AppError::Restore(format!("Not a SQL dump: {}", path.display()))),
        };
    }
    if !path.is_dir() {
        return Err(AppError::Restore(format!("Backup path does not exist: {}", path.display())));
    }
    if path.join("metadata").is_file() {
        return Ok(DumpLayout::Mydumper(path.to_path_buf()));
    }

    let sql_files: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "sql"))
        .collect();
    match sql_files.as_slice() {
        [single] => Ok(DumpLayout::SqlFile(single.clone())),
        [] => Err(AppError::Restore(format!(
            "No mydumper metadata or SQL dump found in {}",
            path.display()
        ))),
        _ => Err(AppError::Restore(format!(
            "Ambiguous backup: {} SQL files in {}",
            sql_files.len(),
            path.display()
        ))),
    }
}

/// `myloader` restore of a mydumper directory.
pub struct MyloaderExecutor {
    binary: PathBuf,
    mysql: MysqlConfig,
    threads: u32,
    timeout: Duration,
}

impl MyloaderExecutor {
    pub fn new(binary: PathBuf, mysql: MysqlConfig, threads: u32, timeout: Duration) -> Self {
        Self {
            binary,
            mysql,
            threads,
            timeout,
        }
    }

    fn command_for(&self, source: &Path, target_database: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--directory")
            .arg(source)
            .arg("--database")
            .arg(target_database)
            .arg("--threads")
            .arg(self.threads.to_string())
            .arg("--overwrite-tables")
            .arg("--verbose")
            .arg("2");
        mydumper_connection_args(&mut cmd, &self.mysql);
        cmd
    }
}

#[async_trait]
impl RestoreExecutor for MyloaderExecutor {
    async fn restore(&self, source: &Path, target_database: &str, cancel: &CancellationToken) -> Result<()> {
        info!(source = %source.display(), target = target_database, "restoring with myloader");
        let cmd = self.command_for(source, target_database);
        run_command(cmd, &format!("myloader {}", target_database), self.timeout, cancel)
            .await
            .map_err(|e| restore_error(target_database, e))?;
        Ok(())
    }
}

/// `mysql` client restore of a single SQL file.
pub struct MysqlClientExecutor {
    binary: PathBuf,
    mysql: MysqlConfig,
    timeout: Duration,
}

impl MysqlClientExecutor {
    pub fn new(binary: PathBuf, mysql: MysqlConfig, timeout: Duration) -> Self {
        Self { binary, mysql, timeout }
    }

    fn create_database_command(&self, target_database: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        mysql_client_connection_args(&mut cmd, &self.mysql);
        cmd.arg("-e").arg(format!(
            "CREATE DATABASE IF NOT EXISTS `{}`",
            target_database.replace('`', "``")
        ));
        cmd
    }

    fn import_command(&self, target_database: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        mysql_client_connection_args(&mut cmd, &self.mysql);
        cmd.arg(target_database);
        cmd
    }
}

#[async_trait]
impl RestoreExecutor for MysqlClientExecutor {
    async fn restore(&self, source: &Path, target_database: &str, cancel: &CancellationToken) -> Result<()> {
        info!(source = %source.display(), target = target_database, "restoring with mysql client");

        let create = self.create_database_command(target_database);
        run_command(create, &format!("create database {}", target_database), self.timeout, cancel)
            .await
            .map_err(|e| restore_error(target_database, e))?;

        let dump = std::fs::File::open(source)
            .map_err(|e| AppError::Restore(format!("cannot open {}: {}", source.display(), e)))?;
        let mut import = self.import_command(target_database);
        import.stdin(Stdio::from(dump));
        run_command(import, &format!("mysql import {}", target_database), self.timeout, cancel)
            .await
            .map_err(|e| restore_error(target_database, e))?;
        Ok(())
    }
}

fn restore_error(target_database: &str, err: AppError) -> AppError {
    match err {
        AppError::Cancelled(_) | AppError::Timeout { .. } => err,
        other => AppError::Restore(format!("{}: {}", target_database, other)),
    }
}

/// Resolves the tool that fits `layout`.
pub fn restore_executor_for(layout: &DumpLayout, config: &AppConfig) -> anyhow::Result<Arc<dyn RestoreExecutor>> {
    let dump = &config.dump;
    Ok(match layout {
        DumpLayout::Mydumper(_) => {
            let binary = find_executable("myloader", dump.myloader_path.as_deref())?;
            Arc::new(MyloaderExecutor::new(
                binary,
                config.mysql.clone(),
                dump.threads,
                dump.restore_timeout,
            ))
        }
        DumpLayout::SqlFile(_) => {
            let binary = find_executable("mysql", dump.mysql_path.as_deref())?;
            Arc::new(MysqlClientExecutor::new(binary, config.mysql.clone(), dump.restore_timeout))
        }
    })
}
