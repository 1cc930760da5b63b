// tenangdb/src/backup/db_dump.rs
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AppConfig, MysqlConfig};
use crate::errors::{AppError, Result};
use crate::utils::find_executable;
use crate::utils::process::run_command;

/// Produces a consistent snapshot of one database on disk.
#[async_trait]
pub trait DumpExecutor: Send + Sync {
    /// Dumps `database` into a new directory under `target_dir` and returns it.
    async fn dump(
        &self,
        database: &str,
        target_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

/// `<root>/<database>/<YYYY-MM>`: where a database's dumps for the month live.
pub fn month_dir(backup_root: &Path, database: &str, now: DateTime<Local>) -> PathBuf {
    backup_root
        .join(database)
        .join(now.format("%Y-%m").to_string())
}

/// `<database>-<YYYY-MM-DD_HH-MM-SS>`
pub fn dump_dir_name(database: &str, now: DateTime<Local>) -> String {
    format!("{}-{}", database, now.format("%Y-%m-%d_%H-%M-%S"))
}

fn dump_error(database: &str, err: AppError) -> AppError {
    if err.is_cancelled() {
        return err;
    }
    AppError::Dump {
        database: database.to_string(),
        reason: err.to_string(),
    }
}

fn prepare_output_dir(database: &str, target_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(target_dir).map_err(|e| AppError::Dump {
        database: database.to_string(),
        reason: format!("cannot create {}: {}", target_dir.display(), e),
    })?;
    Ok(target_dir.join(dump_dir_name(database, Local::now())))
}

/// Removes the output directory of a dump that did not finish.
fn discard_partial_output(database: &str, output_dir: &Path) {
    if !output_dir.exists() {
        return;
    }
    match std::fs::remove_dir_all(output_dir) {
        Ok(()) => info!(database, output = %output_dir.display(), "removed partial dump"),
        Err(e) => warn!(database, output = %output_dir.display(), error = %e, "failed to remove partial dump"),
    }
}

/// Parallel logical dumps through `mydumper`.
pub struct MydumperExecutor {
    binary: PathBuf,
    mysql: MysqlConfig,
    threads: u32,
    chunk_filesize_mb: u32,
    timeout: Duration,
}

impl MydumperExecutor {
    pub fn new(binary: PathBuf, mysql: MysqlConfig, threads: u32, chunk_filesize_mb: u32, timeout: Duration) -> Self {
        Self {
            binary,
            mysql,
            threads,
            chunk_filesize_mb,
            timeout,
        }
    }

    fn command_for(&self, database: &str, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--database")
            .arg(database)
            .arg("--outputdir")
            .arg(output_dir)
            .arg("--threads")
            .arg(self.threads.to_string())
            .arg("--chunk-filesize")
            .arg(self.chunk_filesize_mb.to_string())
            .arg("--routines")
            .arg("--triggers")
            .arg("--events")
            .arg("--verbose")
            .arg("2");
        mydumper_connection_args(&mut cmd, &self.mysql);
        cmd
    }
}

/// Connection flags shared by mydumper and myloader.
pub fn mydumper_connection_args(cmd: &mut Command, mysql: &MysqlConfig) {
    match &mysql.socket {
        Some(socket) => {
            cmd.arg("--socket").arg(socket);
        }
        None => {
            cmd.arg("--host")
                .arg(&mysql.host)
                .arg("--port")
                .arg(mysql.port.to_string());
        }
    }
    cmd.arg("--user").arg(&mysql.username);
    if let Some(password) = &mysql.password {
        cmd.arg("--password").arg(password);
    }
}

/// Connection flags for the stock mysql client tools; the password travels
/// through `MYSQL_PWD` so it stays out of the process list.
pub fn mysql_client_connection_args(cmd: &mut Command, mysql: &MysqlConfig) {
    match &mysql.socket {
        Some(socket) => {
            cmd.arg(format!("--socket={}", socket.display()));
        }
        None => {
            cmd.arg(format!("--host={}", mysql.host))
                .arg(format!("--port={}", mysql.port));
        }
    }
    cmd.arg(format!("--user={}", mysql.username));
    if let Some(password) = &mysql.password {
        cmd.env("MYSQL_PWD", password);
    }
}

#[async_trait]
impl DumpExecutor for MydumperExecutor {
    async fn dump(&self, database: &str, target_dir: &Path, cancel: &CancellationToken) -> Result<PathBuf> {
        let output_dir = prepare_output_dir(database, target_dir)?;
        info!(database, output = %output_dir.display(), "dumping with mydumper");

        let cmd = self.command_for(database, &output_dir);
        if let Err(e) = run_command(cmd, &format!("mydumper {}", database), self.timeout, cancel).await {
            discard_partial_output(database, &output_dir);
            return Err(dump_error(database, e));
        }

        info!(database, output = %output_dir.display(), "mydumper finished");
        Ok(output_dir)
    }
}

/// Single-file dumps through `mysqldump`; used when mydumper is unavailable.
pub struct MysqldumpExecutor {
    binary: PathBuf,
    mysql: MysqlConfig,
    timeout: Duration,
}

impl MysqldumpExecutor {
    pub fn new(binary: PathBuf, mysql: MysqlConfig, timeout: Duration) -> Self {
        Self { binary, mysql, timeout }
    }

    fn command_for(&self, database: &str, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--single-transaction")
            .arg("--quick")
            .arg("--routines")
            .arg("--triggers")
            .arg("--events")
            .arg(format!(
                "--result-file={}",
                output_dir.join(format!("{}.sql", database)).display()
            ));
        mysql_client_connection_args(&mut cmd, &self.mysql);
        cmd.arg(database);
        cmd
    }
}

#[async_trait]
impl DumpExecutor for MysqldumpExecutor {
    async fn dump(&self, database: &str, target_dir: &Path, cancel: &CancellationToken) -> Result<PathBuf> {
        let output_dir = prepare_output_dir(database, target_dir)?;
        std::fs::create_dir_all(&output_dir)?;
        info!(database, output = %output_dir.display(), "dumping with mysqldump");

        let cmd = self.command_for(database, &output_dir);
        if let Err(e) = run_command(cmd, &format!("mysqldump {}", database), self.timeout, cancel).await {
            discard_partial_output(database, &output_dir);
            return Err(dump_error(database, e));
        }

        info!(database, output = %output_dir.display(), "mysqldump finished");
        Ok(output_dir)
    }
}

/// Picks mydumper when configured and installed, otherwise mysqldump.
pub fn dump_executor_from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn DumpExecutor>> {
    let dump = &config.dump;
    if dump.use_mydumper {
        match find_executable("mydumper", dump.mydumper_path.as_deref()) {
            Ok(binary) => {
                info!(binary = %binary.display(), "using mydumper");
                return Ok(Arc::new(MydumperExecutor::new(
                    binary,
                    config.mysql.clone(),
                    dump.threads,
                    dump.chunk_filesize_mb,
                    config.backup.dump_timeout,
                )));
            }
            Err(e) => warn!(error = %e, "mydumper unavailable, falling back to mysqldump"),
        }
    }

    let binary = find_executable("mysqldump", dump.mysqldump_path.as_deref())?;
    info!(binary = %binary.display(), "using mysqldump");
    Ok(Arc::new(MysqldumpExecutor::new(
        binary,
        config.mysql.clone(),
        config.backup.dump_timeout,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::ffi::OsStr;

    fn mysql() -> MysqlConfig {
        MysqlConfig {
            host: "db.internal".to_string(),
            port: 3307,
            username: "backup".to_string(),
            password: Some("s3cret".to_string()),
            socket: None,
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_layout_helpers() {
        let now = Local.with_ymd_and_hms(2024, 3, 1, 2, 5, 9).unwrap();
        assert_eq!(
            month_dir(Path::new("/backups"), "shopdb", now),
            PathBuf::from("/backups/shopdb/2024-03")
        );
        assert_eq!(dump_dir_name("shopdb", now), "shopdb-2024-03-01_02-05-09");
    }

    #[test]
    fn test_mydumper_arguments() {
        let exec = MydumperExecutor::new(PathBuf::from("mydumper"), mysql(), 8, 64, Duration::from_secs(60));
        let args = args(&exec.command_for("shopdb", Path::new("/out/shopdb-x")));

        let joined = args.join(" ");
        assert!(joined.contains("--database shopdb"));
        assert!(joined.contains("--outputdir /out/shopdb-x"));
        assert!(joined.contains("--threads 8"));
        assert!(joined.contains("--host db.internal --port 3307"));
        assert!(joined.contains("--user backup"));
    }

    #[test]
    fn test_mysqldump_password_goes_through_env() {
        let exec = MysqldumpExecutor::new(PathBuf::from("mysqldump"), mysql(), Duration::from_secs(60));
        let cmd = exec.command_for("shopdb", Path::new("/out/shopdb-x"));

        let args = args(&cmd);
        assert!(args.iter().all(|a| !a.contains("s3cret")));
        assert_eq!(args.last().map(String::as_str), Some("shopdb"));
        assert!(args.contains(&"--result-file=/out/shopdb-x/shopdb.sql".to_string()));

        let pwd = cmd
            .as_std()
            .get_envs()
            .find(|(k, _)| *k == OsStr::new("MYSQL_PWD"))
            .and_then(|(_, v)| v);
        assert_eq!(pwd, Some(OsStr::new("s3cret")));
    }

    #[test]
    fn test_socket_replaces_host_and_port() {
        let mut conn = mysql();
        conn.socket = Some(PathBuf::from("/run/mysqld/mysqld.sock"));
        let mut cmd = Command::new("mydumper");
        mydumper_connection_args(&mut cmd, &conn);

        let args = args(&cmd);
        assert!(args.contains(&"--socket".to_string()));
        assert!(!args.contains(&"--host".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_dump_leaves_no_output_directory() {
        let root = tempfile::TempDir::new().unwrap();
        let month = root.path().join("shopdb").join("2024-03");
        let exec = MysqldumpExecutor::new(PathBuf::from("false"), mysql(), Duration::from_secs(10));

        for _ in 0..2 {
            let err = exec.dump("shopdb", &month, &CancellationToken::new()).await.unwrap_err();
            assert!(matches!(err, AppError::Dump { .. }));
        }

        let leftovers: Vec<PathBuf> = std::fs::read_dir(&month)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert!(leftovers.is_empty(), "partial dumps left behind: {:?}", leftovers);
    }
}
