//! TenangDB
//!
//! Scheduled MySQL backups: dump, compress, upload, prune, and report metrics.

// tenangdb/src/main.rs
mod backup;
mod cleanup;
mod config;
mod errors;
mod metrics;
mod restore;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use backup::logic::BackupOptions;
use cleanup::CleanupOptions;
use config::AppConfig;
use utils::prompt::{AutoConfirm, Confirmer, StdinConfirmer};
use utils::shutdown::{BACKUP_GRACE_PERIOD, EXPORTER_GRACE_PERIOD, Supervised, shutdown_signal, supervise};

#[derive(Parser, Debug)]
#[command(name = "tenangdb", version, about = "MySQL backups with retention and metrics")]
struct Cli {
    /// Path to config.json (default: $TENANGDB_CONFIG, then ./config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (overrides logging.level)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dump, compress and upload the configured databases
    Backup {
        /// Show what would be backed up without doing it
        #[arg(long)]
        dry_run: bool,
        /// Comma-separated databases replacing the configured list
        #[arg(long, value_delimiter = ',')]
        databases: Vec<String>,
        /// Ignore the minimum interval between backups
        #[arg(long)]
        force: bool,
        /// Never ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },
    /// Remove local backups older than the retention age
    Cleanup {
        #[arg(long)]
        dry_run: bool,
        /// Run outside the weekend window and even when cleanup is disabled
        #[arg(long)]
        force: bool,
        #[arg(long, value_delimiter = ',')]
        databases: Vec<String>,
        #[arg(long, short)]
        yes: bool,
    },
    /// Load a backup archive, mydumper directory or SQL file into a database
    Restore {
        #[arg(long)]
        backup_path: PathBuf,
        /// Target database
        #[arg(long)]
        database: String,
        /// Treat --database as a database_list source and restore into its mapped target
        #[arg(long)]
        use_mapping: bool,
        #[arg(long, short)]
        yes: bool,
    },
    /// Serve the metrics file in Prometheus format
    Exporter {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },
}

fn confirmer_for(assume_yes: bool) -> Arc<dyn Confirmer> {
    if assume_yes {
        Arc::new(AutoConfirm(true))
    } else {
        Arc::new(StdinConfirmer)
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let config_path = AppConfig::resolve_path(cli.config.as_deref());
    AppConfig::load_from_json(&config_path)
        .with_context(|| format!("Failed to load application configuration from {}", config_path.display()))
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut app_config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            utils::logger::init_logger(cli.log_level.as_deref().unwrap_or("info"));
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };
    utils::logger::init_logger(cli.log_level.as_deref().unwrap_or(&app_config.log_level));

    let token = CancellationToken::new();
    let outcome = match cli.command {
        Commands::Backup {
            dry_run,
            databases,
            force,
            yes,
        } => {
            if let Err(e) = app_config.override_databases(&databases) {
                error!("{:#}", e);
                return ExitCode::FAILURE;
            }
            app_config.backup.skip_confirmation |= yes;
            let metrics = metrics::store_from_config(&app_config);
            let confirmer = confirmer_for(yes);
            let cancel = token.clone();
            let task = async move {
                info!("starting backup");
                let options = BackupOptions { dry_run, force };
                backup::run_backup_flow(&app_config, options, confirmer, metrics, cancel)
                    .await
                    .context("Backup process failed")
                    .map(|_| ())
            };
            supervise(task, shutdown_signal(), token, BACKUP_GRACE_PERIOD).await
        }
        Commands::Cleanup {
            dry_run,
            force,
            databases,
            yes,
        } => {
            if !databases.is_empty() {
                app_config.cleanup.policy.databases = databases;
            }
            let metrics = metrics::store_from_config(&app_config);
            let confirmer = confirmer_for(yes);
            let cancel = token.clone();
            let task = async move {
                info!("starting cleanup");
                let options = CleanupOptions { dry_run, force };
                cleanup::run_cleanup_flow(&app_config, options, confirmer.as_ref(), metrics, cancel)
                    .await
                    .context("Cleanup process failed")
                    .map(|_| ())
            };
            supervise(task, shutdown_signal(), token, BACKUP_GRACE_PERIOD).await
        }
        Commands::Restore {
            backup_path,
            database,
            use_mapping,
            yes,
        } => {
            let metrics = metrics::store_from_config(&app_config);
            let confirmer = confirmer_for(yes);
            let cancel = token.clone();
            let task = async move {
                info!("starting restore");
                restore::run_restore_flow(&app_config, backup_path, &database, use_mapping, confirmer.as_ref(), metrics, cancel)
                    .await
                    .context("Restore process failed")
                    .map(|_| ())
            };
            supervise(task, shutdown_signal(), token, BACKUP_GRACE_PERIOD).await
        }
        Commands::Exporter { port, metrics_file } => {
            let cancel = token.clone();
            let task = async move {
                metrics::run_exporter_flow(&app_config, port, metrics_file, cancel)
                    .await
                    .context("Metrics exporter failed")
            };
            supervise(task, shutdown_signal(), token, EXPORTER_GRACE_PERIOD).await
        }
    };

    match outcome {
        Supervised::Finished(Ok(())) => {
            info!("operation completed successfully");
            ExitCode::SUCCESS
        }
        Supervised::Finished(Err(e)) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
        Supervised::Abandoned => std::process::exit(1),
    }
}
