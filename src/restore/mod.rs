pub mod db_restore;
pub mod logic;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::metrics::MetricsStore;
use crate::utils::prompt::Confirmer;
use logic::{RestoreOutcome, RestoreRequest};

/// Entry point for the `restore` command.
///
/// `database` is the target. With `use_mapping` it names a `database_list`
/// source instead, and the restore goes to that source's mapped target.
pub async fn run_restore_flow(
    app_config: &AppConfig,
    backup_path: PathBuf,
    database: &str,
    use_mapping: bool,
    confirmer: &dyn Confirmer,
    metrics: Arc<MetricsStore>,
    cancel: CancellationToken,
) -> Result<RestoreOutcome> {
    let target_database = resolve_target(app_config, database, use_mapping);

    let request = RestoreRequest {
        backup_path,
        target_database,
    };
    logic::perform_restore(
        &request,
        |layout| db_restore::restore_executor_for(layout, app_config),
        confirmer,
        metrics,
        &cancel,
    )
    .await
}

fn resolve_target(app_config: &AppConfig, database: &str, use_mapping: bool) -> String {
    let mapped = app_config.restore_target_for(database);
    if mapped == database {
        if use_mapping {
            warn!(database, "no database_list mapping for this database, restoring into it directly");
        }
        return database.to_string();
    }
    if use_mapping {
        warn!(source = database, target = mapped, "restoring into mapped target database");
        mapped.to_string()
    } else {
        info!(database, mapped_target = mapped, "restoring into the named database; pass --use-mapping to use the mapped target");
        database.to_string()
    }
}
