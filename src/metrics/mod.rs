pub mod exporter;
pub mod store;

pub use store::MetricsStore;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;

/// The store every stage writes to; a no-op store when metrics are disabled.
pub fn store_from_config(app_config: &AppConfig) -> Arc<MetricsStore> {
    if app_config.metrics.enabled {
        Arc::new(MetricsStore::new(app_config.metrics.file_path.clone()))
    } else {
        Arc::new(MetricsStore::disabled())
    }
}

/// Entry point for the `exporter` command. CLI flags win over the config file.
pub async fn run_exporter_flow(
    app_config: &AppConfig,
    port: Option<u16>,
    metrics_file: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<()> {
    let path = metrics_file.unwrap_or_else(|| app_config.metrics.file_path.clone());
    let port = port.unwrap_or(app_config.metrics.port);
    exporter::run_exporter(MetricsStore::new(path), port, cancel).await
}
