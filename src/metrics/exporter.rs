// tenangdb/src/metrics/exporter.rs
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::store::{MetricsDocument, MetricsStore, OperationMetrics};

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub struct ExporterState {
    store: MetricsStore,
    rendered: RwLock<Option<String>>,
}

impl ExporterState {
    pub fn new(store: MetricsStore) -> Self {
        Self {
            store,
            rendered: RwLock::new(None),
        }
    }

    /// Re-reads the metrics file; keeps the previous rendering when it cannot be loaded.
    pub async fn refresh(&self) {
        match self.store.load() {
            Ok(doc) => *self.rendered.write().await = Some(render_prometheus(&doc)),
            Err(e) => warn!(error = %e, "failed to refresh metrics"),
        }
    }
}

pub fn router(state: Arc<ExporterState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<Arc<ExporterState>>) -> Response {
    match state.rendered.read().await.clone() {
        Some(body) => (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not loaded yet\n").into_response(),
    }
}

async fn health_handler(State(state): State<Arc<ExporterState>>) -> Response {
    match state.store.load() {
        Ok(_) => (StatusCode::OK, "ok\n").into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("{}\n", e)).into_response(),
    }
}

async fn ready_handler() -> StatusCode {
    StatusCode::OK
}

/// Serves `/metrics`, `/health` and `/ready` until `cancel` fires.
pub async fn run_exporter(store: MetricsStore, port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
    let state = Arc::new(ExporterState::new(store));
    state.refresh().await;

    let refresher = {
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => state.refresh().await,
                }
            }
        })
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics exporter listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    cancel.cancel();
    let _ = refresher.await;
    info!("metrics exporter stopped");
    Ok(())
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn help_and_type(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

fn operation_family(out: &mut String, stage: &str, entries: &std::collections::BTreeMap<String, OperationMetrics>) {
    if entries.is_empty() {
        return;
    }

    type Field = fn(&OperationMetrics) -> f64;
    let families: [(&str, &str, &str, Field); 6] = [
        ("success_total", "counter", "Successful operations", |m| m.success_count as f64),
        ("failure_total", "counter", "Failed operations", |m| m.failure_count as f64),
        ("last_size_bytes", "gauge", "Size of the last artifact in bytes", |m| m.size_bytes as f64),
        ("last_duration_seconds", "gauge", "Duration of the last operation", |m| m.duration_seconds),
        ("last_success", "gauge", "1 when the last operation succeeded", |m| {
            if m.succeeded() { 1.0 } else { 0.0 }
        }),
        ("last_timestamp_seconds", "gauge", "Unix time of the last operation", |m| {
            m.last_time.map(|t| t.timestamp() as f64).unwrap_or(0.0)
        }),
    ];

    for (suffix, kind, help, field) in families {
        let name = format!("tenangdb_{}_{}", stage, suffix);
        help_and_type(out, &name, kind, &format!("{} ({})", help, stage));
        for (database, metrics) in entries {
            let _ = writeln!(out, "{}{{database=\"{}\"}} {}", name, escape_label(database), field(metrics));
        }
    }
}

/// Prometheus text exposition of a metrics document.
pub fn render_prometheus(doc: &MetricsDocument) -> String {
    let mut out = String::new();
    let system = &doc.system;

    help_and_type(&mut out, "tenangdb_total_databases", "gauge", "Databases selected in the last run");
    let _ = writeln!(out, "tenangdb_total_databases {}", system.total_databases);
    help_and_type(&mut out, "tenangdb_run_active", "gauge", "1 while a backup run is in progress");
    let _ = writeln!(out, "tenangdb_run_active {}", u8::from(system.run_active));
    help_and_type(&mut out, "tenangdb_healthy", "gauge", "1 when the last run had no failed jobs");
    let _ = writeln!(out, "tenangdb_healthy {}", u8::from(system.healthy));
    help_and_type(&mut out, "tenangdb_last_run_timestamp_seconds", "gauge", "Unix time the last run finished");
    let _ = writeln!(
        out,
        "tenangdb_last_run_timestamp_seconds {}",
        system.last_run_time.map(|t| t.timestamp()).unwrap_or(0)
    );

    operation_family(&mut out, "backup", &doc.backups);
    operation_family(&mut out, "upload", &doc.uploads);
    operation_family(&mut out, "restore", &doc.restores);

    let cleanup = &doc.cleanup;
    help_and_type(&mut out, "tenangdb_cleanup_files_removed_total", "counter", "Artifacts removed by cleanup");
    let _ = writeln!(out, "tenangdb_cleanup_files_removed_total {}", cleanup.files_removed);
    help_and_type(&mut out, "tenangdb_cleanup_bytes_freed_total", "counter", "Bytes freed by cleanup");
    let _ = writeln!(out, "tenangdb_cleanup_bytes_freed_total {}", cleanup.bytes_freed);
    help_and_type(&mut out, "tenangdb_cleanup_duration_seconds", "gauge", "Duration of the last cleanup");
    let _ = writeln!(out, "tenangdb_cleanup_duration_seconds {}", cleanup.duration_seconds);
    help_and_type(&mut out, "tenangdb_cleanup_success_total", "counter", "Successful cleanup runs");
    let _ = writeln!(out, "tenangdb_cleanup_success_total {}", cleanup.success_count);
    help_and_type(&mut out, "tenangdb_cleanup_failure_total", "counter", "Failed cleanup runs");
    let _ = writeln!(out, "tenangdb_cleanup_failure_total {}", cleanup.failure_count);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn populated_store(dir: &TempDir) -> MetricsStore {
        let store = MetricsStore::new(dir.path().join("metrics.json"));
        store.update_system_metrics(2, false, true).unwrap();
        store.update_backup_metrics("shopdb", true, 2048, Duration::from_secs(4)).unwrap();
        store.update_backup_metrics("billing", false, 0, Duration::from_secs(1)).unwrap();
        store
    }

    #[test]
    fn test_render_prometheus() {
        let dir = TempDir::new().unwrap();
        let doc = populated_store(&dir).load().unwrap();
        let text = render_prometheus(&doc);

        assert!(text.contains("# TYPE tenangdb_backup_success_total counter"));
        assert!(text.contains("tenangdb_backup_success_total{database=\"shopdb\"} 1"));
        assert!(text.contains("tenangdb_backup_failure_total{database=\"billing\"} 1"));
        assert!(text.contains("tenangdb_backup_last_size_bytes{database=\"shopdb\"} 2048"));
        assert!(text.contains("tenangdb_backup_last_success{database=\"billing\"} 0"));
        assert!(text.contains("tenangdb_total_databases 2"));
        assert!(text.contains("tenangdb_healthy 1"));
        assert!(!text.contains("tenangdb_upload_success_total"));
    }

    #[test]
    fn test_cleanup_totals_are_counters() {
        let dir = TempDir::new().unwrap();
        let store = populated_store(&dir);
        store.update_cleanup_metrics(true, 3, 1000, Duration::from_secs(1)).unwrap();
        store.update_cleanup_metrics(true, 2, 500, Duration::from_secs(1)).unwrap();
        let text = render_prometheus(&store.load().unwrap());

        assert!(text.contains("# TYPE tenangdb_cleanup_files_removed_total counter"));
        assert!(text.contains("tenangdb_cleanup_files_removed_total 5"));
        assert!(text.contains("# TYPE tenangdb_cleanup_bytes_freed_total counter"));
        assert!(text.contains("tenangdb_cleanup_bytes_freed_total 1500"));
    }

    #[test]
    fn test_label_escaping() {
        assert_eq!(escape_label("we\"ird\\db"), "we\\\"ird\\\\db");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_refreshed_text() {
        let dir = TempDir::new().unwrap();
        let state = Arc::new(ExporterState::new(populated_store(&dir)));

        let before = metrics_handler(State(state.clone())).await;
        assert_eq!(before.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.refresh().await;
        let after = metrics_handler(State(state.clone())).await;
        assert_eq!(after.status(), StatusCode::OK);
        assert!(body_text(after).await.contains("tenangdb_backup_success_total"));
    }

    #[tokio::test]
    async fn test_health_reflects_file_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        let state = Arc::new(ExporterState::new(MetricsStore::new(path.clone())));

        assert_eq!(health_handler(State(state.clone())).await.status(), StatusCode::OK);

        std::fs::write(&path, b"{broken").unwrap();
        assert_eq!(
            health_handler(State(state.clone())).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ready_handler().await, StatusCode::OK);
    }
}
