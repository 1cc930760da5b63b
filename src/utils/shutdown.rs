use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

pub const BACKUP_GRACE_PERIOD: Duration = Duration::from_secs(30);
pub const EXPORTER_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// How a supervised task ended.
pub enum Supervised<T> {
    Finished(anyhow::Result<T>),
    /// Still running when the grace period ran out. The caller must exit.
    Abandoned,
}

/// Resolves on SIGINT or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Runs `task` until it finishes. If `signal` resolves first, `token` is
/// cancelled and the task gets `grace` to wind down.
pub async fn supervise<T, F, S>(
    task: F,
    signal: S,
    token: CancellationToken,
    grace: Duration,
) -> Supervised<T>
where
    T: Send + 'static,
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    S: Future<Output = ()>,
{
    let mut handle = tokio::spawn(task);

    tokio::select! {
        joined = &mut handle => return Supervised::Finished(flatten(joined)),
        _ = signal => {
            warn!(grace_secs = grace.as_secs(), "shutdown requested, waiting for in-flight work");
            token.cancel();
        }
    }

    match tokio::time::timeout(grace, handle).await {
        Ok(joined) => Supervised::Finished(flatten(joined)),
        Err(_) => {
            error!(grace_secs = grace.as_secs(), "work did not stop within the grace period");
            Supervised::Abandoned
        }
    }
}

fn flatten<T>(joined: Result<anyhow::Result<T>, JoinError>) -> anyhow::Result<T> {
    joined.context("background task aborted")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finished_task_without_signal() {
        let token = CancellationToken::new();
        let outcome = supervise(
            async { Ok(7) },
            std::future::pending::<()>(),
            token.clone(),
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(outcome, Supervised::Finished(Ok(7))));
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_cancels_token_and_waits_for_task() {
        let token = CancellationToken::new();
        let observed = token.clone();
        let task = async move {
            observed.cancelled().await;
            Ok("stopped")
        };

        let outcome = supervise(
            task,
            tokio::time::sleep(Duration::from_millis(20)),
            token.clone(),
            Duration::from_secs(1),
        )
        .await;

        assert!(token.is_cancelled());
        assert!(matches!(outcome, Supervised::Finished(Ok("stopped"))));
    }

    #[tokio::test]
    async fn test_task_ignoring_cancellation_is_abandoned() {
        let token = CancellationToken::new();
        let task = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        };

        let outcome = supervise(
            task,
            tokio::time::sleep(Duration::from_millis(10)),
            token,
            Duration::from_millis(50),
        )
        .await;

        assert!(matches!(outcome, Supervised::Abandoned));
    }
}
