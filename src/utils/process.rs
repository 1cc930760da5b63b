use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{AppError, Result};

/// Runs an external tool to completion under a deadline.
///
/// The child is killed when the deadline passes or `cancel` fires. A non-zero
/// exit status is reported with the captured stdout and stderr.
pub async fn run_command(
    mut command: Command,
    operation: &str,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<Output> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();
    debug!(program = %program, operation, "spawning external command");

    let child = command
        .kill_on_drop(true)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| AppError::Command {
            program: program.clone(),
            status: "not started".to_string(),
            stdout: String::new(),
            stderr: e.to_string(),
        })?;

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(AppError::Cancelled(format!("{} interrupted by shutdown", operation)));
        }
        result = tokio::time::timeout(deadline, child.wait_with_output()) => match result {
            Ok(output) => output?,
            Err(_) => {
                return Err(AppError::Timeout {
                    operation: operation.to_string(),
                    seconds: deadline.as_secs(),
                });
            }
        },
    };

    if !output.status.success() {
        return Err(AppError::Command {
            program,
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_successful_command_captures_stdout() {
        let output = run_command(sh("echo hello"), "echo", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let err = run_command(sh("echo boom >&2; exit 3"), "fail", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AppError::Command { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_kills_slow_command() {
        let err = run_command(sh("sleep 5"), "sleep", Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_command() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = run_command(sh("sleep 5"), "sleep", Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
