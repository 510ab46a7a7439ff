//! External shell-command hook execution.
//!
//! Adapts `sa-tools`' exec pattern (spawn `sh -c`, decoupled line-oriented
//! reader tasks, `tokio::select!` against a timeout) to the hook wire
//! contract: write the JSON event to stdin, close it, collect stdout/stderr
//! until exit, and parse the final stdout as the hook's result.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::types::{HookInput, RawOutcome};

#[derive(Debug, thiserror::Error)]
pub enum ShellHookError {
    #[error("failed to spawn hook command: {0}")]
    Spawn(String),
    #[error("hook command exited with status {0}: {1}")]
    NonZeroExit(i32, String),
    #[error("hook command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("hook command produced invalid JSON: {0}")]
    InvalidJson(String),
}

/// Whether stdout/stderr are streamed line-by-line as they arrive (for
/// `hook_progress` events) or simply collected until the process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Plain,
    Progress,
}

/// One line of progress output, handed to the caller's sink as it arrives
/// so the dispatcher can turn it into a `hook_progress` event.
pub struct ProgressLine {
    pub is_stderr: bool,
    pub line: String,
}

/// Run one shell-command hook to completion (or timeout) and return its raw
/// outcome. `on_progress` is invoked per line only in `OutputMode::Progress`.
pub async fn run_shell_hook(
    command: &str,
    input: &HookInput,
    timeout: Option<Duration>,
    mode: OutputMode,
    on_progress: impl FnMut(ProgressLine) + Send + 'static,
) -> Result<RawOutcome, ShellHookError> {
    let payload = serde_json::to_vec(input)
        .map_err(|e| ShellHookError::InvalidJson(format!("failed to encode hook input: {e}")))?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| ShellHookError::Spawn(e.to_string()))?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&payload).await;
        let _ = stdin.flush().await;
        drop(stdin);
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Progress lines, from both streams, forwarded to the caller's sink by
    // a single task so `on_progress` only ever runs on one thread.
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressLine>();
    let forward_task = tokio::spawn(async move {
        let mut sink = on_progress;
        while let Some(line) = progress_rx.recv().await {
            sink(line);
        }
    });

    let stdout_tx = progress_tx.clone();
    let stdout_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(stdout) = stdout {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if mode == OutputMode::Progress {
                    let _ = stdout_tx.send(ProgressLine {
                        is_stderr: false,
                        line: line.clone(),
                    });
                }
                buf.push_str(&line);
                buf.push('\n');
            }
        }
        buf
    });

    let stderr_tx = progress_tx.clone();
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(stderr) = stderr {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if mode == OutputMode::Progress {
                    let _ = stderr_tx.send(ProgressLine {
                        is_stderr: true,
                        line: line.clone(),
                    });
                }
                buf.push_str(&line);
                buf.push('\n');
            }
        }
        buf
    });
    drop(progress_tx);

    let status = match timeout {
        Some(dur) => tokio::select! {
            status = child.wait() => status,
            _ = tokio::time::sleep(dur) => {
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                forward_task.abort();
                return Err(ShellHookError::TimedOut(dur));
            }
        },
        None => child.wait().await,
    };

    let stdout_buf = stdout_task.await.unwrap_or_default();
    let stderr_buf = stderr_task.await.unwrap_or_default();
    let _ = forward_task.await;

    let status = status.map_err(|e| ShellHookError::Spawn(e.to_string()))?;
    if !status.success() {
        let code = status.code().unwrap_or(-1);
        return Err(ShellHookError::NonZeroExit(code, stderr_buf));
    }

    let trimmed = stdout_buf.trim();
    if trimmed.is_empty() {
        return Ok(RawOutcome::Sync(Default::default()));
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| ShellHookError::InvalidJson(format!("{e}: {trimmed}")))?;
    Ok(RawOutcome::from_value(&value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_stdout_is_a_noop_sync_result() {
        let input = HookInput::new("stop", "s1");
        let outcome = run_shell_hook("true", &input, None, OutputMode::Plain, |_| {})
            .await
            .unwrap();
        match outcome {
            RawOutcome::Sync(sync) => assert!(sync.continue_.is_none()),
            RawOutcome::Async { .. } => panic!("expected sync"),
        }
    }

    #[tokio::test]
    async fn parses_sync_json_from_stdout() {
        let input = HookInput::new("pre_tool_use", "s1");
        let outcome = run_shell_hook(
            r#"echo '{"decision":"block","reason":"no"}'"#,
            &input,
            None,
            OutputMode::Plain,
            |_| {},
        )
        .await
        .unwrap();
        match outcome {
            RawOutcome::Sync(sync) => {
                assert_eq!(sync.decision.as_deref(), Some("block"));
                assert_eq!(sync.reason.as_deref(), Some("no"));
            }
            RawOutcome::Async { .. } => panic!("expected sync"),
        }
    }

    #[tokio::test]
    async fn detects_async_marker_in_stdout() {
        let input = HookInput::new("pre_tool_use", "s1");
        let outcome = run_shell_hook(
            r#"echo '{"async":true,"asyncTimeout":2}'"#,
            &input,
            None,
            OutputMode::Plain,
            |_| {},
        )
        .await
        .unwrap();
        assert!(matches!(
            outcome,
            RawOutcome::Async {
                timeout_sec: Some(2)
            }
        ));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_error() {
        let input = HookInput::new("pre_tool_use", "s1");
        let err = run_shell_hook(
            "echo oops 1>&2; exit 1",
            &input,
            None,
            OutputMode::Plain,
            |_| {},
        )
        .await
        .unwrap_err();
        match err {
            ShellHookError::NonZeroExit(code, stderr) => {
                assert_eq!(code, 1);
                assert!(stderr.contains("oops"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_a_hanging_command() {
        let input = HookInput::new("pre_tool_use", "s1");
        let err = run_shell_hook(
            "sleep 5",
            &input,
            Some(Duration::from_millis(50)),
            OutputMode::Plain,
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ShellHookError::TimedOut(_)));
    }

    #[tokio::test]
    async fn progress_mode_streams_lines_as_they_arrive() {
        let input = HookInput::new("pre_tool_use", "s1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_shell_hook(
            "echo one; echo two",
            &input,
            None,
            OutputMode::Progress,
            move |line| {
                let _ = tx.send(line.line);
            },
        )
        .await
        .unwrap();
        let mut seen = Vec::new();
        while let Ok(line) = rx.try_recv() {
            seen.push(line);
        }
        assert_eq!(seen, vec!["one", "two"]);
    }
}
