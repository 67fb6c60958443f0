// Helpers for process-backed fetchers

use std::ffi::OsStr;
use std::io;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::debug;

use super::bridge::EventEmitter;
use super::errors::FetchError;
use super::models::Level;

/// Timeout for `--version` style liveness checks
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

fn spawn_error(program: &str, e: io::Error) -> FetchError {
    if e.kind() == io::ErrorKind::NotFound {
        FetchError::ToolNotFound(format!("{}: {}", program, e))
    } else {
        FetchError::Execution(format!("Failed to start {}: {}", program, e))
    }
}

/// Run command with timeout, capturing all output
pub async fn run_output_with_timeout<I, S>(
    program: &str,
    args: I,
    limit: Duration,
) -> Result<Output, FetchError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = TokioCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| FetchError::Execution(format!("Failed to capture stdout from {}", program)))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| FetchError::Execution(format!("Failed to capture stderr from {}", program)))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });

    match timeout(limit, child.wait()).await {
        Ok(status) => {
            let status = status?;
            let stdout = stdout_task
                .await
                .map_err(|e| FetchError::Execution(format!("stdout task failed: {}", e)))??;
            let stderr = stderr_task
                .await
                .map_err(|e| FetchError::Execution(format!("stderr task failed: {}", e)))??;
            Ok(Output { status, stdout, stderr })
        }
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(FetchError::Timeout(format!(
                "{} did not finish within {:?}",
                program,
                limit
            )))
        }
    }
}

/// True if `program <arg>` exits successfully within `PROBE_TIMEOUT`
pub async fn probe(program: &str, arg: &str) -> bool {
    match run_output_with_timeout(program, [arg], PROBE_TIMEOUT).await {
        Ok(out) => out.status.success(),
        Err(e) => {
            debug!(program, error = %e, "liveness probe failed");
            false
        }
    }
}

/// Run a long-lived process, forwarding its output lines as log events.
///
/// Each stdout and stderr line goes through `classify`; lines it maps to
/// `Some((level, message))` are emitted. A nonzero exit becomes
/// `ProcessFailed`, carrying the most useful stderr lines. The child is killed
/// if this future is dropped.
pub async fn stream_process<I, S, F>(
    program: &str,
    args: I,
    emitter: &EventEmitter,
    mut classify: F,
) -> Result<(), FetchError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
    F: FnMut(&str) -> Option<(Level, String)>,
{
    let mut child = TokioCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| FetchError::Execution(format!("Failed to capture stdout from {}", program)))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| FetchError::Execution(format!("Failed to capture stderr from {}", program)))?;

    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut stderr_seen = Vec::new();
    let (mut out_done, mut err_done) = (false, false);

    while !(out_done && err_done) {
        let line = tokio::select! {
            line = out_lines.next_line(), if !out_done => {
                let line = line?;
                out_done = line.is_none();
                line
            }
            line = err_lines.next_line(), if !err_done => {
                let line = line?;
                err_done = line.is_none();
                if let Some(l) = &line {
                    stderr_seen.push(l.clone());
                }
                line
            }
        };

        if let Some((level, message)) = line.as_deref().and_then(&mut classify) {
            emitter.log(level, message).await;
        }
    }

    let status = child.wait().await?;
    if status.success() {
        return Ok(());
    }

    Err(FetchError::ProcessFailed {
        program: program.to_string(),
        code: status.code().unwrap_or(1),
        detail: summarize_stderr(&stderr_seen),
    })
}

/// Short reason for a failed run: the ERROR lines, else the last non-empty line
pub fn summarize_stderr(lines: &[String]) -> String {
    let important: Vec<&str> = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| l.starts_with("ERROR:") || l.contains("HTTP Error") || l.contains("Forbidden"))
        .take(2)
        .collect();

    if !important.is_empty() {
        return important.join(" | ");
    }

    lines
        .iter()
        .rev()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .map(|l| l.chars().take(200).collect())
        .unwrap_or_default()
}
