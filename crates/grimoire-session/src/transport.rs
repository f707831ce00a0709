// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Assistant process transport
//!
//! One user turn is one process invocation: the prompt is written to stdin as
//! a single structured user envelope, stdin is closed, and stdout is read line
//! by line until the process exits. Context continuity comes from resuming the
//! session id, not from keeping a process alive.

use crate::config::AssistantConfig;
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Bytes of stderr kept for failure reports
pub const STDERR_TAIL_LIMIT: usize = 64 * 1024;

/// Everything needed to run one turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub prompt: String,
    /// Session to resume; `None` starts a new lineage
    pub resume_session_id: Option<String>,
    pub working_directory: PathBuf,
    /// Per-lineage override of the assistant config directory
    pub config_dir: Option<PathBuf>,
}

/// How the assistant process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnExit {
    pub program: String,
    /// Exit code; `None` when the process was killed by a signal
    pub code: Option<i32>,
    /// Tail of the error channel
    pub stderr: String,
}

impl TurnExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running turn.
///
/// `lines` yields stdout lines as they arrive. `completion` resolves once the
/// process has exited. Dropping the channel kills the process.
pub struct TurnChannel {
    pub lines: BoxStream<'static, io::Result<String>>,
    pub completion: BoxFuture<'static, SessionResult<TurnExit>>,
}

impl std::fmt::Debug for TurnChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnChannel").finish_non_exhaustive()
    }
}

/// Seam between the orchestrator and whatever runs a turn
#[async_trait]
pub trait TurnTransport: Send + Sync {
    /// Start a turn. Fails only when nothing could be started at all.
    async fn spawn_turn(&self, request: TurnRequest) -> SessionResult<TurnChannel>;
}

/// Runs each turn as a fresh assistant process
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    config: AssistantConfig,
}

impl ProcessTransport {
    pub fn new(config: AssistantConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    pub fn turn_args(&self, resume_session_id: Option<&str>) -> Vec<String> {
        let mut args = self.config.base_args();
        if let Some(session_id) = resume_session_id {
            args.push("--resume".to_string());
            args.push(session_id.to_string());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl TurnTransport for ProcessTransport {
    async fn spawn_turn(&self, request: TurnRequest) -> SessionResult<TurnChannel> {
        let binary = resolve_binary(&self.config.binary)?;
        let args = self.turn_args(request.resume_session_id.as_deref());

        let mut cmd = Command::new(&binary);
        cmd.args(&args).current_dir(&request.working_directory);
        self.config.apply_env(&mut cmd, request.config_dir.as_deref());

        info!(
            binary = %binary.display(),
            resume = request.resume_session_id.as_deref().unwrap_or("-"),
            cwd = %request.working_directory.display(),
            "Starting assistant turn"
        );

        let envelope = user_envelope(&request.prompt, request.resume_session_id.as_deref());
        spawn_with_input(binary.display().to_string(), cmd, vec![envelope.to_string()]).await
    }
}

/// Structured user message written to the assistant's stdin
pub fn user_envelope(prompt: &str, session_id: Option<&str>) -> serde_json::Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{"type": "text", "text": prompt}],
        },
        "parent_tool_use_id": null,
        "session_id": session_id.unwrap_or_default(),
    })
}

/// Find the assistant binary: explicit paths are checked directly, bare names
/// are searched on PATH.
pub(crate) fn resolve_binary(binary: &Path) -> SessionResult<PathBuf> {
    if binary.is_absolute() || binary.components().count() > 1 {
        if !binary.exists() {
            return Err(SessionError::process_launch(
                binary.display().to_string(),
                "binary not found",
            ));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = std::fs::metadata(binary).map_err(|e| {
                SessionError::process_launch(
                    binary.display().to_string(),
                    format!("unable to read binary metadata: {e}"),
                )
            })?;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(SessionError::process_launch(
                    binary.display().to_string(),
                    "binary is not executable",
                ));
            }
        }

        return Ok(binary.to_path_buf());
    }

    which::which(binary).map_err(|_| {
        SessionError::process_launch(binary.display().to_string(), "binary not found in PATH")
    })
}

/// Spawn `cmd` with piped stdio, feed `input` as newline-terminated lines and
/// close stdin.
pub(crate) async fn spawn_with_input(
    program: String,
    mut cmd: Command,
    input: Vec<String>,
) -> SessionResult<TurnChannel> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SessionError::process_launch(&program, "binary not found"),
        _ => SessionError::process_launch(&program, e.to_string()),
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SessionError::process_launch(&program, "stdout was not captured"))?;

    let stderr_tail = child.stderr.take().map(|stderr| tokio::spawn(drain_tail(stderr)));

    if let Some(mut stdin) = child.stdin.take() {
        write_input(&mut stdin, input).await;
        // Dropping stdin signals end of input before any output is read
        drop(stdin);
    }

    let completion_program = program;
    let completion = async move {
        let status = child.wait().await?;
        let stderr = match stderr_tail {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!("stderr reader task failed: {}", e);
                String::new()
            }),
            None => String::new(),
        };
        debug!(program = %completion_program, code = ?status.code(), "Assistant process exited");
        Ok(TurnExit {
            program: completion_program,
            code: status.code(),
            stderr,
        })
    }
    .boxed();

    Ok(TurnChannel {
        lines: line_stream(stdout),
        completion,
    })
}

async fn write_input(stdin: &mut ChildStdin, input: Vec<String>) {
    for line in input {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        if let Err(e) = stdin.write_all(&bytes).await {
            // A process that exits before reading its input reports that
            // through its exit status
            debug!("Assistant stdin closed early: {}", e);
            return;
        }
    }
    if let Err(e) = stdin.shutdown().await {
        debug!("Failed to close assistant stdin: {}", e);
    }
}

fn line_stream(stdout: ChildStdout) -> BoxStream<'static, io::Result<String>> {
    let lines = BufReader::new(stdout).lines();
    // A read error ends the stream after it is reported
    stream::unfold(Some(lines), |state| async move {
        let mut lines = state?;
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), Some(lines))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

async fn drain_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_LIMIT {
                    let excess = tail.len() - STDERR_TAIL_LIMIT;
                    tail.drain(..excess);
                }
            }
            Err(e) => {
                debug!("Stopped reading assistant stderr: {}", e);
                break;
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_args_resume_and_extra() {
        let transport = ProcessTransport::new(AssistantConfig::default().extra_arg("--debug"));
        let args = transport.turn_args(Some("sess-1"));
        let resume_at = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume_at + 1], "sess-1");
        assert_eq!(args.last().unwrap(), "--debug");

        let fresh = transport.turn_args(None);
        assert!(!fresh.contains(&"--resume".to_string()));
    }

    #[test]
    fn test_user_envelope_shape() {
        let envelope = user_envelope("hello", Some("s1"));
        assert_eq!(envelope["type"], "user");
        assert_eq!(envelope["message"]["role"], "user");
        assert_eq!(envelope["message"]["content"][0]["text"], "hello");
        assert_eq!(envelope["session_id"], "s1");

        let fresh = user_envelope("hi", None);
        assert_eq!(fresh["session_id"], "");
    }

    #[test]
    fn test_resolve_missing_explicit_binary() {
        let err = resolve_binary(Path::new("/definitely/not/here/claude")).unwrap_err();
        assert!(matches!(err, SessionError::ProcessLaunch { .. }));
    }

    #[test]
    fn test_resolve_missing_path_binary() {
        let err = resolve_binary(Path::new("grimoire-no-such-assistant-binary")).unwrap_err();
        assert!(err.to_string().contains("not found in PATH"));
    }

    #[tokio::test]
    async fn test_drain_tail_keeps_last_bytes() {
        let mut data = vec![b'a'; STDERR_TAIL_LIMIT];
        data.extend_from_slice(b"the end");
        let tail = drain_tail(&data[..]).await;
        assert_eq!(tail.len(), STDERR_TAIL_LIMIT);
        assert!(tail.ends_with("the end"));
    }
}
