//! Completion service abstraction.
//!
//! The [`CompletionService`] trait decouples the spawner from the text
//! completion backend. The process-backed implementation pipes the
//! transcript to a configured command; tests use scripted services that
//! return predetermined replies without spawning processes.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::core::types::{Message, SessionId};

/// One completion call for a session transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    pub session: SessionId,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
    #[error("completion command exited with status {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },
    #[error("completion exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },
}

impl CompletionError {
    /// Whether an automatic retry may help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CompletionError::OutputTooLarge { .. })
    }
}

/// External text-completion backend.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError>;
}

/// Completion service that runs a command per call.
///
/// The transcript is written to stdin as JSON; stdout is the completion.
#[derive(Debug, Clone)]
pub struct CommandCompletionService {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandCompletionService {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }
}

#[async_trait]
impl CompletionService for CommandCompletionService {
    #[instrument(skip_all, fields(session = %request.session, program = ?self.command.first()))]
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| CompletionError::Transport("completion command is empty".to_string()))?;
        let payload = serde_json::to_vec(&request)
            .map_err(|err| CompletionError::Transport(format!("serialize transcript: {err}")))?;

        debug!(bytes = payload.len(), "spawning completion command");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| CompletionError::Transport(format!("spawn {program}: {err}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CompletionError::Transport("stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CompletionError::Transport("stdout was not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CompletionError::Transport("stderr was not piped".to_string()))?;

        let writer = async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        };
        let limit = self.output_limit_bytes;
        let (written, stdout, stderr) = tokio::join!(
            writer,
            read_stream_limited(stdout, limit),
            read_stream_limited(stderr, limit)
        );
        written.map_err(|err| CompletionError::Transport(format!("write stdin: {err}")))?;
        let (stdout, stdout_truncated) =
            stdout.map_err(|err| CompletionError::Transport(format!("read stdout: {err}")))?;
        let (stderr, _) =
            stderr.map_err(|err| CompletionError::Transport(format!("read stderr: {err}")))?;

        let status = child
            .wait()
            .await
            .map_err(|err| CompletionError::Transport(format!("wait: {err}")))?;
        if !status.success() {
            warn!(exit_code = ?status.code(), "completion command failed");
            return Err(CompletionError::Failed {
                status: status.code(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        if stdout_truncated > 0 {
            warn!(stdout_truncated, "completion output exceeded limit");
            return Err(CompletionError::OutputTooLarge { limit });
        }

        debug!(bytes = stdout.len(), "completion command finished");
        Ok(Completion {
            content: String::from_utf8_lossy(&stdout).into_owned(),
        })
    }
}

/// Read a stream to the end, keeping at most `limit` bytes.
///
/// Returns the kept bytes and how many were discarded.
async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> std::io::Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut discarded = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        let take = room.min(n);
        kept.extend_from_slice(&buf[..take]);
        discarded += n - take;
    }
    Ok((kept, discarded))
}
