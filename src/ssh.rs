//! Remote command execution over the system `ssh` client.

use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::models::server::Server;

/// Per-stream cap on captured output.
const MAX_STREAM_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code, or -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for remote command: {0}")]
    Wait(#[from] std::io::Error),

    #[error("failed to capture {0}")]
    Pipe(&'static str),
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run the server's configured command and collect its result.
    async fn execute(&self, server: &Server) -> Result<CommandOutput, ExecError>;
}

#[derive(Debug, Clone)]
pub struct SshExecutor {
    binary: String,
    identity: Option<String>,
    connect_timeout_secs: u64,
}

impl SshExecutor {
    pub fn new(binary: impl Into<String>, identity: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            identity,
            connect_timeout_secs: 10,
        }
    }

    pub fn args(&self, server: &Server) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-p".to_string(),
            server.ssh_port.to_string(),
        ];
        if let Some(ref identity) = self.identity {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push(format!("{}@{}", server.ssh_user, server.hostname));
        args.push(server.command.clone());
        args
    }
}

/// Read a stream to EOF, keeping at most `MAX_STREAM_BYTES`. The rest is
/// drained and discarded so the child never blocks on a full pipe.
async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut truncated = false;
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_STREAM_BYTES.saturating_sub(buf.len());
                if n > room {
                    truncated = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (buf, truncated)
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, server: &Server) -> Result<CommandOutput, ExecError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(self.args(server))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future on timeout must not leave an orphaned ssh behind.
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or(ExecError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ExecError::Pipe("stderr"))?;

        let ((out, out_cut), (err, err_cut), status) =
            tokio::join!(read_bounded(stdout), read_bounded(stderr), child.wait());
        let status = status?;

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
            truncated: out_cut || err_cut,
        })
    }
}
