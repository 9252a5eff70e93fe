//! JSON-lines protocol spoken with the interpreter driver.

use std::sync::Arc;

use code_runner_core::{BackendError, CorrelationId, KernelMessage};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStderr, ChildStdin, ChildStdout},
    sync::{Mutex, broadcast},
};

/// Capacity of a kernel's shared message channel.
const CHANNEL_CAPACITY: usize = 4096;

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ProtocolError> for BackendError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Self::ChannelClosed,
            ProtocolError::Io(e) => Self::Io(e),
            ProtocolError::Json(e) => Self::Protocol(e.to_string()),
        }
    }
}

/// Request written to the driver's stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KernelRequest<'a> {
    KernelInfoRequest { msg_id: CorrelationId },
    ExecuteRequest { msg_id: CorrelationId, code: &'a str },
    ShutdownRequest { msg_id: CorrelationId },
}

/// Writes requests to the interpreter and publishes what it answers.
#[derive(Clone)]
pub struct KernelPeer {
    stdin: Arc<Mutex<ChildStdin>>,
}

impl KernelPeer {
    /// Spawn a new protocol peer.
    ///
    /// This starts background tasks reading stdout (parsed and published on
    /// the returned channel) and stderr (logged). The channel closes when the
    /// interpreter's stdout does, after which `on_close` runs.
    #[must_use]
    pub fn spawn<F>(
        session_id: &str,
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: ChildStderr,
        on_close: F,
    ) -> (Self, broadcast::Receiver<KernelMessage>)
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        let peer = Self {
            stdin: Arc::new(Mutex::new(stdin)),
        };

        let session = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = read_loop(stdout, tx).await {
                tracing::error!(session = %session, "Kernel reader loop error: {e}");
            }
            tracing::debug!(session = %session, "Kernel message channel closed");
            on_close();
        });

        let session = session_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(session = %session, "kernel stderr: {line}");
            }
        });

        (peer, rx)
    }

    async fn send_json<T: Serialize>(&self, message: &T) -> Result<(), ProtocolError> {
        let json = serde_json::to_string(message)?;
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Ask the interpreter to report in; it answers with busy/idle status.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn kernel_info(&self, msg_id: CorrelationId) -> Result<(), ProtocolError> {
        self.send_json(&KernelRequest::KernelInfoRequest { msg_id }).await
    }

    /// Submit code for evaluation.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn execute(&self, msg_id: CorrelationId, code: &str) -> Result<(), ProtocolError> {
        self.send_json(&KernelRequest::ExecuteRequest { msg_id, code })
            .await
    }

    /// Ask the interpreter to exit.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn shutdown(&self, msg_id: CorrelationId) -> Result<(), ProtocolError> {
        self.send_json(&KernelRequest::ShutdownRequest { msg_id }).await
    }
}

async fn read_loop(
    stdout: ChildStdout,
    tx: broadcast::Sender<KernelMessage>,
) -> Result<(), ProtocolError> {
    let mut reader = BufReader::new(stdout);
    let mut buffer = String::new();

    loop {
        buffer.clear();
        if reader.read_line(&mut buffer).await? == 0 {
            return Ok(()); // EOF
        }
        let line = buffer.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<KernelMessage>(line) {
            Ok(msg) => {
                // No subscribers simply means nobody is executing right now.
                let _ = tx.send(msg);
            }
            Err(e) => {
                tracing::debug!("Ignoring unparsable kernel line ({e}): {line}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        let id = CorrelationId::new();
        let json = serde_json::to_value(KernelRequest::ExecuteRequest { msg_id: id, code: "1+1" })
            .unwrap();
        assert_eq!(json["type"], "execute_request");
        assert_eq!(json["msg_id"], id.to_string());
        assert_eq!(json["code"], "1+1");

        let json = serde_json::to_value(KernelRequest::ShutdownRequest { msg_id: id }).unwrap();
        assert_eq!(json["type"], "shutdown_request");
    }
}
