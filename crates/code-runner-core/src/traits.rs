//! Core traits for interpreter backends.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Execution;

/// Session identifier (opaque, client supplied).
pub type SessionId = String;

/// Backend lifecycle state.
///
/// `Uninitialized -> Starting -> Ready <-> Executing -> Terminating -> Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Uninitialized,
    Starting,
    Ready,
    Executing,
    Terminating,
    Terminated,
}

impl BackendState {
    /// Whether the backend can accept executions.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Ready | Self::Executing)
    }
}

/// Backend error.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to start interpreter: {0}")]
    Startup(String),
    #[error("Interpreter did not become ready within {0:?}")]
    StartupTimeout(Duration),
    #[error("Interpreter channel closed")]
    ChannelClosed,
    #[error("No message from interpreter within {0:?}")]
    Timeout(Duration),
    #[error("Interpreter has been shut down")]
    Terminated,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Shutdown failed: {0}")]
    Shutdown(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A started, stateful interpreter.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Submit code and return a handle filtered to this execution's messages.
    ///
    /// Executions on one backend are serialized: this waits for the previous
    /// `Execution` handle to be dropped.
    async fn execute(&self, code: &str) -> Result<Execution, BackendError>;

    /// Terminate the interpreter. Calling it again is a no-op.
    async fn shutdown(&self) -> Result<(), BackendError>;

    /// Current lifecycle state.
    fn state(&self) -> BackendState;
}

/// Starts backends for sessions.
#[async_trait]
pub trait BackendFactory: Send + Sync + 'static {
    type Backend: Backend;

    /// Launch a backend and wait until it is ready.
    async fn start(&self, session_id: &str) -> Result<Self::Backend, BackendError>;
}
