//! Messages emitted by an interpreter backend.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier tying backend messages to the request that caused them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Interpreter activity reported by `status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

/// Message payload, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    /// Text written to stdout/stderr.
    Stream { name: String, text: String },
    /// Value of the last expression.
    ExecuteResult { data: ResultData },
    /// Uncaught exception.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// Interpreter state change.
    Status { execution_state: ExecutionState },
}

/// Representations of a result value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultData {
    #[serde(rename = "text/plain", default)]
    pub text_plain: String,
}

/// A message read from a backend's shared channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMessage {
    /// Correlation id of the request this message answers.
    ///
    /// `None` for messages not caused by any request.
    #[serde(default)]
    pub parent_id: Option<CorrelationId>,
    #[serde(flatten)]
    pub content: MessageContent,
}

impl KernelMessage {
    /// Create a message answering `parent`.
    #[must_use]
    pub const fn new(parent: CorrelationId, content: MessageContent) -> Self {
        Self {
            parent_id: Some(parent),
            content,
        }
    }

    /// Whether this message answers `id`.
    #[must_use]
    pub fn belongs_to(&self, id: CorrelationId) -> bool {
        self.parent_id == Some(id)
    }

    /// Text carried by a content-bearing message.
    ///
    /// Tracebacks are joined with newlines. Status messages carry no text.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        match &self.content {
            MessageContent::Stream { text, .. } => Some(text.clone()),
            MessageContent::ExecuteResult { data } => Some(data.text_plain.clone()),
            MessageContent::Error { traceback, .. } => Some(traceback.join("\n")),
            MessageContent::Status { .. } => None,
        }
    }

    /// Whether this is an idle status.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(
            self.content,
            MessageContent::Status {
                execution_state: ExecutionState::Idle
            }
        )
    }
}
