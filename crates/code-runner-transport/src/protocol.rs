//! Wire protocol for client-server communication.

use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use code_runner_core::{OutputEvent, SessionId};
use futures::{Stream, StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Request validation error. Always answered with HTTP 400.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid JSON body: {0}")]
    InvalidJson(String),
    #[error("No execution data provided")]
    MissingData,
    #[error("Unknown function name {0}")]
    UnknownFunction(String),
    #[error("Missing argument '{argument}' for {function}")]
    MissingArgument {
        function: &'static str,
        argument: &'static str,
    },
}

/// Body of `POST /execute`, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub arguments: Option<Map<String, Value>>,
}

/// Operations a request can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionName {
    RunShell,
    RunCode,
}

impl FunctionName {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunShell => "run_shell",
            Self::RunCode => "run_code",
        }
    }

    /// Name of the argument the operation requires.
    #[must_use]
    pub const fn argument(self) -> &'static str {
        match self {
            Self::RunShell => "command",
            Self::RunCode => "code",
        }
    }
}

impl FromStr for FunctionName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run_shell" => Ok(Self::RunShell),
            "run_code" => Ok(Self::RunCode),
            other => Err(ValidationError::UnknownFunction(other.to_string())),
        }
    }
}

/// A validated operation with its argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// One-shot shell command.
    RunShell { command: String },
    /// Code for the session's interpreter.
    RunCode { code: String },
}

impl Operation {
    /// Wire name of the operation.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RunShell { .. } => FunctionName::RunShell.as_str(),
            Self::RunCode { .. } => FunctionName::RunCode.as_str(),
        }
    }
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub session_id: SessionId,
    pub operation: Operation,
}

impl ExecuteRequest {
    /// Parse a raw request body.
    ///
    /// # Errors
    /// Returns `InvalidJson` if the body is not a JSON object of the expected shape.
    pub fn parse(body: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(body).map_err(|e| ValidationError::InvalidJson(e.to_string()))
    }

    /// Check required fields and resolve the operation.
    ///
    /// # Errors
    /// Returns `MissingData` if the session id, function name or arguments are
    /// absent or empty, `UnknownFunction` for an unrecognized function name and
    /// `MissingArgument` if the operation's argument is absent or empty.
    pub fn validate(self) -> Result<ValidatedRequest, ValidationError> {
        let (Some(session_id), Some(function_name), Some(arguments)) = (
            self.session_id.filter(|s| !s.is_empty()),
            self.function_name.filter(|s| !s.is_empty()),
            self.arguments.filter(|a| !a.is_empty()),
        ) else {
            return Err(ValidationError::MissingData);
        };

        let function: FunctionName = function_name.parse()?;
        let argument = arguments
            .get(function.argument())
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingArgument {
                function: function.as_str(),
                argument: function.argument(),
            })?
            .to_string();

        let operation = match function {
            FunctionName::RunShell => Operation::RunShell { command: argument },
            FunctionName::RunCode => Operation::RunCode { code: argument },
        };

        Ok(ValidatedRequest {
            session_id,
            operation,
        })
    }
}

/// JSON body of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    /// Create an error body.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Encodes output events as event-stream frames: `data: <json>\n\n`.
///
/// Each event becomes exactly one frame as soon as it is produced; nothing
/// is batched.
pub struct StreamEncoder;

impl StreamEncoder {
    /// Encode one event.
    ///
    /// # Errors
    /// Returns error if the event cannot be serialized.
    pub fn encode(event: &OutputEvent) -> Result<Bytes, serde_json::Error> {
        let json = serde_json::to_vec(event)?;
        let mut frame = BytesMut::with_capacity(json.len() + 8);
        frame.put_slice(b"data: ");
        frame.put_slice(&json);
        frame.put_slice(b"\n\n");
        Ok(frame.freeze())
    }

    /// Encode a stream of events, one frame per event, in order.
    pub fn encode_stream<S>(events: S) -> BoxStream<'static, Result<Bytes, serde_json::Error>>
    where
        S: Stream<Item = OutputEvent> + Send + 'static,
    {
        events.map(|event| Self::encode(&event)).boxed()
    }
}
