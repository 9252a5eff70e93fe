//! Output events streamed back to the caller.

use serde::{Deserialize, Serialize};

use crate::SessionId;

/// Content sent when an execution finished without producing any output.
pub const NO_OUTPUT_MESSAGE: &str = "No output from the code execution.";

/// One unit of execution output.
///
/// Serialized field order matches the wire frame:
/// `{"content": ..., "end": ..., "session_id": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    /// Text payload.
    pub content: String,
    /// Whether this is the terminal event of its execution.
    #[serde(rename = "end")]
    pub is_final: bool,
    /// Session that produced the event.
    pub session_id: SessionId,
}

impl OutputEvent {
    /// A non-terminal event.
    #[must_use]
    pub fn chunk(session_id: impl Into<SessionId>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_final: false,
            session_id: session_id.into(),
        }
    }

    /// The terminal event closing an execution.
    #[must_use]
    pub fn terminal(session_id: impl Into<SessionId>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_final: true,
            session_id: session_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let event = OutputEvent::terminal("abc", "");
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"content":"","end":true,"session_id":"abc"}"#);
    }

    #[test]
    fn test_chunk_is_not_final() {
        let event = OutputEvent::chunk("abc", "hello\n");
        assert!(!event.is_final);
        assert_eq!(event.content, "hello\n");
    }
}
