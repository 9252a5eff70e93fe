//! HTTP transport for code execution.
//!
//! Provides:
//! - Wire protocol (request validation, event-stream frames)
//! - `RequestDispatcher` - Bind validated requests to their handlers
//! - Axum router exposing `POST /execute` and session management

pub mod dispatch;
pub mod http;
pub mod protocol;

pub use dispatch::RequestDispatcher;
pub use http::{AppState, create_router};
pub use protocol::{ErrorBody, ExecuteRequest, Operation, StreamEncoder, ValidatedRequest, ValidationError};
