//! Core abstractions for session-bound code execution.
//!
//! This crate provides the fundamental building blocks:
//! - `OutputEvent` - One unit of streamed execution output
//! - `KernelMessage` - Typed message emitted by an interpreter backend
//! - `Execution` - Live, correlation-filtered view of a backend's messages
//! - `Backend` and `BackendFactory` traits
//! - `RunnerConfig` - Timeouts and interpreter settings

pub mod config;
pub mod event;
pub mod execution;
pub mod message;
pub mod traits;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{ConfigError, RunnerConfig};
pub use event::{NO_OUTPUT_MESSAGE, OutputEvent};
pub use execution::Execution;
pub use message::{CorrelationId, ExecutionState, KernelMessage, MessageContent};
pub use traits::{Backend, BackendError, BackendFactory, BackendState, SessionId};
