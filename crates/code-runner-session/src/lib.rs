//! Session registry and backend lifecycle.
//!
//! Provides:
//! - `SessionRegistry` - One live backend per session id, created on first use
//! - `LifecycleManager` - Best-effort shutdown of every backend

pub mod lifecycle;
pub mod registry;

pub use lifecycle::{LifecycleManager, ShutdownReport};
pub use registry::{Session, SessionRegistry};
