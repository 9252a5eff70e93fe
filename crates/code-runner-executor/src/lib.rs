//! Interpreter backends and output bridging.
//!
//! Provides:
//! - `PythonKernel` / `KernelLauncher` - Persistent interpreter processes
//! - `MessageBridge` - Turn an execution's messages into output events
//! - `ShellRunner` - One-shot shell commands
//! - Command building utilities

pub mod bridge;
pub mod command;
pub mod kernel;
pub mod shell;

pub use bridge::MessageBridge;
pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use kernel::{KernelLauncher, PythonKernel};
pub use shell::{ShellRunner, get_shell_command, resolve_executable_path};
