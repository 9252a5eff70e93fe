//! Shell command utilities and the one-shot shell runner.

use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Output, Stdio},
    time::Duration,
};

use code_runner_core::{OutputEvent, RunnerConfig};
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};

/// Returns the shell program and its "run this string" flag.
///
/// Uses `$SHELL` when it points at an existing file, `/bin/sh` otherwise.
#[must_use]
pub fn get_shell_command() -> (PathBuf, &'static str) {
    UnixShell::current_shell().get_shell_command()
}

/// Resolve an executable by name.
///
/// Explicit paths are accepted as-is when they point at a file; bare names
/// are looked up on the current `PATH` via `which`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() && path.is_file() {
        return Some(path.to_path_buf());
    }

    which_async(executable).await
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// Unix shell types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixShell {
    Zsh(PathBuf),
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    /// Get the shell path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Get the current shell from `$SHELL`.
    #[must_use]
    pub fn current_shell() -> Self {
        if let Ok(shell) = std::env::var("SHELL") {
            if let Some(shell) = Self::from_path(Path::new(&shell)) {
                return shell;
            }
        }
        Self::Sh(PathBuf::from("/bin/sh"))
    }

    /// Create from a path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if !(path.is_absolute() && path.is_file()) {
            return None;
        }
        let path_buf = path.to_path_buf();
        let shell = match path.file_name().and_then(OsStr::to_str) {
            Some("zsh") => Self::Zsh(path_buf),
            Some("bash") => Self::Bash(path_buf),
            Some("sh") => Self::Sh(path_buf),
            _ => Self::Other(path_buf),
        };
        Some(shell)
    }

    /// Get shell command tuple.
    #[must_use]
    pub fn get_shell_command(&self) -> (PathBuf, &'static str) {
        (self.path().to_path_buf(), "-c")
    }
}

/// Runs one-shot shell commands.
///
/// There is no streaming: the command's combined stdout/stderr (or a failure
/// description) is returned as a single block once it exits.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    timeout: Duration,
}

impl ShellRunner {
    /// Create a runner with the given per-command timeout.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Create a runner from the shared configuration.
    #[must_use]
    pub const fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.shell_timeout)
    }

    /// Run `command` and wrap the result in the terminal event for `session_id`.
    pub async fn execute(&self, session_id: &str, command: &str) -> OutputEvent {
        OutputEvent::terminal(session_id, self.run(command).await)
    }

    /// Run `command` through the shell and return its combined output.
    ///
    /// Failures are reported in the returned text, never as an error.
    pub async fn run(&self, command: &str) -> String {
        let (shell, flag) = get_shell_command();
        tracing::debug!(shell = %shell.display(), %command, "Running shell command");

        let mut cmd = Command::new(&shell);
        // Merge stderr into stdout inside the shell so the two stay interleaved.
        cmd.arg(flag)
            .arg(format!("exec 2>&1\n{command}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.group_spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(%command, "Failed to spawn shell: {e}");
                return format!("Failed to run command '{command}': {e}");
            }
        };

        let stdout = child.inner().stdout.take();
        let stderr = child.inner().stderr.take();
        let finished = tokio::time::timeout(self.timeout, async {
            tokio::try_join!(child.wait(), read_all(stdout), read_all(stderr))
        })
        .await;

        let output = match finished {
            Ok(Ok((status, stdout, stderr))) => Output {
                status,
                stdout,
                stderr,
            },
            Ok(Err(e)) => {
                tracing::error!(%command, "Failed to wait for shell: {e}");
                kill_group(&mut child, command).await;
                return format!("Failed to run command '{command}': {e}");
            }
            Err(_) => {
                tracing::warn!(%command, timeout = ?self.timeout, "Shell command timed out");
                kill_group(&mut child, command).await;
                return format!("Command '{command}' timed out after {:?}", self.timeout);
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            return text;
        }

        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&describe_failure(command, output.status));
        text
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Kill the shell and everything it started.
async fn kill_group(child: &mut AsyncGroupChild, command: &str) {
    if let Err(e) = child.kill().await {
        tracing::warn!(%command, "Failed to kill shell process group: {e}");
    }
}

fn describe_failure(command: &str, status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("Command '{command}' returned non-zero exit status {code}.");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("Command '{command}' died with signal {signal}.");
        }
    }

    format!("Command '{command}' failed: {status}")
}
