//! Persistent interpreter processes.
//!
//! Each `PythonKernel` owns one interpreter child running the embedded
//! driver script. The driver keeps a single namespace alive for the life of
//! the process, so definitions made by one execution are visible to the next.

pub mod protocol;

use std::{process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use code_runner_core::{
    Backend, BackendError, BackendFactory, BackendState, CorrelationId, Execution, KernelMessage,
    RunnerConfig,
};
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::{
    process::Command,
    sync::{Mutex, OwnedMutexGuard, broadcast, watch},
};

use crate::command::CommandBuilder;
pub use protocol::{KernelPeer, ProtocolError};

/// Driver script run by the interpreter.
pub const DRIVER: &str = include_str!("driver.py");

/// Starts a [`PythonKernel`] per session.
#[derive(Debug, Clone)]
pub struct KernelLauncher {
    config: RunnerConfig,
}

impl KernelLauncher {
    /// Create a launcher using the interpreter and timeouts from `config`.
    #[must_use]
    pub const fn new(config: RunnerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackendFactory for KernelLauncher {
    type Backend = PythonKernel;

    async fn start(&self, session_id: &str) -> Result<PythonKernel, BackendError> {
        PythonKernel::start(session_id, &self.config).await
    }
}

/// Held by an [`Execution`] while it runs; returns the kernel to `Ready` on drop.
struct ExecutionPermit {
    _guard: OwnedMutexGuard<()>,
    state: Arc<watch::Sender<BackendState>>,
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if *state == BackendState::Executing {
                *state = BackendState::Ready;
                true
            } else {
                false
            }
        });
    }
}

/// One interpreter process and its message channel.
pub struct PythonKernel {
    session_id: String,
    peer: KernelPeer,
    messages: broadcast::Receiver<KernelMessage>,
    child: Mutex<Option<AsyncGroupChild>>,
    permit: Arc<Mutex<()>>,
    state: Arc<watch::Sender<BackendState>>,
    shutdown_grace: Duration,
}

impl PythonKernel {
    /// Launch the interpreter and wait until it answers a readiness probe.
    ///
    /// # Errors
    /// Returns `Startup` if the interpreter cannot be spawned and
    /// `StartupTimeout` if it does not answer within the configured bound.
    pub async fn start(session_id: &str, config: &RunnerConfig) -> Result<Self, BackendError> {
        let state = Arc::new(watch::Sender::new(BackendState::Starting));

        let (program, args) = CommandBuilder::new(&config.interpreter)
            .params(["-u", "-c", DRIVER])
            .build()
            .map_err(|e| BackendError::Startup(e.to_string()))?
            .into_resolved()
            .await
            .map_err(|e| BackendError::Startup(e.to_string()))?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONUNBUFFERED", "1")
            .kill_on_drop(true);

        let mut child = cmd
            .group_spawn()
            .map_err(|e| BackendError::Startup(format!("{}: {e}", program.display())))?;

        let inner = child.inner();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (inner.stdin.take(), inner.stdout.take(), inner.stderr.take())
        else {
            let _ = child.kill().await;
            return Err(BackendError::Startup("interpreter pipes unavailable".to_string()));
        };

        let closed_state = Arc::clone(&state);
        let (peer, messages) = KernelPeer::spawn(session_id, stdin, stdout, stderr, move || {
            closed_state.send_replace(BackendState::Terminated);
        });

        let kernel = Self {
            session_id: session_id.to_string(),
            peer,
            messages,
            child: Mutex::new(Some(child)),
            permit: Arc::new(Mutex::new(())),
            state,
            shutdown_grace: config.shutdown_grace,
        };

        let probe = kernel.wait_ready(config.startup_timeout);
        match tokio::time::timeout(config.startup_timeout, probe).await {
            Ok(Ok(())) => {
                kernel.state.send_replace(BackendState::Ready);
                tracing::info!(session = %session_id, "Interpreter started");
                Ok(kernel)
            }
            Ok(Err(e)) => {
                kernel.kill().await;
                Err(BackendError::Startup(e.to_string()))
            }
            Err(_) => {
                kernel.kill().await;
                Err(BackendError::StartupTimeout(config.startup_timeout))
            }
        }
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<(), BackendError> {
        let id = CorrelationId::new();
        let mut probe = Execution::new(id, self.messages.resubscribe());
        self.peer.kernel_info(id).await?;
        loop {
            if probe.next_message(timeout).await?.is_idle() {
                return Ok(());
            }
        }
    }

    async fn kill(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(session = %self.session_id, "Failed to kill interpreter: {e}");
            }
        }
        self.state.send_replace(BackendState::Terminated);
    }

    /// OS process id of the interpreter, while it runs.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(AsyncGroupChild::id)
    }
}

#[async_trait]
impl Backend for PythonKernel {
    async fn execute(&self, code: &str) -> Result<Execution, BackendError> {
        let guard = Arc::clone(&self.permit).lock_owned().await;
        let claimed = self.state.send_if_modified(|state| {
            if *state == BackendState::Ready {
                *state = BackendState::Executing;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(BackendError::Terminated);
        }

        let id = CorrelationId::new();
        let execution = Execution::new(id, self.messages.resubscribe());
        let permit = ExecutionPermit {
            _guard: guard,
            state: Arc::clone(&self.state),
        };

        tracing::debug!(session = %self.session_id, execution = %id, "Submitting code");
        self.peer.execute(id, code).await?;

        Ok(execution.hold(permit))
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        self.state.send_replace(BackendState::Terminating);

        if let Err(e) = self.peer.shutdown(CorrelationId::new()).await {
            tracing::debug!(session = %self.session_id, "Shutdown request not delivered: {e}");
        }

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(session = %self.session_id, %status, "Interpreter exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(session = %self.session_id, "Failed to wait for interpreter: {e}");
                child
                    .kill()
                    .await
                    .map_err(|e| BackendError::Shutdown(e.to_string()))?;
            }
            Err(_) => {
                tracing::warn!(
                    session = %self.session_id,
                    grace = ?self.shutdown_grace,
                    "Interpreter did not exit in time, killing"
                );
                child
                    .kill()
                    .await
                    .map_err(|e| BackendError::Shutdown(e.to_string()))?;
            }
        }

        self.state.send_replace(BackendState::Terminated);
        Ok(())
    }

    fn state(&self) -> BackendState {
        *self.state.borrow()
    }
}
