//! Process-wide backend lifecycle.

use std::sync::Arc;

use code_runner_core::{Backend, BackendError, BackendFactory, SessionId};

use crate::SessionRegistry;

/// Outcome of shutting down every backend.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Number of backends a shutdown was attempted on.
    pub attempted: usize,
    /// Backends that failed to shut down cleanly.
    pub failures: Vec<(SessionId, BackendError)>,
}

impl ShutdownReport {
    /// Whether every attempted shutdown succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Shuts down every backend the registry created.
///
/// Create one at process start and call [`shutdown_all`](Self::shutdown_all)
/// once the server has stopped accepting requests.
pub struct LifecycleManager<F: BackendFactory> {
    registry: Arc<SessionRegistry<F>>,
}

impl<F: BackendFactory> LifecycleManager<F> {
    /// Create a manager over `registry`.
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry<F>>) -> Self {
        Self { registry }
    }

    /// The managed registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry<F>> {
        &self.registry
    }

    /// Shut down every backend, continuing past failures.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let mut attempted = 0;
        let failures = self
            .registry
            .for_each(|session_id, backend| {
                attempted += 1;
                async move {
                    match backend.shutdown().await {
                        Ok(()) => {
                            tracing::info!(session = %session_id, "Shut down backend");
                            Ok(())
                        }
                        Err(e) => {
                            tracing::error!(session = %session_id, "Failed to shut down backend: {e}");
                            Err(e)
                        }
                    }
                }
            })
            .await;

        ShutdownReport {
            attempted,
            failures,
        }
    }

    /// Remove one session and shut its backend down.
    ///
    /// Returns `Ok(false)` if the session had no backend.
    ///
    /// # Errors
    /// Returns error if the backend fails to shut down; it is removed anyway.
    pub async fn shutdown_session(&self, session_id: &str) -> Result<bool, BackendError> {
        let Some(session) = self.registry.remove(session_id).await else {
            return Ok(false);
        };
        session.backend.shutdown().await?;
        tracing::info!(session = %session_id, "Session closed");
        Ok(true)
    }
}
