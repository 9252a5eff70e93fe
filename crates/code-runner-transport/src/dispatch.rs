//! Binds validated requests to their handlers.

use std::sync::Arc;

use code_runner_core::{BackendFactory, OutputEvent};
use code_runner_executor::{MessageBridge, ShellRunner};
use code_runner_session::SessionRegistry;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};

use crate::protocol::{Operation, ValidatedRequest};

/// Resolves a validated request to its event stream.
///
/// `run_code` goes through the session's backend (created on first use);
/// `run_shell` needs no backend and produces a single terminal event.
pub struct RequestDispatcher<F: BackendFactory> {
    registry: Arc<SessionRegistry<F>>,
    bridge: MessageBridge,
    shell: ShellRunner,
}

impl<F: BackendFactory> Clone for RequestDispatcher<F> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            bridge: self.bridge.clone(),
            shell: self.shell.clone(),
        }
    }
}

impl<F: BackendFactory> RequestDispatcher<F> {
    /// Create a dispatcher.
    #[must_use]
    pub const fn new(
        registry: Arc<SessionRegistry<F>>,
        bridge: MessageBridge,
        shell: ShellRunner,
    ) -> Self {
        Self {
            registry,
            bridge,
            shell,
        }
    }

    /// The session registry backing `run_code`.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry<F>> {
        &self.registry
    }

    /// Run the request and return its events.
    ///
    /// The stream always ends with exactly one terminal event. A backend that
    /// fails to start is reported as that single terminal event.
    pub async fn dispatch(&self, request: ValidatedRequest) -> BoxStream<'static, OutputEvent> {
        let ValidatedRequest {
            session_id,
            operation,
        } = request;

        match operation {
            Operation::RunShell { command } => {
                let shell = self.shell.clone();
                stream::once(async move { shell.execute(&session_id, &command).await }).boxed()
            }
            Operation::RunCode { code } => match self.registry.get_or_create(&session_id).await {
                Ok(backend) => self.bridge.run(session_id, backend, code),
                Err(e) => stream::iter([OutputEvent::terminal(session_id, e.to_string())]).boxed(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use code_runner_core::testing::ScriptedFactory;

    use super::*;

    fn dispatcher(factory: ScriptedFactory) -> RequestDispatcher<ScriptedFactory> {
        RequestDispatcher::new(
            Arc::new(SessionRegistry::new(factory)),
            MessageBridge::new(Duration::from_secs(2)),
            ShellRunner::new(Duration::from_secs(10)),
        )
    }

    fn run_code(session_id: &str, code: &str) -> ValidatedRequest {
        ValidatedRequest {
            session_id: session_id.into(),
            operation: Operation::RunCode { code: code.into() },
        }
    }

    #[tokio::test]
    async fn test_shell_needs_no_backend() {
        let factory = ScriptedFactory::new();
        let dispatcher = dispatcher(factory.clone());
        let request = ValidatedRequest {
            session_id: "s".into(),
            operation: Operation::RunShell {
                command: "echo hi".into(),
            },
        };

        let events: Vec<_> = dispatcher.dispatch(request).await.collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_final);
        assert!(events[0].content.contains("hi"));
        assert_eq!(factory.starts(), 0);
    }

    #[tokio::test]
    async fn test_startup_failure_is_single_terminal_event() {
        let factory = ScriptedFactory::new().failing_first_starts(1);
        let dispatcher = dispatcher(factory.clone());

        let events: Vec<_> = dispatcher.dispatch(run_code("s", "1")).await.collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_final);
        assert!(events[0].content.contains("scripted startup failure"));

        let events: Vec<_> = dispatcher.dispatch(run_code("s", "1")).await.collect().await;
        assert_eq!(events[0].content, "1");
        assert_eq!(factory.starts(), 2);
    }
}
