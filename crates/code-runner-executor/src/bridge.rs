//! Turns an execution's interpreter messages into ordered output events.

use std::{sync::Arc, time::Duration};

use code_runner_core::{
    Backend, BackendError, Execution, NO_OUTPUT_MESSAGE, OutputEvent, RunnerConfig, SessionId,
};
use futures::{
    FutureExt, StreamExt,
    future::BoxFuture,
    stream::{self, BoxStream},
};

/// Drives one `run_code` execution.
///
/// The produced stream yields, in order: one event per content-bearing
/// message, then an idle marker (`NO_OUTPUT_MESSAGE` if nothing was
/// produced, empty otherwise), then exactly one terminal event. Failures to
/// submit or read replace the idle marker with a description of the
/// failure; the terminal event is still sent.
///
/// Dropping the stream stops reading and releases the backend for the next
/// execution; the interpreter itself is left alone.
#[derive(Debug, Clone)]
pub struct MessageBridge {
    message_timeout: Duration,
}

impl MessageBridge {
    /// Create a bridge that waits at most `message_timeout` for each message.
    #[must_use]
    pub const fn new(message_timeout: Duration) -> Self {
        Self { message_timeout }
    }

    /// Create a bridge from the shared configuration.
    #[must_use]
    pub const fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.message_timeout)
    }

    /// Submit `code` to `backend` and stream the resulting events.
    #[must_use]
    pub fn run<B: Backend>(
        &self,
        session_id: SessionId,
        backend: Arc<B>,
        code: String,
    ) -> BoxStream<'static, OutputEvent> {
        let submit = async move { backend.execute(&code).await }.boxed();
        self.drive(session_id, Phase::Submit(submit))
    }

    /// Stream the events of an execution that was already submitted.
    #[must_use]
    pub fn stream(&self, session_id: SessionId, execution: Execution) -> BoxStream<'static, OutputEvent> {
        self.drive(session_id, Phase::Read(execution))
    }

    fn drive(&self, session_id: SessionId, phase: Phase) -> BoxStream<'static, OutputEvent> {
        let bridge = Bridge {
            session_id,
            timeout: self.message_timeout,
            saw_output: false,
            phase,
        };
        stream::unfold(bridge, |mut bridge| async move {
            let event = bridge.step().await?;
            Some((event, bridge))
        })
        .boxed()
    }
}

enum Phase {
    Submit(BoxFuture<'static, Result<Execution, BackendError>>),
    Read(Execution),
    Finish,
    Done,
}

struct Bridge {
    session_id: SessionId,
    timeout: Duration,
    saw_output: bool,
    phase: Phase,
}

impl Bridge {
    fn chunk(&self, content: impl Into<String>) -> OutputEvent {
        OutputEvent::chunk(self.session_id.clone(), content)
    }

    async fn step(&mut self) -> Option<OutputEvent> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Submit(submit) => match submit.await {
                    Ok(execution) => self.phase = Phase::Read(execution),
                    Err(e) => {
                        tracing::warn!(session = %self.session_id, "Failed to submit code: {e}");
                        self.phase = Phase::Finish;
                        return Some(self.chunk(format!("Execution failed: {e}")));
                    }
                },
                Phase::Read(mut execution) => match execution.next_message(self.timeout).await {
                    Ok(msg) if msg.is_idle() => {
                        self.phase = Phase::Finish;
                        let marker = if self.saw_output { "" } else { NO_OUTPUT_MESSAGE };
                        return Some(self.chunk(marker));
                    }
                    Ok(msg) => {
                        self.phase = Phase::Read(execution);
                        if let Some(text) = msg.text() {
                            self.saw_output = true;
                            return Some(self.chunk(text));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            session = %self.session_id,
                            execution = %execution.id(),
                            "Execution interrupted: {e}"
                        );
                        self.phase = Phase::Finish;
                        return Some(self.chunk(format!("Execution interrupted: {e}")));
                    }
                },
                Phase::Finish => {
                    return Some(OutputEvent::terminal(self.session_id.clone(), ""));
                }
                Phase::Done => return None,
            }
        }
    }
}
