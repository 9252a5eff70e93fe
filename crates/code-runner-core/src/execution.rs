//! Live view of one execution's messages.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};

use crate::{BackendError, CorrelationId, KernelMessage};

/// Handle returned by [`Backend::execute`](crate::Backend::execute).
///
/// Reads the backend's shared message channel and yields only the messages
/// answering this execution's correlation id. While the handle is alive it
/// holds the backend's execution permit, if one was attached.
pub struct Execution {
    id: CorrelationId,
    messages: broadcast::Receiver<KernelMessage>,
    permit: Option<Box<dyn Send + Sync>>,
}

impl Execution {
    /// Create a handle over a channel subscription.
    ///
    /// The receiver must be subscribed before the request is submitted,
    /// otherwise early messages are missed.
    #[must_use]
    pub fn new(id: CorrelationId, messages: broadcast::Receiver<KernelMessage>) -> Self {
        Self {
            id,
            messages,
            permit: None,
        }
    }

    /// Keep `permit` alive until this handle is dropped.
    #[must_use]
    pub fn hold<P: Send + Sync + 'static>(mut self, permit: P) -> Self {
        self.permit = Some(Box::new(permit));
        self
    }

    /// Correlation id of this execution.
    #[must_use]
    pub const fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait for the next message belonging to this execution.
    ///
    /// # Errors
    /// Returns `Timeout` if nothing relevant arrives within `timeout`, and
    /// `ChannelClosed` once the backend's channel is gone.
    pub async fn next_message(&mut self, timeout: Duration) -> Result<KernelMessage, BackendError> {
        let id = self.id;
        let messages = &mut self.messages;
        let next = async move {
            loop {
                match messages.recv().await {
                    Ok(msg) if msg.belongs_to(id) => return Ok(msg),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(execution = %id, skipped, "Execution lagged behind backend channel");
                    }
                    Err(RecvError::Closed) => return Err(BackendError::ChannelClosed),
                }
            }
        };

        tokio::time::timeout(timeout, next)
            .await
            .map_err(|_| BackendError::Timeout(timeout))?
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.id)
            .field("holds_permit", &self.permit.is_some())
            .finish_non_exhaustive()
    }
}
