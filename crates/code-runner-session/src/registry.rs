//! Session registry: maps session ids to their backends.

use std::{collections::HashMap, future::Future, sync::Arc, time::SystemTime};

use code_runner_core::{Backend, BackendError, BackendFactory, SessionId};
use tokio::sync::{OnceCell, RwLock};

/// A session and its backend.
pub struct Session<B> {
    /// Session identifier.
    pub id: SessionId,
    /// The session's backend.
    pub backend: Arc<B>,
    /// When the backend was started.
    pub created_at: SystemTime,
}

impl<B> Clone for Session<B> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            backend: Arc::clone(&self.backend),
            created_at: self.created_at,
        }
    }
}

/// Per-session slot. Initialized at most once; concurrent first callers wait
/// on the same initialization instead of starting their own backend.
type Slot<B> = Arc<OnceCell<Session<B>>>;

/// Registry of live backends, one per session id.
///
/// Backends are created on first use and reused afterwards. A failed start
/// leaves the slot empty so the next call tries again; a backend that is
/// shutting down or has exited is replaced on the next call.
pub struct SessionRegistry<F: BackendFactory> {
    factory: F,
    sessions: RwLock<HashMap<SessionId, Slot<F::Backend>>>,
}

impl<F: BackendFactory> SessionRegistry<F> {
    /// Create an empty registry starting backends with `factory`.
    #[must_use]
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Return the session's backend, starting one if there is none.
    ///
    /// # Errors
    /// Returns the factory's error if the backend cannot be started.
    pub async fn get_or_create(&self, session_id: &str) -> Result<Arc<F::Backend>, BackendError> {
        loop {
            let slot = self.slot(session_id).await;
            let session = slot
                .get_or_try_init(|| async {
                    tracing::info!(session = %session_id, "Starting backend");
                    let backend = self.factory.start(session_id).await.inspect_err(|e| {
                        tracing::error!(session = %session_id, "Backend failed to start: {e}");
                    })?;
                    Ok::<_, BackendError>(Session {
                        id: session_id.to_string(),
                        backend: Arc::new(backend),
                        created_at: SystemTime::now(),
                    })
                })
                .await?;

            let state = session.backend.state();
            if state.is_live() {
                return Ok(Arc::clone(&session.backend));
            }

            tracing::warn!(session = %session_id, ?state, "Backend is no longer usable, replacing it");
            self.evict(session_id, &slot).await;
        }
    }

    /// Return the session if it has a started backend.
    pub async fn get(&self, session_id: &str) -> Option<Session<F::Backend>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Remove a session, returning it if it had a started backend.
    ///
    /// The backend is not shut down.
    pub async fn remove(&self, session_id: &str) -> Option<Session<F::Backend>> {
        let slot = self.sessions.write().await.remove(session_id)?;
        slot.get().cloned()
    }

    /// Number of sessions with a started backend.
    pub async fn len(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Whether no session has a started backend.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ids of sessions with a started backend.
    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.snapshot().await.into_iter().map(|s| s.id).collect()
    }

    /// Apply `f` to every started session concurrently.
    ///
    /// A failing call does not stop the others; failures are returned with
    /// the id of the session they belong to.
    pub async fn for_each<G, Fut, E>(&self, mut f: G) -> Vec<(SessionId, E)>
    where
        G: FnMut(SessionId, Arc<F::Backend>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let calls = self.snapshot().await.into_iter().map(|session| {
            let call = f(session.id.clone(), session.backend);
            async move { call.await.err().map(|e| (session.id, e)) }
        });

        futures::future::join_all(calls)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn snapshot(&self) -> Vec<Session<F::Backend>> {
        self.sessions
            .read()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    async fn slot(&self, session_id: &str) -> Slot<F::Backend> {
        if let Some(slot) = self.sessions.read().await.get(session_id) {
            return Arc::clone(slot);
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    async fn evict(&self, session_id: &str, slot: &Slot<F::Backend>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            sessions.remove(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use code_runner_core::{BackendState, testing::ScriptedFactory};

    use super::*;

    #[tokio::test]
    async fn test_reuses_backend_instance() {
        let factory = ScriptedFactory::new();
        let registry = SessionRegistry::new(factory.clone());

        let first = registry.get_or_create("a").await.unwrap();
        let second = registry.get_or_create("a").await.unwrap();
        let other = registry.get_or_create("b").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(factory.starts(), 2);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_creates_one_backend() {
        let factory = ScriptedFactory::new().with_start_delay(Duration::from_millis(50));
        let registry = Arc::new(SessionRegistry::new(factory.clone()));

        let callers: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create("race").await.unwrap() })
            })
            .collect();

        let mut backends = Vec::new();
        for caller in callers {
            backends.push(caller.await.unwrap());
        }

        assert_eq!(factory.starts(), 1);
        assert!(backends.iter().all(|b| Arc::ptr_eq(b, &backends[0])));
    }

    #[tokio::test]
    async fn test_failed_start_is_not_registered() {
        let factory = ScriptedFactory::new().failing_first_starts(1);
        let registry = SessionRegistry::new(factory.clone());

        assert!(registry.get_or_create("a").await.is_err());
        assert!(registry.get("a").await.is_none());
        assert!(registry.is_empty().await);

        assert!(registry.get_or_create("a").await.is_ok());
        assert_eq!(factory.starts(), 2);
    }

    #[tokio::test]
    async fn test_terminated_backend_is_replaced() {
        let factory = ScriptedFactory::new();
        let registry = SessionRegistry::new(factory.clone());

        let first = registry.get_or_create("a").await.unwrap();
        first.shutdown().await.unwrap();

        let second = registry.get_or_create("a").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.starts(), 2);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_backend_shutting_down_is_replaced() {
        let factory = ScriptedFactory::new();
        let registry = SessionRegistry::new(factory.clone());

        let first = registry.get_or_create("a").await.unwrap();
        first.set_state(BackendState::Terminating);

        let second = registry.get_or_create("a").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), BackendState::Ready);
        assert_eq!(factory.starts(), 2);
    }

    #[tokio::test]
    async fn test_for_each_continues_after_failure() {
        let registry = SessionRegistry::new(ScriptedFactory::new());
        for id in ["a", "b", "c"] {
            registry.get_or_create(id).await.unwrap();
        }

        let mut visited = Vec::new();
        let failures = registry
            .for_each(|id, _backend| {
                visited.push(id.clone());
                async move { if id == "b" { Err("boom") } else { Ok(()) } }
            })
            .await;

        visited.sort();
        assert_eq!(visited, vec!["a", "b", "c"]);
        assert_eq!(failures, vec![("b".to_string(), "boom")]);
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = SessionRegistry::new(ScriptedFactory::new());
        registry.get_or_create("a").await.unwrap();

        let removed = registry.remove("a").await.unwrap();
        assert_eq!(removed.id, "a");
        assert!(registry.remove("a").await.is_none());
        assert_eq!(registry.session_ids().await, Vec::<String>::new());
    }
}
