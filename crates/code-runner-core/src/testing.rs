//! Scripted in-memory backends for tests.
//!
//! `ScriptedBackend` understands a tiny line-oriented language, enough to
//! exercise state persistence and every message kind without a real
//! interpreter:
//!
//! - `name = value` stores a variable
//! - `print(expr)` writes `expr` and a newline to stdout
//! - `raise Name(message)` raises an error
//! - `pass` and blank lines do nothing
//! - any other line is an expression whose value becomes the result

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast, watch};

use crate::{
    Backend, BackendError, BackendFactory, BackendState, CorrelationId, Execution,
    ExecutionState, KernelMessage, MessageContent, message::ResultData,
};

#[derive(Default)]
struct Counters {
    starts: AtomicUsize,
    shutdowns: AtomicUsize,
    failing_starts: AtomicUsize,
}

/// Factory producing [`ScriptedBackend`]s.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    counters: Arc<Counters>,
    start_delay: Duration,
    failing_shutdowns: Arc<HashSet<String>>,
}

impl ScriptedFactory {
    /// Create a factory whose backends always start.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every start.
    #[must_use]
    pub const fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Fail the next `n` starts.
    #[must_use]
    pub fn failing_first_starts(self, n: usize) -> Self {
        self.counters.failing_starts.store(n, Ordering::SeqCst);
        self
    }

    /// Backends for these sessions fail on shutdown.
    #[must_use]
    pub fn failing_shutdown_for<I, S>(mut self, session_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_shutdowns = Arc::new(session_ids.into_iter().map(Into::into).collect());
        self
    }

    /// Number of start attempts so far.
    #[must_use]
    pub fn starts(&self) -> usize {
        self.counters.starts.load(Ordering::SeqCst)
    }

    /// Number of shutdown calls across all backends.
    #[must_use]
    pub fn shutdowns(&self) -> usize {
        self.counters.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendFactory for ScriptedFactory {
    type Backend = ScriptedBackend;

    async fn start(&self, session_id: &str) -> Result<ScriptedBackend, BackendError> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let should_fail = self
            .counters
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BackendError::Startup("scripted startup failure".to_string()));
        }

        Ok(ScriptedBackend {
            channel: broadcast::channel(256).0,
            variables: Arc::new(Mutex::new(HashMap::new())),
            permit: Arc::new(Mutex::new(())),
            state: watch::Sender::new(BackendState::Ready),
            fail_shutdown: self.failing_shutdowns.contains(session_id),
            counters: Arc::clone(&self.counters),
        })
    }
}

/// In-memory backend with persistent variables.
pub struct ScriptedBackend {
    channel: broadcast::Sender<KernelMessage>,
    variables: Arc<Mutex<HashMap<String, String>>>,
    permit: Arc<Mutex<()>>,
    state: watch::Sender<BackendState>,
    fail_shutdown: bool,
    counters: Arc<Counters>,
}

impl ScriptedBackend {
    /// Force the lifecycle state, e.g. to simulate a shutdown in progress.
    pub fn set_state(&self, state: BackendState) {
        self.state.send_replace(state);
    }

    async fn run(&self, code: &str) -> Vec<MessageContent> {
        let mut variables = self.variables.lock().await;
        let mut out = Vec::new();

        for line in code.lines().map(str::trim) {
            if line.is_empty() || line == "pass" {
                continue;
            }
            if let Some(inner) = line.strip_prefix("print(").and_then(|s| s.strip_suffix(')')) {
                match eval(&variables, inner) {
                    Ok(value) => out.push(MessageContent::Stream {
                        name: "stdout".into(),
                        text: format!("{value}\n"),
                    }),
                    Err(error) => {
                        out.push(error);
                        break;
                    }
                }
            } else if let Some(rest) = line.strip_prefix("raise ") {
                let (ename, evalue) = rest
                    .split_once('(')
                    .map_or((rest, ""), |(name, msg)| (name, msg.trim_end_matches(')')));
                out.push(error(ename, evalue.trim_matches(['\'', '"'])));
                break;
            } else if let Some((name, value)) = line.split_once('=') {
                variables.insert(name.trim().to_string(), value.trim().to_string());
            } else {
                match eval(&variables, line) {
                    Ok(value) => out.push(MessageContent::ExecuteResult {
                        data: ResultData { text_plain: value },
                    }),
                    Err(error) => {
                        out.push(error);
                        break;
                    }
                }
            }
        }
        out
    }
}

fn eval(variables: &HashMap<String, String>, expr: &str) -> Result<String, MessageContent> {
    let expr = expr.trim();
    if let Some(value) = variables.get(expr) {
        return Ok(value.clone());
    }
    if expr.parse::<f64>().is_ok() {
        return Ok(expr.to_string());
    }
    for quote in ['\'', '"'] {
        if let Some(text) = expr.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            return Ok(text.to_string());
        }
    }
    Err(error("NameError", &format!("name '{expr}' is not defined")))
}

fn error(ename: &str, evalue: &str) -> MessageContent {
    MessageContent::Error {
        ename: ename.to_string(),
        evalue: evalue.to_string(),
        traceback: vec![
            "Traceback (most recent call last):".to_string(),
            format!("{ename}: {evalue}"),
        ],
    }
}

fn status(state: ExecutionState) -> MessageContent {
    MessageContent::Status {
        execution_state: state,
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn execute(&self, code: &str) -> Result<Execution, BackendError> {
        if !self.state().is_live() {
            return Err(BackendError::Terminated);
        }
        let permit = Arc::clone(&self.permit).lock_owned().await;

        let id = CorrelationId::new();
        let rx = self.channel.subscribe();

        // Unrelated traffic on the shared channel.
        let _ = self
            .channel
            .send(KernelMessage::new(CorrelationId::new(), status(ExecutionState::Busy)));

        let _ = self.channel.send(KernelMessage::new(id, status(ExecutionState::Busy)));
        for content in self.run(code).await {
            let _ = self.channel.send(KernelMessage::new(id, content));
        }
        let _ = self.channel.send(KernelMessage::new(id, status(ExecutionState::Idle)));

        Ok(Execution::new(id, rx).hold(permit))
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        if self.state() == BackendState::Terminated {
            return Ok(());
        }
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown {
            return Err(BackendError::Shutdown("scripted shutdown failure".to_string()));
        }
        self.state.send_replace(BackendState::Terminated);
        Ok(())
    }

    fn state(&self) -> BackendState {
        *self.state.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(backend: &ScriptedBackend, code: &str) -> Vec<KernelMessage> {
        let mut execution = backend.execute(code).await.unwrap();
        let mut messages = Vec::new();
        loop {
            let msg = execution.next_message(Duration::from_secs(1)).await.unwrap();
            let idle = msg.is_idle();
            messages.push(msg);
            if idle {
                return messages;
            }
        }
    }

    #[tokio::test]
    async fn test_variables_persist() {
        let backend = ScriptedFactory::new().start("s").await.unwrap();
        collect(&backend, "x = 1").await;
        let messages = collect(&backend, "print(x)").await;
        let texts: Vec<String> = messages.iter().filter_map(KernelMessage::text).collect();
        assert_eq!(texts, vec!["1\n".to_string()]);
    }

    #[test]
    fn test_executions_are_serialized() {
        let backend = tokio_test::block_on(ScriptedFactory::new().start("s")).unwrap();
        let first = tokio_test::block_on(backend.execute("x = 1")).unwrap();

        let mut second = tokio_test::task::spawn(backend.execute("print(x)"));
        tokio_test::assert_pending!(second.poll());

        drop(first);
        assert!(second.is_woken());
        let _execution = tokio_test::assert_ready_ok!(second.poll());
    }

    #[tokio::test]
    async fn test_failing_starts_then_success() {
        let factory = ScriptedFactory::new().failing_first_starts(1);
        assert!(factory.start("s").await.is_err());
        assert!(factory.start("s").await.is_ok());
        assert_eq!(factory.starts(), 2);
    }
}
