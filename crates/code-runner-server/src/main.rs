//! Code execution server.
//!
//! Run with: cargo run -p code-runner-server
//!
//! Then:
//! ```text
//! curl -N -X POST http://127.0.0.1:5000/execute \
//!     -H 'content-type: application/json' \
//!     -d '{"sessionId":"demo","functionName":"run_code","arguments":{"code":"print(1 + 1)"}}'
//! ```

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use axum::Router;
use code_runner_core::{BackendFactory, RunnerConfig};
use code_runner_executor::{KernelLauncher, MessageBridge, ShellRunner};
use code_runner_session::{LifecycleManager, SessionRegistry, ShutdownReport};
use code_runner_transport::{AppState, RequestDispatcher, create_router};
use tokio::{net::TcpListener, sync::oneshot};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RunnerConfig::from_env().context("Invalid configuration")?;
    tracing::debug!(?config, "Loaded configuration");

    let registry = Arc::new(SessionRegistry::new(KernelLauncher::new(config.clone())));
    let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&registry)));
    let dispatcher = RequestDispatcher::new(
        registry,
        MessageBridge::from_config(&config),
        ShellRunner::from_config(&config),
    );

    let app = create_router(AppState {
        dispatcher,
        lifecycle: Arc::clone(&lifecycle),
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!("Server listening on http://{}", config.bind_addr);

    serve(listener, app, &lifecycle, config.shutdown_grace, shutdown_signal()).await?;
    Ok(())
}

/// Serve `app` until `signal` fires or the server fails, then shut every
/// backend down.
///
/// Backends are shut down as soon as the server stops accepting, which ends
/// the event streams still open on them. Connections get `drain` to finish
/// after that; a second Ctrl+C stops waiting immediately.
async fn serve<F, S>(
    listener: TcpListener,
    app: Router,
    lifecycle: &LifecycleManager<F>,
    drain: Duration,
    signal: S,
) -> anyhow::Result<ShutdownReport>
where
    F: BackendFactory,
    S: Future<Output = ()> + Send,
{
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    let finished = tokio::select! {
        () = signal => None,
        result = &mut server => Some(result),
    };
    let _ = stop_tx.send(());

    tracing::info!("Shutting down backends");
    let report = lifecycle.shutdown_all().await;
    log_report(&report);

    let result = match finished {
        Some(result) => result,
        None => {
            let drained = tokio::select! {
                result = tokio::time::timeout(drain, &mut server) => result
                    .inspect_err(|_| tracing::warn!(?drain, "Connections still open, closing them"))
                    .ok(),
                Ok(()) = tokio::signal::ctrl_c() => {
                    tracing::warn!("Second interrupt, closing open connections");
                    None
                }
            };
            drained.unwrap_or_else(|| {
                server.abort();
                Ok(Ok(()))
            })
        }
    };
    result.context("Server task failed")?.context("Server error")?;

    Ok(report)
}

fn log_report(report: &ShutdownReport) {
    if report.is_clean() {
        tracing::info!("Shut down {} backend(s)", report.attempted);
        return;
    }
    for (session_id, e) in &report.failures {
        tracing::error!(session = %session_id, "Backend did not shut down cleanly: {e}");
    }
    tracing::warn!(
        "{} of {} backend(s) failed to shut down",
        report.failures.len(),
        report.attempted
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use code_runner_core::testing::ScriptedFactory;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;

    #[tokio::test]
    async fn test_open_stream_does_not_hold_up_shutdown() {
        let factory = ScriptedFactory::new();
        let registry = Arc::new(SessionRegistry::new(factory.clone()));
        registry.get_or_create("s1").await.unwrap();
        let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&registry)));
        let app = create_router(AppState {
            dispatcher: RequestDispatcher::new(
                registry,
                MessageBridge::new(Duration::from_secs(60)),
                ShellRunner::new(Duration::from_secs(60)),
            ),
            lifecycle: Arc::clone(&lifecycle),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (signal_tx, signal_rx) = oneshot::channel::<()>();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let body = r#"{"sessionId":"s1","functionName":"run_shell","arguments":{"command":"sleep 5"}}"#;
            let request = format!(
                "POST /execute HTTP/1.1\r\nhost: localhost\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(request.as_bytes()).await.unwrap();

            let mut head = [0u8; 12];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(&head, b"HTTP/1.1 200");
            signal_tx.send(()).unwrap();

            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let started = Instant::now();
        let report = serve(listener, app, &lifecycle, Duration::from_millis(300), async {
            let _ = signal_rx.await;
        })
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(report.attempted, 1);
        assert!(report.is_clean());
        assert_eq!(factory.shutdowns(), 1);
        client.abort();
    }
}
