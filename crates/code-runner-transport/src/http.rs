//! HTTP routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use bytes::Bytes;
use code_runner_core::{BackendFactory, OutputEvent};
use code_runner_session::LifecycleManager;
use futures::Stream;

use crate::{
    dispatch::RequestDispatcher,
    protocol::{ErrorBody, ExecuteRequest, StreamEncoder},
};

/// Shared handler state.
pub struct AppState<F: BackendFactory> {
    pub dispatcher: RequestDispatcher<F>,
    pub lifecycle: Arc<LifecycleManager<F>>,
}

impl<F: BackendFactory> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }
}

/// Build the router.
///
/// Routes:
/// - `POST /execute` - run code or a shell command, streaming events
/// - `DELETE /sessions/{id}` - shut down a session's backend
/// - `GET /health` - liveness probe
#[must_use]
pub fn create_router<F: BackendFactory>(state: AppState<F>) -> Router {
    Router::new()
        .route("/execute", post(execute::<F>))
        .route("/sessions/{id}", delete(close_session::<F>))
        .route("/health", get(health))
        .with_state(state)
}

async fn execute<F: BackendFactory>(State(state): State<AppState<F>>, body: Bytes) -> Response {
    let request = match ExecuteRequest::parse(&body).and_then(ExecuteRequest::validate) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Rejected execute request: {e}");
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    tracing::info!(
        session = %request.session_id,
        function = request.operation.name(),
        "Execute request"
    );
    let events = state.dispatcher.dispatch(request).await;
    event_stream(events)
}

async fn close_session<F: BackendFactory>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
) -> Response {
    match state.lifecycle.shutdown_session(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, format!("Unknown session {id}")),
        Err(e) => {
            tracing::error!(session = %id, "Failed to close session: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

fn event_stream<S>(events: S) -> Response
where
    S: Stream<Item = OutputEvent> + Send + 'static,
{
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(StreamEncoder::encode_stream(events)),
    )
        .into_response()
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody::new(error))).into_response()
}
