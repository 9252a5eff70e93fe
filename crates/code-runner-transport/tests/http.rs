//! Router tests against the scripted backend.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use code_runner_core::{NO_OUTPUT_MESSAGE, testing::ScriptedFactory};
use code_runner_executor::{MessageBridge, ShellRunner};
use code_runner_session::{LifecycleManager, SessionRegistry};
use code_runner_transport::{AppState, RequestDispatcher, create_router};
use serde_json::{Value, json};
use tower::ServiceExt;

fn router(factory: ScriptedFactory) -> Router {
    let registry = Arc::new(SessionRegistry::new(factory));
    let dispatcher = RequestDispatcher::new(
        Arc::clone(&registry),
        MessageBridge::new(Duration::from_secs(2)),
        ShellRunner::new(Duration::from_secs(10)),
    );
    create_router(AppState {
        dispatcher,
        lifecycle: Arc::new(LifecycleManager::new(registry)),
    })
}

async fn post(app: &Router, body: impl Into<Body>) -> (StatusCode, Option<String>, String) {
    let request = Request::builder()
        .method("POST")
        .uri("/execute")
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn execute(app: &Router, session_id: &str, function: &str, arguments: Value) -> Vec<Value> {
    let body = json!({
        "sessionId": session_id,
        "functionName": function,
        "arguments": arguments,
    });
    let (status, content_type, text) = post(app, body.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("text/event-stream"));
    frames(&text)
}

fn frames(text: &str) -> Vec<Value> {
    assert!(text.ends_with("\n\n"), "unterminated frame in {text:?}");
    text.split_terminator("\n\n")
        .map(|frame| {
            let json = frame.strip_prefix("data: ").unwrap();
            serde_json::from_str(json).unwrap()
        })
        .collect()
}

async fn rejected(app: &Router, body: &str) -> String {
    let (status, _, text) = post(app, body.to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&text).unwrap();
    body["error"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_rejects_invalid_requests() {
    let app = router(ScriptedFactory::new());

    assert_eq!(
        rejected(&app, r#"{"functionName":"run_code","arguments":{"code":"1"}}"#).await,
        "No execution data provided"
    );
    assert_eq!(
        rejected(&app, r#"{"sessionId":"s","functionName":"eval_js","arguments":{"code":"1"}}"#).await,
        "Unknown function name eval_js"
    );
    assert_eq!(
        rejected(&app, r#"{"sessionId":"s","functionName":"run_code","arguments":{"command":"1"}}"#)
            .await,
        "Missing argument 'code' for run_code"
    );
    assert!(rejected(&app, "not json").await.starts_with("Invalid JSON body: "));
}

#[tokio::test]
async fn test_code_without_output() {
    let app = router(ScriptedFactory::new());

    let events = execute(&app, "s1", "run_code", json!({"code": "x = 1"})).await;

    assert_eq!(
        events,
        vec![
            json!({"content": NO_OUTPUT_MESSAGE, "end": false, "session_id": "s1"}),
            json!({"content": "", "end": true, "session_id": "s1"}),
        ]
    );
}

#[tokio::test]
async fn test_state_persists_within_session() {
    let factory = ScriptedFactory::new();
    let app = router(factory.clone());

    execute(&app, "s1", "run_code", json!({"code": "x = 1"})).await;
    let events = execute(&app, "s1", "run_code", json!({"code": "print(x)"})).await;

    assert!(events.iter().any(|e| e["content"].as_str().unwrap().contains('1')));
    assert_eq!(events.last().unwrap()["end"], true);
    assert_eq!(events.iter().filter(|e| e["end"] == true).count(), 1);

    let other = execute(&app, "s2", "run_code", json!({"code": "print(x)"})).await;
    assert!(other.iter().any(|e| e["content"].as_str().unwrap().contains("NameError")));
    assert_eq!(factory.starts(), 2);
}

#[tokio::test]
async fn test_shell_command() {
    let factory = ScriptedFactory::new();
    let app = router(factory.clone());

    let events = execute(&app, "s1", "run_shell", json!({"command": "echo hi"})).await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["end"], true);
    assert_eq!(events[0]["session_id"], "s1");
    assert!(events[0]["content"].as_str().unwrap().contains("hi"));
    assert_eq!(factory.starts(), 0);
}

#[tokio::test]
async fn test_startup_failure_is_streamed() {
    let app = router(ScriptedFactory::new().failing_first_starts(1));

    let events = execute(&app, "s1", "run_code", json!({"code": "1"})).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["end"], true);
    assert!(events[0]["content"].as_str().unwrap().contains("scripted startup failure"));

    let events = execute(&app, "s1", "run_code", json!({"code": "1"})).await;
    assert_eq!(events[0]["content"], "1");
}

#[tokio::test]
async fn test_close_session() {
    let factory = ScriptedFactory::new();
    let app = router(factory.clone());
    execute(&app, "s1", "run_code", json!({"code": "x = 1"})).await;

    let close = || {
        Request::builder()
            .method("DELETE")
            .uri("/sessions/s1")
            .body(Body::empty())
            .unwrap()
    };
    let response = app.clone().oneshot(close()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(factory.shutdowns(), 1);

    let response = app.clone().oneshot(close()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    execute(&app, "s1", "run_code", json!({"code": "x = 1"})).await;
    assert_eq!(factory.starts(), 2);
}

#[tokio::test]
async fn test_health() {
    let app = router(ScriptedFactory::new());
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"OK");
}
