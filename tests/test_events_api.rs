//! SSE hub tests: streaming, dedup, lifecycle events.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use futures_util::StreamExt;
use serde_json::json;
use tower::util::ServiceExt;

use common::{bare_request, json_request, open_app};
use toolgate::events::{Event, EventKind};

/// Reads SSE body chunks until `deadline`, returning everything seen.
async fn drain_sse(body: axum::body::Body, deadline: Duration) -> String {
    let mut stream = body.into_data_stream();
    let mut collected = String::new();
    let _ = tokio::time::timeout(deadline, async {
        while let Some(Ok(chunk)) = stream.next().await {
            collected.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await;
    collected
}

#[tokio::test]
async fn duplicate_event_ids_reach_subscribers_once() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state) = open_app(&dir);

    let bus = state.bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.publish(Event::with_id(EventKind::Message, "e1", json!({"n": 1})));
        bus.publish(Event::with_id(EventKind::Message, "e1", json!({"n": 1})));
        bus.publish(Event::with_id(EventKind::Message, "e2", json!({"n": 2})));
    });

    let response = app.oneshot(bare_request("GET", "/api/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"))
    );

    let collected = drain_sse(response.into_body(), Duration::from_millis(600)).await;
    assert_eq!(collected.matches("\"id\":\"e1\"").count(), 1, "body: {collected}");
    assert_eq!(collected.matches("\"id\":\"e2\"").count(), 1);
}

#[tokio::test]
async fn lifecycle_events_are_streamed() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _state) = open_app(&dir);

    let writer = app.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/templates",
                &json!({"name": "echo", "transport": "stdio", "command": "/bin/cat"}),
            ))
            .await
            .unwrap();
        writer
            .oneshot(json_request("POST", "/api/services", &json!({"templateName": "echo"})))
            .await
            .unwrap();
    });

    let response = app.oneshot(bare_request("GET", "/api/events")).await.unwrap();
    let collected = drain_sse(response.into_body(), Duration::from_millis(800)).await;
    assert!(collected.contains("event: serviceCreated"), "body: {collected}");
    assert!(collected.contains("\"serviceId\""));
}

#[tokio::test]
async fn close_notice_reaches_subscribers_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state) = open_app(&dir);

    let bus = state.bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.publish(Event::new(EventKind::Close, json!({"reason": "shutdown"})));
        bus.close();
    });

    let response = app.oneshot(bare_request("GET", "/api/events")).await.unwrap();
    let collected = drain_sse(response.into_body(), Duration::from_secs(2)).await;
    assert!(collected.contains("event: close"), "body: {collected}");
}
