#![cfg(feature = "server")]

mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use common::{Harness, MOCK, MOCK_MODEL, ScriptedProvider, Step, text};
use kotoba_chat::server::{USER_ID_HEADER, router};
use kotoba_chat::{ErrorCode, FinishReason, ProviderEvent, TokenUsage};
use serde_json::{Value, json};
use tower::ServiceExt;

fn script() -> Vec<Step> {
    vec![
        text("Hello"),
        text(" there"),
        Step::Event(ProviderEvent::Usage(TokenUsage::new(2, 2))),
        Step::Event(ProviderEvent::Finished(FinishReason::Stop)),
    ]
}

fn post(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .header(USER_ID_HEADER, "alice")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn send(harness: &Harness, body: Value) -> Response {
    router(harness.orchestrator.clone())
        .oneshot(post(body))
        .await
        .expect("infallible")
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf-8")
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).expect("json body")
}

#[tokio::test]
async fn streaming_request_answers_with_sse_frames() {
    let harness = Harness::new(ScriptedProvider::new(script()));
    let response = send(
        &harness,
        json!({
            "message": "Hi",
            "provider": MOCK,
            "model": MOCK_MODEL,
            "chunkSize": 64,
            "intervalMs": 1,
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");

    let body = body_text(response).await;
    let order: Vec<_> = ["event: conversation_id", "event: content", "event: metrics", "event: final_message"]
        .iter()
        .map(|name| body.find(name).unwrap_or_else(|| panic!("missing {name} in {body}")))
        .collect();
    assert!(order.windows(2).all(|pair| pair[0] < pair[1]), "{body}");
    assert!(!body.contains("event: error"));
    assert!(body.contains("\"content\":\"Hello there\""), "{body}");
}

#[tokio::test]
async fn non_streaming_request_returns_final_message_json() {
    let harness = Harness::new(ScriptedProvider::new(script()));
    let response = send(
        &harness,
        json!({"message": "Hi", "provider": MOCK, "model": MOCK_MODEL, "stream": false}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["content"], "Hello there");
    assert_eq!(body["promptTokens"], 2);
    assert_eq!(body["tokenCount"], 4);
}

#[tokio::test]
async fn unconfigured_provider_is_a_bad_request_without_streaming() {
    let harness = Harness::new(ScriptedProvider::new(script()));
    let response = send(
        &harness,
        json!({"message": "Hi", "provider": "anthropic", "model": "claude", "stream": false}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["errorCode"], ErrorCode::ProviderNotConfigured.as_str());
}

#[tokio::test]
async fn provider_failure_maps_to_bad_gateway() {
    let harness = Harness::new(ScriptedProvider::new(vec![Step::Error("upstream down".into())]));
    let response = send(
        &harness,
        json!({"message": "Hi", "provider": MOCK, "model": MOCK_MODEL, "stream": false}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["errorCode"], "ProviderTransportError");
}

#[tokio::test]
async fn validation_errors_are_rejected_before_any_stream() {
    let harness = Harness::new(ScriptedProvider::new(script()));

    let empty = send(&harness, json!({"message": "  ", "provider": MOCK, "model": MOCK_MODEL})).await;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(empty).await["errorCode"], "InvalidRequest");

    let bad_attachment = send(
        &harness,
        json!({
            "message": "see file",
            "provider": MOCK,
            "model": MOCK_MODEL,
            "attachments": [{"filename": "a.txt", "contentType": "text/plain", "data": "%%%"}],
        }),
    )
    .await;
    assert_eq!(bad_attachment.status(), StatusCode::BAD_REQUEST);

    let unknown = send(&harness, json!({"message": "Hi", "provider": "nope", "model": "m"})).await;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(unknown).await["errorCode"], "UnknownProvider");
    assert!(harness.usage.metrics().await.is_empty());
}

#[tokio::test]
async fn base64_attachments_reach_the_provider() {
    let provider = ScriptedProvider::new(script());
    let harness = Harness::new(provider.clone());
    let response = send(
        &harness,
        json!({
            "message": "summarize",
            "provider": MOCK,
            "model": MOCK_MODEL,
            "stream": false,
            "attachments": [{"filename": "notes.txt", "contentType": "text/plain", "data": "aGVsbG8="}],
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let seen = provider.seen_requests();
    let turn = seen[0].messages.last().expect("user turn");
    assert!(turn.content.contains("notes.txt\n```\nhello\n```"), "{}", turn.content);
}
