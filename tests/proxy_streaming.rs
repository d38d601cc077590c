mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use tower::ServiceExt;

use common::{recording_tracker, state_for};

#[tokio::test]
async fn anthropic_stream_is_forwarded_unchanged_and_metered() {
    let upstream = MockServer::start();
    let transcript = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-sonnet-4\",\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":4}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/messages");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(transcript);
    });

    let (tracker, records) = recording_tracker();
    let state = state_for(&upstream.base_url()).with_cost_tracker(tracker);
    let app = llm_proxy::build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/anthropic/v1/messages")
        .header("content-type", "application/json")
        .header("x-user-id", "user-2")
        .body(Body::from(
            r#"{"model":"claude-sonnet-4","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // SSE responses must not advertise a Content-Length and must disable
    // intermediary buffering.
    let headers = response.headers().clone();
    assert!(headers.get("content-length").is_none());
    assert_eq!(headers.get("cache-control").unwrap(), "no-cache");
    assert_eq!(headers.get("x-accel-buffering").unwrap(), "no");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes, transcript.as_bytes());
    mock.assert();

    let records = records.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].provider, "anthropic");
    assert_eq!(records[0].model, "claude-sonnet-4");
    assert_eq!(records[0].input_tokens, 10);
    assert_eq!(records[0].output_tokens, 4);
    assert_eq!(records[0].total_tokens, 14);
    assert_eq!(records[0].finish_reason, "end_turn");
    assert!(records[0].is_streaming);
    assert_eq!(records[0].user_id, "user-2");
}

#[tokio::test]
async fn anthropic_stream_truncated_before_stop_still_produces_a_record() {
    // The upstream connection ends right after message_delta (client abort
    // propagated): the best-known usage must still be recorded.
    let upstream = MockServer::start();
    let transcript = concat!(
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_2\",\"model\":\"claude-sonnet-4\",\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"x\"}}\n\n",
        "data: {\"type\":\"message_delta\",\"delta\":{},\"usage\":{\"output_tokens\":4}}\n\n",
    );
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/messages");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(transcript);
    });

    let (tracker, records) = recording_tracker();
    let state = state_for(&upstream.base_url()).with_cost_tracker(tracker);
    let app = llm_proxy::build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/anthropic/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"claude-sonnet-4","stream":true,"messages":[]}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();

    let records = records.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].input_tokens, 10);
    assert_eq!(records[0].output_tokens, 4);
}

#[tokio::test]
async fn gemini_sse_via_alt_sse_captures_thought_tokens() {
    let upstream = MockServer::start();
    let transcript = concat!(
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}],\"modelVersion\":\"gemini-2.0-flash\"}\n\n",
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],",
        "\"usageMetadata\":{\"promptTokenCount\":8,\"candidatesTokenCount\":12,\"thoughtsTokenCount\":3,\"totalTokenCount\":23},",
        "\"modelVersion\":\"gemini-2.0-flash\",\"responseId\":\"resp-7\"}\n\n",
    );
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1beta/models/gemini-2.0-flash:generateContent")
            .query_param("alt", "sse");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(transcript);
    });

    let (tracker, records) = recording_tracker();
    let state = state_for(&upstream.base_url()).with_cost_tracker(tracker);
    let app = llm_proxy::build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/gemini/v1beta/models/gemini-2.0-flash:generateContent?key=K&alt=sse")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"contents":[{"parts":[{"text":"hi"}]}]}"#,
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes, transcript.as_bytes());
    mock.assert();

    let records = records.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].provider, "gemini");
    assert_eq!(records[0].model, "gemini-2.0-flash");
    assert_eq!(records[0].input_tokens, 8);
    assert_eq!(records[0].output_tokens, 12);
    assert_eq!(records[0].thought_tokens, 3);
    assert_eq!(records[0].total_tokens, 23);
    assert_eq!(records[0].request_id, "resp-7");
}

#[tokio::test]
async fn stream_without_usage_produces_no_record() {
    let upstream = MockServer::start();
    // OpenAI stream without stream_options.include_usage: no usage frame.
    let transcript = concat!(
        "data: {\"id\":\"chatcmpl-s\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"delta\":{\"content\":\"hi\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"chatcmpl-s\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(transcript);
    });

    let (tracker, records) = recording_tracker();
    let state = state_for(&upstream.base_url()).with_cost_tracker(tracker);
    let app = llm_proxy::build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/openai/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"gpt-4o-mini","stream":true,"messages":[]}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes, transcript.as_bytes());
    assert!(records.records().is_empty());
}
