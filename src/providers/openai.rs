use serde_json::Value;

use crate::error::Result;

use super::{
    InboundRequest, Provider, ResponseMetadata, accepts_event_stream, body_sets_stream_true,
    decode_body, sse_data_payloads,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Adapter for the OpenAI API. Also hosts the OpenAI-format request/response
/// introspection that the Groq adapter reuses.
pub struct OpenAiProvider {
    base_url: String,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self::with_base_url(OPENAI_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn upstream_path(&self, local_path: &str) -> String {
        strip_provider_prefix(local_path, "/openai")
    }

    fn is_streaming_request(&self, req: &InboundRequest<'_>) -> bool {
        openai_style_streaming_request("/openai/", req)
    }

    fn parse_response_metadata(&self, body: &[u8], is_streaming: bool) -> Result<ResponseMetadata> {
        if is_streaming {
            parse_openai_stream(self.name(), body)
        } else {
            parse_openai_unary(self.name(), body)
        }
    }

    fn user_id_from_request(&self, req: &InboundRequest<'_>) -> Option<String> {
        openai_user_from_body(req)
    }

    fn extract_model_and_messages(&self, req: &InboundRequest<'_>) -> (Option<String>, Vec<String>) {
        openai_model_and_messages(req)
    }
}

pub(crate) fn strip_provider_prefix(local_path: &str, prefix: &str) -> String {
    let stripped = local_path.strip_prefix(prefix).unwrap_or(local_path);
    if stripped.is_empty() {
        "/".to_string()
    } else {
        stripped.to_string()
    }
}

/// Streaming intent for OpenAI-format endpoints: an SSE accept header, or a
/// POST to a completion-style path whose body asks for `stream: true`.
pub(crate) fn openai_style_streaming_request(prefix: &str, req: &InboundRequest<'_>) -> bool {
    if accepts_event_stream(req) {
        return true;
    }
    if !req.path.starts_with(prefix) || req.method != axum::http::Method::POST {
        return false;
    }
    let completion_path = req.path.contains("/chat/completions")
        || req.path.contains("/completions")
        || req.path.contains("/responses");
    completion_path && body_sets_stream_true(req.body)
}

pub(crate) fn openai_user_from_body(req: &InboundRequest<'_>) -> Option<String> {
    if req.method != axum::http::Method::POST {
        return None;
    }
    let value = req.body_json()?;
    value
        .get("user")
        .and_then(Value::as_str)
        .filter(|user| !user.is_empty())
        .map(str::to_string)
}

pub(crate) fn openai_model_and_messages(req: &InboundRequest<'_>) -> (Option<String>, Vec<String>) {
    let Some(value) = req.body_json() else {
        return (None, Vec::new());
    };

    let model = value
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut messages = Vec::new();
    if let Some(raw_messages) = value.get("messages").and_then(Value::as_array) {
        for message in raw_messages {
            collect_content_text(message.get("content"), &mut messages);
        }
    }

    // The responses API carries `input` instead of `messages`.
    match value.get("input") {
        Some(Value::String(input)) if !input.is_empty() => messages.push(input.clone()),
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::String(text) if !text.is_empty() => messages.push(text.clone()),
                    Value::Object(obj) => {
                        let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
                        if kind == "input_text" || kind == "text" {
                            if let Some(text) = obj.get("text").and_then(Value::as_str) {
                                if !text.is_empty() {
                                    messages.push(text.to_string());
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    if let Some(prompt) = value.get("prompt").and_then(Value::as_str) {
        if !prompt.is_empty() {
            messages.push(prompt.to_string());
        }
    }

    (model, messages)
}

/// Pulls visible text from a chat `content` field, which is either a plain
/// string or an array of typed parts.
pub(crate) fn collect_content_text(content: Option<&Value>, out: &mut Vec<String>) {
    match content {
        Some(Value::String(text)) if !text.is_empty() => out.push(text.clone()),
        Some(Value::Array(parts)) => {
            for part in parts {
                let Some(obj) = part.as_object() else { continue };
                let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
                if kind != "text" && kind != "input_text" {
                    continue;
                }
                if let Some(text) = obj.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        out.push(text.to_string());
                    }
                }
            }
        }
        _ => {}
    }
}

pub(crate) fn parse_openai_unary(provider: &str, body: &[u8]) -> Result<ResponseMetadata> {
    let decoded = decode_body(body);
    let value: Value = serde_json::from_slice(&decoded)?;

    let mut metadata = ResponseMetadata {
        provider: provider.to_string(),
        is_streaming: false,
        ..ResponseMetadata::default()
    };

    if let Some(model) = value.get("model").and_then(Value::as_str) {
        metadata.model = model.to_string();
    }
    if let Some(id) = value.get("id").and_then(Value::as_str) {
        metadata.request_id = id.to_string();
    }
    if let Some(usage) = value.get("usage") {
        metadata.input_tokens = u64_field(usage, "prompt_tokens");
        metadata.output_tokens = u64_field(usage, "completion_tokens");
        metadata.total_tokens = u64_field(usage, "total_tokens");
    }
    if let Some(finish) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("finish_reason"))
        .and_then(Value::as_str)
    {
        metadata.finish_reason = finish.to_string();
    }

    metadata.fill_total();
    Ok(metadata)
}

/// Folds OpenAI streaming chunks. Every chunk is a delta: the model appears
/// on each, `finish_reason` on the last choice, and `usage` only on the
/// final frame when the client asked for `stream_options.include_usage`.
pub(crate) fn parse_openai_stream(provider: &str, body: &[u8]) -> Result<ResponseMetadata> {
    let mut metadata = ResponseMetadata {
        provider: provider.to_string(),
        is_streaming: true,
        ..ResponseMetadata::default()
    };

    for payload in sse_data_payloads(body) {
        if payload == "[DONE]" {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(&payload) else {
            continue;
        };

        if let Some(model) = chunk.get("model").and_then(Value::as_str) {
            if !model.is_empty() {
                metadata.model = model.to_string();
            }
        }
        if let Some(id) = chunk.get("id").and_then(Value::as_str) {
            if !id.is_empty() {
                metadata.request_id = id.to_string();
            }
        }
        if let Some(choices) = chunk.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(finish) = choice.get("finish_reason").and_then(Value::as_str) {
                    metadata.finish_reason = finish.to_string();
                }
            }
        }
        if let Some(usage) = chunk.get("usage").filter(|usage| !usage.is_null()) {
            metadata.input_tokens = u64_field(usage, "prompt_tokens");
            metadata.output_tokens = u64_field(usage, "completion_tokens");
            metadata.total_tokens = u64_field(usage, "total_tokens");
        }
    }

    metadata.fill_total();
    Ok(metadata)
}

pub(crate) fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, Method};

    fn request<'a>(
        method: &'a Method,
        path: &'a str,
        headers: &'a HeaderMap,
        body: &'a [u8],
    ) -> InboundRequest<'a> {
        InboundRequest {
            method,
            path,
            query: None,
            headers,
            body,
        }
    }

    #[test]
    fn parses_unary_chat_completion() {
        let body = br#"{"id":"chatcmpl-1","model":"gpt-4o-mini",
            "usage":{"prompt_tokens":7,"completion_tokens":5,"total_tokens":12},
            "choices":[{"finish_reason":"stop"}]}"#;
        let metadata = parse_openai_unary("openai", body).unwrap();
        assert_eq!(metadata.model, "gpt-4o-mini");
        assert_eq!(metadata.request_id, "chatcmpl-1");
        assert_eq!(metadata.input_tokens, 7);
        assert_eq!(metadata.output_tokens, 5);
        assert_eq!(metadata.total_tokens, 12);
        assert_eq!(metadata.finish_reason, "stop");
        assert!(metadata.has_usage());
    }

    #[test]
    fn unary_parse_fails_on_non_json() {
        assert!(parse_openai_unary("openai", b"<html>bad gateway</html>").is_err());
    }

    #[test]
    fn stream_parse_accumulates_latest_fields() {
        let body = concat!(
            "data: {\"id\":\"chatcmpl-9\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"delta\":{\"content\":\"hi\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"chatcmpl-9\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"chatcmpl-9\",\"model\":\"gpt-4o-mini\",\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":4,\"total_tokens\":13}}\n\n",
            "data: [DONE]\n\n",
        );
        let metadata = parse_openai_stream("openai", body.as_bytes()).unwrap();
        assert_eq!(metadata.model, "gpt-4o-mini");
        assert_eq!(metadata.finish_reason, "stop");
        assert_eq!(metadata.input_tokens, 9);
        assert_eq!(metadata.output_tokens, 4);
        assert_eq!(metadata.total_tokens, 13);
        assert!(metadata.is_streaming);
    }

    #[test]
    fn stream_parse_is_idempotent_over_growing_prefixes() {
        let transcript = concat!(
            "data: {\"id\":\"c\",\"model\":\"gpt-4o\",\"choices\":[{\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c\",\"model\":\"gpt-4o\",\"choices\":[{\"finish_reason\":\"stop\"}],",
            "\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        )
        .as_bytes();

        let full = parse_openai_stream("openai", transcript).unwrap();
        for cut in 0..transcript.len() {
            let partial = parse_openai_stream("openai", &transcript[..cut]).unwrap();
            assert!(partial.total_tokens <= full.total_tokens);
        }
        let replay = parse_openai_stream("openai", transcript).unwrap();
        assert_eq!(replay, full);
    }

    #[test]
    fn detects_streaming_from_body_flag() {
        let method = Method::POST;
        let headers = HeaderMap::new();
        let body = br#"{"model":"gpt-4o-mini","stream":true,"messages":[]}"#;
        let provider = OpenAiProvider::new();
        let req = request(&method, "/openai/v1/chat/completions", &headers, body);
        assert!(provider.is_streaming_request(&req));

        let body = br#"{"model":"gpt-4o-mini","messages":[]}"#;
        let req = request(&method, "/openai/v1/chat/completions", &headers, body);
        assert!(!provider.is_streaming_request(&req));
    }

    #[test]
    fn extracts_user_model_and_messages() {
        let method = Method::POST;
        let headers = HeaderMap::new();
        let body = br#"{"model":"gpt-4o-mini","user":"u-42",
            "messages":[{"role":"user","content":"hello"},
                        {"role":"user","content":[{"type":"text","text":"world"}]}]}"#;
        let provider = OpenAiProvider::new();
        let req = request(&method, "/openai/v1/chat/completions", &headers, body);

        assert_eq!(provider.user_id_from_request(&req).as_deref(), Some("u-42"));
        let (model, messages) = provider.extract_model_and_messages(&req);
        assert_eq!(model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(messages, vec!["hello".to_string(), "world".to_string()]);
    }

    #[test]
    fn strips_provider_prefix_from_path() {
        let provider = OpenAiProvider::new();
        assert_eq!(
            provider.upstream_path("/openai/v1/chat/completions"),
            "/v1/chat/completions"
        );
    }
}
