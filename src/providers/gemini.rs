use serde_json::Value;

use crate::error::Result;

use super::openai::{strip_provider_prefix, u64_field};
use super::{
    InboundRequest, Provider, ResponseMetadata, accepts_event_stream, decode_body,
    sse_data_payloads,
};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Adapter for the Google Gemini (generativelanguage) API.
pub struct GeminiProvider {
    base_url: String,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self::with_base_url(GEMINI_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn upstream_path(&self, local_path: &str) -> String {
        strip_provider_prefix(local_path, "/gemini")
    }

    fn is_streaming_request(&self, req: &InboundRequest<'_>) -> bool {
        // Gemini streams through an explicit operation or the `alt=sse`
        // query; there is no body-level stream flag.
        req.path.contains(":streamGenerateContent")
            || req.query_param("alt") == Some("sse")
            || accepts_event_stream(req)
    }

    fn parse_response_metadata(&self, body: &[u8], is_streaming: bool) -> Result<ResponseMetadata> {
        if is_streaming {
            parse_gemini_stream(body)
        } else {
            parse_gemini_unary(body)
        }
    }

    fn user_id_from_request(&self, _req: &InboundRequest<'_>) -> Option<String> {
        // The generateContent request schema has no caller-identity field.
        None
    }

    fn extract_model_and_messages(&self, req: &InboundRequest<'_>) -> (Option<String>, Vec<String>) {
        let model = model_from_path(req.path).map(str::to_string);

        let mut messages = Vec::new();
        if let Some(value) = req.body_json() {
            if let Some(contents) = value.get("contents").and_then(Value::as_array) {
                for content in contents {
                    collect_part_text(content, &mut messages);
                }
            }
            if let Some(system) = value.get("systemInstruction") {
                collect_part_text(system, &mut messages);
            }
        }

        (model, messages)
    }
}

/// `/gemini/v1beta/models/gemini-2.0-flash:generateContent` → `gemini-2.0-flash`.
pub(crate) fn model_from_path(path: &str) -> Option<&str> {
    let (_, rest) = path.split_once("/models/")?;
    let model = rest.split_once(':').map(|(model, _)| model).unwrap_or(rest);
    (!model.is_empty()).then_some(model)
}

fn collect_part_text(content: &Value, out: &mut Vec<String>) {
    let Some(parts) = content.get("parts").and_then(Value::as_array) else {
        return;
    };
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                out.push(text.to_string());
            }
        }
    }
}

fn apply_gemini_chunk(metadata: &mut ResponseMetadata, value: &Value) {
    if let Some(model) = value.get("modelVersion").and_then(Value::as_str) {
        metadata.model = model.to_string();
    }
    if let Some(id) = value.get("responseId").and_then(Value::as_str) {
        metadata.request_id = id.to_string();
    }
    if let Some(usage) = value.get("usageMetadata") {
        metadata.input_tokens = u64_field(usage, "promptTokenCount");
        metadata.output_tokens = u64_field(usage, "candidatesTokenCount");
        metadata.thought_tokens = u64_field(usage, "thoughtsTokenCount");
        metadata.total_tokens = u64_field(usage, "totalTokenCount");
    }
    if let Some(finish) = value
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("finishReason"))
        .and_then(Value::as_str)
    {
        metadata.finish_reason = finish.to_string();
    }
}

fn parse_gemini_unary(body: &[u8]) -> Result<ResponseMetadata> {
    let decoded = decode_body(body);
    let value: Value = serde_json::from_slice(&decoded)?;

    let mut metadata = ResponseMetadata {
        provider: "gemini".to_string(),
        is_streaming: false,
        ..ResponseMetadata::default()
    };
    apply_gemini_chunk(&mut metadata, &value);
    metadata.fill_total();
    Ok(metadata)
}

/// Every SSE chunk is a full candidate-shaped object; `usageMetadata`
/// (including `thoughtsTokenCount`) arrives on the final chunk.
fn parse_gemini_stream(body: &[u8]) -> Result<ResponseMetadata> {
    let mut metadata = ResponseMetadata {
        provider: "gemini".to_string(),
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
        apply_gemini_chunk(&mut metadata, &chunk);
    }

    metadata.fill_total();
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unary_generate_content() {
        let body = br#"{"responseId":"resp-1","modelVersion":"gemini-2.0-flash",
            "candidates":[{"finishReason":"STOP"}],
            "usageMetadata":{"promptTokenCount":8,"candidatesTokenCount":12,
                             "thoughtsTokenCount":3,"totalTokenCount":23}}"#;
        let metadata = parse_gemini_unary(body).unwrap();
        assert_eq!(metadata.model, "gemini-2.0-flash");
        assert_eq!(metadata.request_id, "resp-1");
        assert_eq!(metadata.input_tokens, 8);
        assert_eq!(metadata.output_tokens, 12);
        assert_eq!(metadata.thought_tokens, 3);
        assert_eq!(metadata.total_tokens, 23);
        assert_eq!(metadata.finish_reason, "STOP");
    }

    #[test]
    fn total_exceeding_sum_is_preserved() {
        // thought tokens make the reported total larger than input+output
        let body = br#"{"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":5,
                         "thoughtsTokenCount":7,"totalTokenCount":17}}"#;
        let metadata = parse_gemini_unary(body).unwrap();
        assert_eq!(metadata.total_tokens, 17);
        assert!(metadata.total_tokens >= metadata.input_tokens + metadata.output_tokens);
    }

    #[test]
    fn stream_usage_arrives_on_final_chunk() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}],\"modelVersion\":\"gemini-2.0-flash\"}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":8,\"candidatesTokenCount\":12,\"thoughtsTokenCount\":3,\"totalTokenCount\":23},",
            "\"modelVersion\":\"gemini-2.0-flash\",\"responseId\":\"resp-9\"}\n\n",
        );
        let metadata = parse_gemini_stream(body.as_bytes()).unwrap();
        assert_eq!(metadata.input_tokens, 8);
        assert_eq!(metadata.output_tokens, 12);
        assert_eq!(metadata.thought_tokens, 3);
        assert_eq!(metadata.total_tokens, 23);
        assert_eq!(metadata.request_id, "resp-9");
    }

    #[test]
    fn detects_streaming_intent() {
        let method = axum::http::Method::POST;
        let headers = axum::http::HeaderMap::new();
        let provider = GeminiProvider::new();

        let req = InboundRequest {
            method: &method,
            path: "/gemini/v1beta/models/gemini-2.0-flash:streamGenerateContent",
            query: None,
            headers: &headers,
            body: b"{}",
        };
        assert!(provider.is_streaming_request(&req));

        let req = InboundRequest {
            method: &method,
            path: "/gemini/v1beta/models/gemini-2.0-flash:generateContent",
            query: Some("key=K&alt=sse"),
            headers: &headers,
            body: b"{}",
        };
        assert!(provider.is_streaming_request(&req));

        let req = InboundRequest {
            method: &method,
            path: "/gemini/v1beta/models/gemini-2.0-flash:generateContent",
            query: Some("key=K"),
            headers: &headers,
            body: b"{}",
        };
        assert!(!provider.is_streaming_request(&req));
    }

    #[test]
    fn model_from_path_handles_operation_suffix() {
        assert_eq!(
            model_from_path("/gemini/v1beta/models/gemini-2.0-flash:generateContent"),
            Some("gemini-2.0-flash")
        );
        assert_eq!(model_from_path("/gemini/v1/models"), None);
    }
}
