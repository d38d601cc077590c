use serde_json::Value;

use crate::error::Result;

use super::openai::{collect_content_text, strip_provider_prefix, u64_field};
use super::{
    InboundRequest, Provider, ResponseMetadata, accepts_event_stream, body_sets_stream_true,
    decode_body, sse_data_payloads,
};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// Adapter for the Anthropic Messages API.
pub struct AnthropicProvider {
    base_url: String,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        Self::with_base_url(ANTHROPIC_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn upstream_path(&self, local_path: &str) -> String {
        strip_provider_prefix(local_path, "/anthropic")
    }

    fn is_streaming_request(&self, req: &InboundRequest<'_>) -> bool {
        if accepts_event_stream(req) {
            return true;
        }
        req.path.starts_with("/anthropic/")
            && req.method == axum::http::Method::POST
            && req.path.contains("/messages")
            && body_sets_stream_true(req.body)
    }

    fn parse_response_metadata(&self, body: &[u8], is_streaming: bool) -> Result<ResponseMetadata> {
        if is_streaming {
            parse_anthropic_stream(body)
        } else {
            parse_anthropic_unary(body)
        }
    }

    fn user_id_from_request(&self, req: &InboundRequest<'_>) -> Option<String> {
        if req.method != axum::http::Method::POST {
            return None;
        }
        let value = req.body_json()?;
        value
            .get("metadata")
            .and_then(|metadata| metadata.get("user_id"))
            .and_then(Value::as_str)
            .filter(|user| !user.is_empty())
            .map(str::to_string)
    }

    fn extract_model_and_messages(&self, req: &InboundRequest<'_>) -> (Option<String>, Vec<String>) {
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
        // A system prompt counts toward input tokens too; it is either a
        // plain string or an array of text blocks.
        collect_content_text(value.get("system"), &mut messages);

        (model, messages)
    }
}

fn parse_anthropic_unary(body: &[u8]) -> Result<ResponseMetadata> {
    let decoded = decode_body(body);
    let value: Value = serde_json::from_slice(&decoded)?;

    let mut metadata = ResponseMetadata {
        provider: "anthropic".to_string(),
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
        metadata.input_tokens = u64_field(usage, "input_tokens");
        metadata.output_tokens = u64_field(usage, "output_tokens");
    }
    if let Some(stop) = value.get("stop_reason").and_then(Value::as_str) {
        metadata.finish_reason = stop.to_string();
    }

    // Anthropic reports no total; it is always the sum.
    metadata.fill_total();
    Ok(metadata)
}

/// Folds the Anthropic event stream. `message_start` carries the input-token
/// count and model; each `message_delta` carries the cumulative output-token
/// count, so the last one seen wins.
fn parse_anthropic_stream(body: &[u8]) -> Result<ResponseMetadata> {
    let mut metadata = ResponseMetadata {
        provider: "anthropic".to_string(),
        is_streaming: true,
        ..ResponseMetadata::default()
    };

    for payload in sse_data_payloads(body) {
        if payload == "[DONE]" {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(&payload) else {
            continue;
        };

        match event.get("type").and_then(Value::as_str).unwrap_or_default() {
            "message_start" => {
                let Some(message) = event.get("message") else {
                    continue;
                };
                if let Some(model) = message.get("model").and_then(Value::as_str) {
                    metadata.model = model.to_string();
                }
                if let Some(id) = message.get("id").and_then(Value::as_str) {
                    metadata.request_id = id.to_string();
                }
                if let Some(usage) = message.get("usage") {
                    metadata.input_tokens = u64_field(usage, "input_tokens");
                    metadata.output_tokens = u64_field(usage, "output_tokens");
                }
            }
            "message_delta" => {
                if let Some(usage) = event.get("usage") {
                    let output = u64_field(usage, "output_tokens");
                    if output > 0 {
                        metadata.output_tokens = output;
                    }
                }
                if let Some(stop) = event
                    .get("delta")
                    .and_then(|delta| delta.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    metadata.finish_reason = stop.to_string();
                }
            }
            _ => {}
        }
    }

    metadata.fill_total();
    Ok(metadata)
}
