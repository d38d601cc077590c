use crate::error::Result;

use super::openai::{
    openai_model_and_messages, openai_style_streaming_request, openai_user_from_body,
    parse_openai_stream, parse_openai_unary, strip_provider_prefix,
};
use super::{InboundRequest, Provider, ResponseMetadata};

const GROQ_BASE_URL: &str = "https://api.groq.com";

/// Adapter for Groq's OpenAI-compatible API. Request and response formats
/// are OpenAI's; only the base URL and the `/openai` path mount differ.
pub struct GroqProvider {
    base_url: String,
}

impl GroqProvider {
    pub fn new() -> Self {
        Self::with_base_url(GROQ_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for GroqProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Provider for GroqProvider {
    fn name(&self) -> &'static str {
        "groq"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn upstream_path(&self, local_path: &str) -> String {
        // Groq exposes the OpenAI-compatible API under /openai.
        let stripped = strip_provider_prefix(local_path, "/groq");
        if stripped.starts_with("/openai/") {
            stripped
        } else {
            format!("/openai{stripped}")
        }
    }

    fn is_streaming_request(&self, req: &InboundRequest<'_>) -> bool {
        openai_style_streaming_request("/groq/", req)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mounts_openai_compatible_subtree() {
        let provider = GroqProvider::new();
        assert_eq!(
            provider.upstream_path("/groq/v1/chat/completions"),
            "/openai/v1/chat/completions"
        );
        assert_eq!(
            provider.upstream_path("/groq/openai/v1/models"),
            "/openai/v1/models"
        );
    }

    #[test]
    fn parses_with_groq_provider_name() {
        let body = br#"{"id":"chatcmpl-g1","model":"llama-3.3-70b",
            "usage":{"prompt_tokens":4,"completion_tokens":3,"total_tokens":7},
            "choices":[{"finish_reason":"stop"}]}"#;
        let provider = GroqProvider::new();
        let metadata = provider.parse_response_metadata(body, false).unwrap();
        assert_eq!(metadata.provider, "groq");
        assert_eq!(metadata.model, "llama-3.3-70b");
        assert_eq!(metadata.total_tokens, 7);
    }
}
