//! Provider adapters: one per upstream API, plus the registry that resolves
//! the adapter responsible for an inbound request path.

mod anthropic;
mod gemini;
mod groq;
mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use groq::GroqProvider;
pub use openai::OpenAiProvider;

use std::borrow::Cow;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::http::{HeaderMap, Method};
use flate2::read::GzDecoder;

use crate::error::{ProxyError, Result};
use crate::keys::{self, ApiKeyStore};
use crate::server::ProxyState;

/// Token usage and model identity extracted from a provider response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseMetadata {
    pub provider: String,
    pub model: String,
    pub request_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Gemini-only: hidden reasoning tokens, separate from visible output.
    pub thought_tokens: u64,
    pub total_tokens: u64,
    pub finish_reason: String,
    pub is_streaming: bool,
}

impl ResponseMetadata {
    pub fn has_usage(&self) -> bool {
        self.total_tokens > 0
    }

    /// The upstream may report a total above input+output (overhead tokens);
    /// when it reports none, the sum stands in.
    pub(crate) fn fill_total(&mut self) {
        if self.total_tokens == 0 {
            self.total_tokens = self.input_tokens.saturating_add(self.output_tokens);
        }
    }
}

/// Borrowed view of an inbound request after the meta-URL rewrite. `path` is
/// the local proxy path (e.g. `/openai/v1/chat/completions`), never the
/// upstream path.
pub struct InboundRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

impl InboundRequest<'_> {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        let query = self.query?;
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name).then_some(value)
        })
    }

    pub(crate) fn body_json(&self) -> Option<serde_json::Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(self.body).ok()
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Upstream origin, scheme included.
    fn base_url(&self) -> &str;

    /// Maps the local proxy path to the path sent upstream (provider prefix
    /// stripped; Groq additionally mounts the OpenAI-compatible subtree).
    fn upstream_path(&self, local_path: &str) -> String;

    fn is_streaming_request(&self, req: &InboundRequest<'_>) -> bool;

    /// Parses token usage out of a response body. For streams the input is
    /// the cumulative SSE transcript seen so far; re-invoking on a longer
    /// prefix of the same transcript never yields a less complete answer.
    fn parse_response_metadata(&self, body: &[u8], is_streaming: bool) -> Result<ResponseMetadata>;

    /// Provider-specific user field from the request body (`user`,
    /// `metadata.user_id`, ...).
    fn user_id_from_request(&self, req: &InboundRequest<'_>) -> Option<String>;

    /// Model plus visible message text, used only for admission-time token
    /// estimation.
    fn extract_model_and_messages(&self, req: &InboundRequest<'_>) -> (Option<String>, Vec<String>);

    /// Translates a proxy-owned opaque key in the auth headers to the real
    /// upstream key. Fails when the key is unknown or bound to another
    /// provider.
    async fn validate_api_key(
        &self,
        headers: &mut HeaderMap,
        key_store: &dyn ApiKeyStore,
    ) -> Result<()> {
        translate_proxy_key(self.name(), headers, key_store).await
    }

    fn health_status(&self) -> serde_json::Value {
        serde_json::json!({
            "provider": self.name(),
            "status": "healthy",
            "base_url": self.base_url(),
            "streaming_support": true,
            "body_parsing": true,
        })
    }

    /// Compatibility aliases, if the provider needs any. No-op by default.
    fn register_extra_routes(&self, router: Router<ProxyState>) -> Router<ProxyState> {
        router
    }
}

/// Insertion-ordered provider registry. Populated once at startup, read-only
/// afterwards.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard set: openai, anthropic, gemini, groq.
    pub fn with_default_providers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiProvider::new()));
        registry.register(Arc::new(AnthropicProvider::new()));
        registry.register(Arc::new(GeminiProvider::new()));
        registry.register(Arc::new(GroqProvider::new()));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.push(provider);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter()
    }

    /// Resolves the adapter for a request path, understanding both
    /// `/<provider>/...` and `/meta/<user>/<provider>/...` shapes.
    pub fn provider_for_path(&self, path: &str) -> Option<&Arc<dyn Provider>> {
        self.get(provider_name_from_path(path)?)
    }
}

/// Extracts the provider segment from a request path, if any.
pub fn provider_name_from_path(path: &str) -> Option<&str> {
    let mut parts = path.split('/').skip(1);
    let first = parts.next()?;
    if first == "meta" {
        let _user = parts.next()?;
        return parts.next().filter(|segment| !segment.is_empty());
    }
    (!first.is_empty()).then_some(first)
}

/// Splits `/meta/<user>/<provider>/<rest>` into the user id and the
/// equivalent direct path `/<provider>/<rest>`.
pub fn meta_rewrite(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix("/meta/")?;
    let (user_id, provider_path) = rest.split_once('/')?;
    if user_id.is_empty() || provider_path.is_empty() {
        return None;
    }
    Some((user_id.to_string(), format!("/{provider_path}")))
}

/// Whether the path is one of the completion-style endpoints whose responses
/// carry token usage worth metering.
pub fn is_usage_endpoint(path: &str) -> bool {
    path.contains("/chat/completions")
        || path.contains("/completions")
        || path.contains("/messages")
        || path.contains(":generateContent")
        || path.contains(":streamGenerateContent")
}

/// Rewrites `Authorization` / `x-api-key` when they carry a proxy-owned
/// opaque key. Shared by every adapter; they differ only in provider name.
pub(crate) async fn translate_proxy_key(
    provider_name: &str,
    headers: &mut HeaderMap,
    key_store: &dyn ApiKeyStore,
) -> Result<()> {
    for header_name in ["authorization", "x-api-key"] {
        let Some(raw) = headers.get(header_name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let (bearer, token) = match raw.strip_prefix("Bearer ") {
            Some(token) => (true, token.trim()),
            None if header_name == "x-api-key" => (false, raw.trim()),
            None => continue,
        };

        if !keys::is_proxy_key(token) {
            continue;
        }

        let resolved = key_store
            .resolve(token)
            .await?
            .ok_or_else(|| ProxyError::ApiKey("unknown proxy api key".to_string()))?;

        if !resolved.provider.is_empty() && resolved.provider != provider_name {
            return Err(ProxyError::ApiKey(format!(
                "api key is bound to provider {}, not {provider_name}",
                resolved.provider
            )));
        }

        let rewritten = if bearer {
            format!("Bearer {}", resolved.upstream_key)
        } else {
            resolved.upstream_key.clone()
        };
        if let Ok(value) = rewritten.parse() {
            headers.insert(header_name, value);
            tracing::debug!(provider = provider_name, "translated proxy api key");
        }
    }
    Ok(())
}

/// Payloads of every *complete* SSE frame in the buffer. A trailing partial
/// frame (no blank-line terminator yet) is left for the next pass, which is
/// what makes re-parsing a growing buffer idempotent.
pub(crate) fn sse_data_payloads(buf: &[u8]) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut start = 0usize;
    let mut idx = 0usize;

    while idx < buf.len() {
        let delimiter_len = if buf[idx..].starts_with(b"\n\n") {
            2
        } else if buf[idx..].starts_with(b"\r\n\r\n") {
            4
        } else {
            idx += 1;
            continue;
        };

        if let Some(data) = sse_frame_data(&buf[start..idx]) {
            payloads.push(data);
        }
        idx += delimiter_len;
        start = idx;
    }

    payloads
}

fn sse_frame_data(frame: &[u8]) -> Option<String> {
    let frame = std::str::from_utf8(frame).ok()?;
    let mut data = String::new();
    for line in frame.lines() {
        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        if !data.is_empty() {
            data.push('\n');
        }
        data.push_str(rest.trim_start());
    }
    (!data.is_empty()).then_some(data)
}

/// Transparently inflates gzip-encoded bodies (magic bytes 0x1f 0x8b) before
/// JSON parsing. The forwarded bytes are never touched.
pub(crate) fn decode_body(bytes: &[u8]) -> Cow<'_, [u8]> {
    if bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b {
        let mut inflated = Vec::new();
        if GzDecoder::new(bytes).read_to_end(&mut inflated).is_ok() {
            return Cow::Owned(inflated);
        }
    }
    Cow::Borrowed(bytes)
}

/// `"stream": true` in a JSON request body.
pub(crate) fn body_sets_stream_true(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

pub(crate) fn accepts_event_stream(req: &InboundRequest<'_>) -> bool {
    req.header("accept")
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_provider_from_direct_path() {
        assert_eq!(
            provider_name_from_path("/openai/v1/chat/completions"),
            Some("openai")
        );
        assert_eq!(provider_name_from_path("/groq/v1/models"), Some("groq"));
        assert_eq!(provider_name_from_path("/health"), Some("health"));
        assert_eq!(provider_name_from_path("/"), None);
    }

    #[test]
    fn resolves_provider_from_meta_path() {
        assert_eq!(
            provider_name_from_path("/meta/user-1/anthropic/v1/messages"),
            Some("anthropic")
        );
        assert_eq!(provider_name_from_path("/meta/user-1"), None);
    }

    #[test]
    fn meta_rewrite_strips_user_segment() {
        let (user, path) = meta_rewrite("/meta/alice/openai/v1/chat/completions").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(path, "/openai/v1/chat/completions");
        assert!(meta_rewrite("/openai/v1/chat/completions").is_none());
    }

    #[test]
    fn registry_resolves_all_default_providers() {
        let registry = ProviderRegistry::with_default_providers();
        for (path, name) in [
            ("/openai/v1/chat/completions", "openai"),
            ("/anthropic/v1/messages", "anthropic"),
            ("/gemini/v1/models/gemini-pro:generateContent", "gemini"),
            ("/groq/v1/chat/completions", "groq"),
            ("/meta/u1/groq/v1/chat/completions", "groq"),
        ] {
            let provider = registry.provider_for_path(path).expect(path);
            assert_eq!(provider.name(), name);
        }
        assert!(registry.provider_for_path("/unknown/path").is_none());
    }

    #[test]
    fn usage_endpoints_match_completion_shapes() {
        assert!(is_usage_endpoint("/openai/v1/chat/completions"));
        assert!(is_usage_endpoint("/anthropic/v1/messages"));
        assert!(is_usage_endpoint(
            "/gemini/v1beta/models/gemini-2.0-flash:generateContent"
        ));
        assert!(!is_usage_endpoint("/openai/health"));
        assert!(!is_usage_endpoint("/openai/v1/models"));
    }

    #[test]
    fn sse_payloads_ignore_trailing_partial_frame() {
        let buf = b"event: x\ndata: {\"a\":1}\n\ndata: line1\ndata: line2\n\ndata: {\"partial\":";
        let payloads = sse_data_payloads(buf);
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "line1\nline2".to_string()]);
    }

    #[test]
    fn sse_payloads_handle_crlf_delimiters() {
        let buf = b"data: {\"a\":1}\r\n\r\ndata: [DONE]\r\n\r\n";
        let payloads = sse_data_payloads(buf);
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn decode_body_inflates_gzip() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decode_body(&compressed).as_ref(), b"{\"ok\":true}");
        assert_eq!(decode_body(b"plain").as_ref(), b"plain");
    }
}
