//! Upstream forwarding engine: a single shared keep-alive client, with the
//! per-adapter URL rewrite applied on the way out. Bodies pass through
//! unchanged in both directions.

use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;

use crate::error::{ProxyError, Result};
use crate::providers::Provider;

/// Idle read timeout on upstream responses. There is deliberately no overall
/// request timeout: streams run as long as the upstream keeps producing.
const UPSTREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Upstream {
    client: reqwest::Client,
}

impl Upstream {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .read_timeout(UPSTREAM_READ_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Forwards a request to the provider's upstream. `local_path` is the
    /// proxy-side path; the adapter decides what the upstream sees.
    pub async fn forward(
        &self,
        provider: &dyn Provider,
        method: Method,
        local_path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let upstream_path = provider.upstream_path(local_path);
        let url = match query {
            Some(query) => format!("{}{}?{}", provider.base_url(), upstream_path, query),
            None => format!("{}{}", provider.base_url(), upstream_path),
        };

        let mut outgoing = headers.clone();
        sanitize_forward_headers(&mut outgoing);

        let response = self
            .client
            .request(method, &url)
            .headers(outgoing)
            .body(body)
            .send()
            .await?;
        Ok(response)
    }
}

/// Host is rewritten by the client for the upstream origin; Content-Length
/// and Transfer-Encoding are hop-by-hop and recomputed for the forwarded
/// body.
fn sanitize_forward_headers(headers: &mut HeaderMap) {
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
}

/// SSE responses must reach the client frame by frame: kill intermediary
/// buffering and drop the (meaningless) Content-Length.
pub fn apply_sse_headers(headers: &mut HeaderMap) {
    headers.insert(header::CACHE_CONTROL, "no-cache".parse().expect("static"));
    headers.insert(header::CONNECTION, "keep-alive".parse().expect("static"));
    headers.insert("x-accel-buffering", "no".parse().expect("static"));
    headers.remove(header::CONTENT_LENGTH);
}

/// 502 for upstream dial/transport failures. For a streaming request whose
/// response has not started, the error is delivered as a single SSE frame so
/// event-stream clients terminate cleanly.
pub fn bad_gateway_response(err: &ProxyError, streaming: bool) -> Response {
    if streaming {
        let error_json = serde_json::json!({ "error": format!("Proxy error: {err}") });
        let body = format!("data: {error_json}\n\ndata: [DONE]\n\n");
        Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(body))
            .unwrap_or_default()
    } else {
        let body = serde_json::json!({
            "error": "upstream_error",
            "reason": err.to_string(),
        });
        Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_default()
    }
}
