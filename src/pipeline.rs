//! The request-observation pipeline. One dispatch handler runs the
//! interceptor stages in order: meta-URL rewrite, API-key validation, access
//! logging, rate-limit admission, upstream forwarding, response capture and
//! token parsing, then quota settlement and usage tracking.

use std::net::SocketAddr;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;

use crate::capture::{StreamCapture, StreamFinalizer, capture_stream};
use crate::cost::UsageRecord;
use crate::identity;
use crate::providers::{InboundRequest, ResponseMetadata, is_usage_endpoint, meta_rewrite};
use crate::proxy::{apply_sse_headers, bad_gateway_response};
use crate::ratelimit::{
    Decision, Denial, RequestSubjects, Reservation, estimate_request_tokens,
};
use crate::server::ProxyState;

pub async fn dispatch(
    State(state): State<ProxyState>,
    request: Request,
) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let raw_path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string());

    // Meta-URL rewrite: /meta/<user>/<provider>/... carries identity in the
    // path and must be normalized before anything looks at it.
    let (context_user, path) = match meta_rewrite(&raw_path) {
        Some((user, rewritten)) => (Some(user), rewritten),
        None => (None, raw_path),
    };

    let Some(provider) = state.registry.provider_for_path(&path).cloned() else {
        tracing::warn!(path = %path, "no provider serves this path");
        return error_response(StatusCode::NOT_FOUND, "unknown_provider", "no matching provider");
    };

    let body_bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request_too_large",
                err.to_string(),
            );
        }
    };

    let mut headers = parts.headers.clone();

    // Classification: computed once while the request body is at hand.
    let (is_streaming, tracked, model_hint, messages, user_id, ip_address, raw_api_key) = {
        let inbound = InboundRequest {
            method: &method,
            path: &path,
            query: query.as_deref(),
            headers: &headers,
            body: &body_bytes,
        };
        let is_streaming = provider.is_streaming_request(&inbound);
        let tracked = is_usage_endpoint(&path);
        let (model_hint, messages) = provider.extract_model_and_messages(&inbound);
        let user_id = identity::extract_user_id(
            context_user.as_deref(),
            &inbound,
            Some(provider.as_ref()),
            remote_addr.as_deref(),
        );
        let ip_address = identity::extract_ip_address(&headers, remote_addr.as_deref());
        // Quota identity for the api-key dimension: the credential as the
        // client sent it, before any translation.
        let raw_api_key = inbound
            .header("authorization")
            .and_then(|auth| auth.strip_prefix("Bearer "))
            .or_else(|| inbound.header("x-api-key"))
            .map(str::to_string);
        (
            is_streaming,
            tracked,
            model_hint,
            messages,
            user_id,
            ip_address,
            raw_api_key,
        )
    };

    // API-key validation: translate proxy-opaque keys, reject mismatches.
    if let Some(key_store) = state.key_store.as_ref() {
        if let Err(err) = provider
            .validate_api_key(&mut headers, key_store.as_ref())
            .await
        {
            tracing::warn!(provider = provider.name(), error = %err, "rejected api key");
            return error_response(StatusCode::UNAUTHORIZED, "invalid_api_key", err.to_string());
        }
    }

    // Access logging.
    tracing::info!(
        method = %method,
        path = %path,
        remote = remote_addr.as_deref().unwrap_or(""),
        provider = provider.name(),
        streaming = is_streaming,
        cost_tracked = tracked,
        "started request"
    );
    if !tracked {
        tracing::info!(
            method = %method,
            path = %path,
            provider = provider.name(),
            reason = "non-API endpoint",
            "provider route not tracked"
        );
    }

    // Rate-limit admission with a provisional token reservation.
    let mut reservation: Option<Reservation> = None;
    if let Some(limiter) = state.limiter.as_ref() {
        let estimated =
            estimate_request_tokens(&state.estimation, provider.name(), &body_bytes, &messages);
        let subjects = RequestSubjects {
            user_id: user_id.clone(),
            api_key: raw_api_key,
            model: model_hint.clone(),
            provider: provider.name().to_string(),
        };
        match limiter.reserve(&subjects, estimated).await {
            Decision::Allow(allowed) => reservation = Some(allowed),
            Decision::Deny(denial) => {
                tracing::warn!(
                    user_id = %user_id,
                    reason = %denial.reason,
                    estimated_tokens = estimated,
                    "rate limited"
                );
                return rate_limited_response(&denial);
            }
        }
    }

    // Forward upstream. The body goes out byte-identical to what came in.
    let upstream_response = match state
        .upstream
        .forward(
            provider.as_ref(),
            method.clone(),
            &path,
            query.as_deref(),
            &headers,
            body_bytes.clone(),
        )
        .await
    {
        Ok(response) => response,
        Err(err) => {
            release_reservation(&state, &mut reservation).await;
            tracing::error!(provider = provider.name(), error = %err, "upstream request failed");
            return bad_gateway_response(&err, is_streaming);
        }
    };

    let status = upstream_response.status();
    let mut response_headers = upstream_response.headers().clone();
    // Hop-by-hop: the server re-applies chunking for streamed bodies.
    response_headers.remove(header::TRANSFER_ENCODING);
    let is_sse_response = response_headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("text/event-stream"));

    if is_sse_response {
        apply_sse_headers(&mut response_headers);

        let capture = if tracked {
            StreamCapture::new(provider.clone())
        } else {
            StreamCapture::disabled(provider.clone())
        };
        let finalizer = StreamFinalizer {
            limiter: state.limiter.clone(),
            reservation: reservation.take(),
            tracker: if tracked { state.cost.clone() } else { None },
            user_id,
            ip_address,
            request_path: path,
            model_hint,
        };

        let upstream_stream = upstream_response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        let stream = capture_stream(upstream_stream, capture, finalizer);

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        return response;
    }

    // Unary response. Only usage-endpoint responses small enough to be a
    // usage envelope are buffered for parsing; everything else streams
    // through untouched.
    let content_length = response_headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    let parseable = tracked
        && status.is_success()
        && content_length.map_or(true, |len| len <= state.usage_max_body_bytes);
    if !parseable {
        release_reservation(&state, &mut reservation).await;
        let stream = upstream_response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        return response;
    }

    let body_result = upstream_response.bytes().await;
    let response_body = match body_result {
        Ok(bytes) => bytes,
        Err(err) => {
            release_reservation(&state, &mut reservation).await;
            let err = crate::ProxyError::from(err);
            tracing::error!(provider = provider.name(), error = %err, "failed reading upstream body");
            return bad_gateway_response(&err, false);
        }
    };

    let mut metadata: Option<ResponseMetadata> = None;
    if tracked && status.is_success() {
        match provider.parse_response_metadata(&response_body, false) {
            Ok(parsed) if parsed.has_usage() => metadata = Some(parsed),
            Ok(_) => {
                tracing::debug!(provider = provider.name(), "response carried no usage");
            }
            Err(err) => {
                tracing::warn!(provider = provider.name(), error = %err, "failed to parse response metadata");
            }
        }
    }

    match metadata {
        Some(mut metadata) => {
            if metadata.model.is_empty() {
                if let Some(hint) = model_hint {
                    metadata.model = hint;
                }
            }

            if let (Some(limiter), Some(allowed)) = (state.limiter.as_ref(), reservation.take()) {
                limiter.commit(allowed, metadata.input_tokens).await;
            }

            apply_usage_headers(&mut response_headers, &metadata);

            if let Some(tracker) = state.cost.as_ref() {
                let record =
                    UsageRecord::from_metadata(&metadata, user_id, ip_address, path.clone());
                tracker.track(record).await;
            }
        }
        None => release_reservation(&state, &mut reservation).await,
    }

    tracing::info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        streaming = false,
        "completed request"
    );

    let mut response = Response::new(Body::from(response_body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

async fn release_reservation(state: &ProxyState, reservation: &mut Option<Reservation>) {
    if let (Some(limiter), Some(allowed)) = (state.limiter.as_ref(), reservation.take()) {
        limiter.release(allowed).await;
    }
}

fn apply_usage_headers(headers: &mut HeaderMap, metadata: &ResponseMetadata) {
    let pairs = [
        ("x-llm-provider", metadata.provider.clone()),
        ("x-llm-model", metadata.model.clone()),
        ("x-llm-input-tokens", metadata.input_tokens.to_string()),
        ("x-llm-output-tokens", metadata.output_tokens.to_string()),
        ("x-llm-total-tokens", metadata.total_tokens.to_string()),
        ("x-llm-thought-tokens", metadata.thought_tokens.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = value.parse() {
            headers.insert(name, value);
        }
    }
    if !metadata.request_id.is_empty() {
        if let Ok(value) = metadata.request_id.parse() {
            headers.insert("x-llm-request-id", value);
        }
    }
}

pub(crate) fn error_response(
    status: StatusCode,
    error: &'static str,
    reason: impl Into<String>,
) -> Response {
    let body = serde_json::json!({
        "error": error,
        "reason": reason.into(),
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn rate_limited_response(denial: &Denial) -> Response {
    let body = serde_json::json!({
        "error": "rate_limited",
        "reason": &denial.reason,
    });
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response();

    let headers = response.headers_mut();
    let pairs = [
        ("retry-after", denial.retry_after_secs.to_string()),
        ("x-ratelimit-limit", denial.limit.to_string()),
        ("x-ratelimit-remaining", denial.remaining.to_string()),
        ("x-ratelimit-reset", denial.reset_epoch.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = value.parse() {
            headers.insert(name, value);
        }
    }
    response
}
