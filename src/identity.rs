//! User and client-address identification, in the priority order the rest of
//! the pipeline depends on (quota keys and usage records both use it).

use axum::http::HeaderMap;

use crate::providers::{InboundRequest, Provider};

/// Resolves the user identity for a request:
/// meta-URL context > `X-User-ID` header > provider body field >
/// `llm_user_id` query > bearer-token prefix > client address.
pub fn extract_user_id(
    context_user: Option<&str>,
    req: &InboundRequest<'_>,
    provider: Option<&dyn Provider>,
    remote_addr: Option<&str>,
) -> String {
    if let Some(user) = context_user.filter(|user| !user.is_empty()) {
        return user.to_string();
    }

    if let Some(user) = req.header("x-user-id").filter(|user| !user.is_empty()) {
        return user.to_string();
    }

    if let Some(provider) = provider {
        if let Some(user) = provider.user_id_from_request(req) {
            return user;
        }
    }

    if let Some(user) = req.query_param("llm_user_id").filter(|user| !user.is_empty()) {
        return user.to_string();
    }

    if let Some(auth) = req.header("authorization") {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            // Only a short prefix, so the identity is stable without logging
            // the credential itself.
            let prefix = if token.len() > 8 { &token[..8] } else { token };
            return format!("token:{prefix}");
        }
    }

    format!("ip:{}", extract_ip_address(req.headers, remote_addr))
}

/// Client address: forwarded headers win over the socket peer.
pub fn extract_ip_address(headers: &HeaderMap, remote_addr: Option<&str>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        return forwarded.to_string();
    }

    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        return real_ip.to_string();
    }

    remote_addr.unwrap_or_default().to_string()
}
