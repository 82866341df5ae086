//! Defense middleware for axum routers.
//!
//! Resolves the caller identity, buffers the payload for inspection and asks
//! the [`DefenseStack`](crate::security::DefenseStack) for a decision before
//! the wrapped handler runs.

use std::net::SocketAddr;

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use sha2::{Digest, Sha256};

use crate::http::server::AppState;
use crate::security::{Decision, InboundRequest};

pub const X_DEVICE_ID: &str = "x-device-id";
pub const X_API_KEY: &str = "x-api-key";
pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Identity set by an upstream authentication layer.
///
/// Takes precedence over headers and the peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

/// Peer address, or "unknown" when the server was not started with connect info.
fn source_ip(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// API keys are never used as map keys verbatim.
fn key_fingerprint(key: &str) -> String {
    format!("key:{:x}", Sha256::digest(key.as_bytes()))
}

/// Where the identity came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub identity: String,
    /// Taken from a header the client controls.
    pub client_supplied: bool,
}

impl ResolvedIdentity {
    fn trusted(identity: String) -> Self {
        Self {
            identity,
            client_supplied: false,
        }
    }

    fn from_header(identity: String) -> Self {
        Self {
            identity,
            client_supplied: true,
        }
    }
}

/// Identity precedence: extension, device id, api key, peer ip.
pub fn resolve_identity(request: &Request<Body>, source_ip: &str) -> ResolvedIdentity {
    if let Some(CallerIdentity(identity)) = request.extensions().get::<CallerIdentity>() {
        return ResolvedIdentity::trusted(identity.clone());
    }
    if let Some(device) = header_str(request.headers(), X_DEVICE_ID) {
        return ResolvedIdentity::from_header(format!("device:{}", device));
    }
    if let Some(key) = header_str(request.headers(), X_API_KEY) {
        return ResolvedIdentity::from_header(key_fingerprint(key));
    }
    ResolvedIdentity::trusted(source_ip.to_string())
}

/// Uniform rejection; does not say which check failed.
pub fn rejection(retry_after_secs: u64) -> Response {
    let body = serde_json::json!({
        "error": {
            "code": "too_many_requests",
            "message": "Request rejected, retry later",
        }
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs.max(1)));
    response
}

pub async fn defense_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let source_ip = source_ip(&request);
    let resolved = resolve_identity(&request, &source_ip);
    let identity = resolved.identity;

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, state.config.listener.max_body_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            tracing::warn!(identity = %identity, "Request body exceeds inspection limit");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large").into_response();
        }
    };

    let mut inbound = InboundRequest::new(
        identity.clone(),
        source_ip,
        String::from_utf8_lossy(&bytes).into_owned(),
    );
    if resolved.client_supplied && !state.config.listener.trust_identity_headers {
        inbound = inbound.with_source_limit();
    }

    match state.stack.inspect(&inbound) {
        Decision::Allowed {
            remaining, limit, ..
        } => {
            let request = Request::from_parts(parts, Body::from(bytes));
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
            response
        }
        decision => {
            let retry_after = decision.retry_after_secs().unwrap_or(1);
            tracing::info!(identity = %identity, retry_after_secs = retry_after, "Request rejected");
            rejection(retry_after)
        }
    }
}
