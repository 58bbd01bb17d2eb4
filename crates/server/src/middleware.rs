//! Request middleware: security headers, CORS, rate limiting, request
//! tracing and API key authentication.

use crate::AppState;
use crate::error::ApiError;
use axum::Router;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::net::SocketAddr;
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");

const SECURITY_HEADERS: [(HeaderName, &str); 4] = [
    (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    (header::X_FRAME_OPTIONS, "DENY"),
    (header::X_XSS_PROTECTION, "1; mode=block"),
    (header::REFERRER_POLICY, "strict-origin-when-cross-origin"),
];

/// Wrap the routes in the global middleware stack.
///
/// From the outside in: security headers, request timeout, request tracing,
/// rate limiting, CORS.
pub(crate) fn apply(router: Router<AppState>, state: &AppState) -> Router<AppState> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, API_KEY_HEADER]);

    let mut router = router.layer(cors);
    if state.limiter.is_some() {
        router = router.layer(axum::middleware::from_fn_with_state(state.clone(), rate_limit));
    }
    if state.config.logging.enable_request_logging {
        router = router.layer(TraceLayer::new_for_http());
    }
    let read_timeout = state.config.read_timeout();
    if !read_timeout.is_zero() {
        router = router
            .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, read_timeout))
            .layer(axum::middleware::map_response(envelope_timeouts));
    }
    SECURITY_HEADERS.into_iter().fold(router, |router, (name, value)| {
        router.layer(SetResponseHeaderLayer::overriding(name, HeaderValue::from_static(value)))
    })
}

/// Give the bare timeout response the usual JSON error body.
async fn envelope_timeouts(response: Response) -> Response {
    if response.status() == StatusCode::REQUEST_TIMEOUT && !response.headers().contains_key(header::CONTENT_TYPE) {
        return ApiError::timed_out().into_response();
    }
    response
}

/// Identify the client for rate limiting.
///
/// Proxy headers win when trusted (first `X-Forwarded-For` hop, then
/// `X-Real-IP`), then the peer address.
pub(crate) fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let real_ip = || {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        if let Some(ip) = forwarded.or_else(real_ip) {
            return ip.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(limiter) = &state.limiter {
        let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
        let identity = client_identity(request.headers(), peer, state.config.security.trust_proxy_headers);
        if !limiter.allow(&identity) {
            tracing::warn!(client = %identity, path = %request.uri().path(), "Rate limit exceeded");
            return ApiError::rate_limited().into_response();
        }
    }
    next.run(request).await
}

#[derive(Debug, Default, Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

/// Reject requests that do not carry the API key, either in the
/// `X-API-Key` header or the `key` query parameter.
pub(crate) async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let from_header = request
        .headers()
        .get(&API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let provided = from_header.or_else(|| {
        Query::<KeyQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(query)| query.key)
    });

    let expected = state.config.api_key().as_bytes();
    let authorized = provided.is_some_and(|key| bool::from(key.as_bytes().ct_eq(expected)));
    if !authorized {
        let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
        tracing::warn!(
            client = %client_identity(request.headers(), peer, state.config.security.trust_proxy_headers),
            path = %request.uri().path(),
            "Unauthorized access attempt"
        );
        return ApiError::unauthorized(state.config.text.unauthorized.clone()).into_response();
    }
    next.run(request).await
}
