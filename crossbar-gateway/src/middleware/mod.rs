//! HTTP middleware: request context, shield, authentication, logging.
//!
//! Order of application (outermost first): CORS, request context,
//! shield + auth, logging, timeout. The shield fires before any key
//! lookup; the operational endpoints skip authentication entirely.

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{self, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::config::CorsConfig;
use crate::gateway_error::ApiError;
use crate::request_context::RequestContext;
use crate::server::AppState;

/// Paths that stay reachable without a key: liveness, readiness,
/// metrics scraping.
fn is_operational(path: &str) -> bool {
    matches!(path, "/healthz" | "/ready" | "/metrics")
}

/// Authentication outcome attached to API requests: `Some` for an
/// authenticated key, `None` when auth is disabled.
#[derive(Debug, Clone)]
pub struct MaybeAuth(pub Option<crate::auth::AuthContext>);

/// Attach a fresh [`RequestContext`] and echo its id in the response.
pub async fn context_middleware(mut req: Request<Body>, next: Next) -> Response {
    let remote_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let context = RequestContext::new(remote_ip);
    let request_id = context.request_id.clone();
    req.extensions_mut().insert(context);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Shield then authenticate then admit. Rejections reuse the standard
/// error envelope with the request id attached.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if req.method() == http::Method::OPTIONS {
        return next.run(req).await;
    }

    let path = req.uri().path().to_string();
    let context = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| RequestContext::new(None));

    // The shield fires before auth so floods never reach a key lookup.
    if let Some(ip) = context.remote_ip {
        if let Err(e) = state.shield.check(ip, &path) {
            return e.into_response_with_id(Some(&context.request_id));
        }
    }

    if is_operational(&path) {
        return next.run(req).await;
    }
    if !state.auth.enabled() {
        req.extensions_mut().insert(MaybeAuth(None));
        return next.run(req).await;
    }

    let header = req
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    let auth_context = match state
        .auth
        .authenticate(header.as_deref(), context.remote_ip)
        .await
    {
        Ok(ctx) => ctx,
        Err(e) => return e.into_response_with_id(Some(&context.request_id)),
    };

    // Admission-layer rate limit: one slot in the key's sliding window.
    if let Err(e) = state.limiter.check_request(&auth_context.key) {
        return e.into_response_with_id(Some(&context.request_id));
    }

    req.extensions_mut().insert(MaybeAuth(Some(auth_context)));
    next.run(req).await
}

pub async fn logging_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let request_id = req
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let response = next.run(req).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %response.status(),
        latency_ms = start.elapsed().as_millis(),
        "request processed"
    );
    response
}

pub fn cors_middleware(config: &CorsConfig) -> CorsLayer {
    if !config.enabled {
        return CorsLayer::new();
    }
    let mut cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.allowed_origins.iter().any(|o| o == "*") {
        cors = cors.allow_origin(Any);
    } else {
        for origin in &config.allowed_origins {
            if let Ok(origin) = origin.parse::<http::HeaderValue>() {
                cors = cors.allow_origin(origin);
            }
        }
    }
    cors
}

/// Handler-side helper: unwrap the auth extension, failing closed if an
/// enabled-auth request somehow arrived without an identity.
pub fn require_auth(
    auth: MaybeAuth,
    enabled: bool,
) -> Result<Option<crate::auth::AuthContext>, ApiError> {
    match (auth.0, enabled) {
        (Some(ctx), _) => Ok(Some(ctx)),
        (None, false) => Ok(None),
        (None, true) => Err(ApiError::invalid_key("missing bearer api key")),
    }
}
