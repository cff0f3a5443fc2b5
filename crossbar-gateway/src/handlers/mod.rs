//! HTTP request handlers for the OpenAI-compatible and operational
//! endpoints.
//!
//! Each handler runs after the middleware stack has attached a request
//! context and (for the API endpoints) an authenticated key. The flow
//! per request: permission check, token pre-charge, dispatch with
//! fallback, reconcile, record usage and metrics.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Response, StatusCode};
use axum::response::Json;
use axum::Extension;
use serde_json::{json, Value};
use std::time::Instant;

use crossbar_adapters::adapters::CallContext;
use crossbar_adapters::models::{ChatRequest, EmbeddingRequest, ModelList};

use crate::auth::{AuthContext, Permission, TokenCharge};
use crate::middleware::MaybeAuth;
use crate::gateway_error::ApiError;
use crate::metrics::{metrics, RequestRecord};
use crate::request_context::RequestContext;
use crate::server::AppState;
use crate::streaming::sse_response;
use crate::usage::UsageEvent;

/// Fallback output allowance used for the pre-charge when the caller
/// does not cap `max_tokens`.
const DEFAULT_OUTPUT_ALLOWANCE: u32 = 512;

/// Inbound headers that may be offered to the proxy variant's forward
/// list. Credentials and transport headers never qualify.
fn forwardable_headers(headers: &HeaderMap) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            match name.as_str() {
                "authorization" | "host" | "content-length" | "content-type" | "connection"
                | "transfer-encoding" | "accept-encoding" => None,
                _ => value
                    .to_str()
                    .ok()
                    .map(|v| (name, v.to_string())),
            }
        })
        .collect()
}

fn call_context(
    state: &AppState,
    context: &RequestContext,
    headers: &HeaderMap,
) -> CallContext {
    let mut ctx = CallContext::new(context.request_id.clone(), state.config.server.timeout);
    ctx.headers = forwardable_headers(headers);
    ctx
}

fn precharge(
    state: &AppState,
    auth: Option<&AuthContext>,
    estimated: u32,
) -> Result<Option<TokenCharge>, ApiError> {
    match auth {
        Some(ctx) => Ok(Some(state.limiter.precharge_tokens(&ctx.key, estimated)?)),
        None => Ok(None),
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Extension(maybe_auth): Extension<MaybeAuth>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response<Body>, Response<Body>> {
    let request_id = context.request_id.clone();
    let fail = |e: ApiError| e.into_response_with_id(Some(&request_id));

    let auth = crate::middleware::require_auth(maybe_auth, state.auth.enabled()).map_err(fail)?;

    if let Some(ctx) = &auth {
        ctx.require(Permission::Chat).map_err(fail)?;
        ctx.require_model(&request.model).map_err(fail)?;
    }
    if request.model.is_empty() {
        return Err(fail(ApiError::invalid_request("model is required")));
    }
    if request.messages.is_empty() {
        return Err(fail(ApiError::invalid_request(
            "messages must not be empty",
        )));
    }

    let estimated = request.estimate_prompt_tokens()
        + request.max_tokens.unwrap_or(DEFAULT_OUTPUT_ALLOWANCE);
    let charge = precharge(&state, auth.as_ref(), estimated).map_err(fail)?;

    let ctx = call_context(&state, &context, &headers);
    let model = request.model.clone();
    let streaming = request.stream.unwrap_or(false);
    let started = Instant::now();

    if streaming {
        let (stream, meta) = state
            .dispatcher
            .chat_stream(request, &ctx)
            .await
            .map_err(|e| fail(ApiError::from(e)))?;

        metrics().record_request(&RequestRecord {
            provider: Some(meta.provider_id.clone()),
            model: Some(model.clone()),
            attempt: meta.attempts,
            success: true,
            latency: started.elapsed(),
            input_tokens: 0,
            output_tokens: 0,
        });

        // In-band billing from here on: the stream guard settles usage
        // for whatever is actually emitted, including on disconnect.
        return Ok(sse_response(
            stream,
            model,
            request_id,
            auth.map(|a| a.key.id.clone()),
            ctx.cancel.clone(),
            state.usage.clone(),
        ));
    }

    let result = state.dispatcher.chat(request, &ctx).await;
    let latency = started.elapsed();

    match result {
        Ok((response, meta)) => {
            let usage = response.usage;
            if let (Some(auth), Some(charge)) = (&auth, &charge) {
                state.limiter.reconcile(charge, usage.total_tokens);
                state.usage.record(UsageEvent {
                    request_id: request_id.clone(),
                    key_id: auth.key.id.clone(),
                    tokens: usage.total_tokens as u64,
                });
            }
            metrics().record_request(&RequestRecord {
                provider: Some(meta.provider_id),
                model: Some(model),
                attempt: meta.attempts,
                success: true,
                latency,
                input_tokens: usage.prompt_tokens as u64,
                output_tokens: usage.completion_tokens as u64,
            });

            let body = serde_json::to_string(&response)
                .map_err(|e| fail(ApiError::internal(e.to_string())))?;
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap())
        }
        Err(e) => {
            // A failed request consumed no output tokens; hand the whole
            // pre-charge back.
            if let Some(charge) = &charge {
                state.limiter.reconcile(charge, 0);
            }
            metrics().record_request(&RequestRecord {
                provider: None,
                model: Some(model),
                attempt: 0,
                success: false,
                latency,
                input_tokens: 0,
                output_tokens: 0,
            });
            Err(fail(ApiError::from(e)))
        }
    }
}

pub async fn embeddings(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Extension(maybe_auth): Extension<MaybeAuth>,
    headers: HeaderMap,
    Json(request): Json<EmbeddingRequest>,
) -> Result<Json<crossbar_adapters::models::EmbeddingResponse>, Response<Body>> {
    let request_id = context.request_id.clone();
    let fail = |e: ApiError| e.into_response_with_id(Some(&request_id));

    let auth = crate::middleware::require_auth(maybe_auth, state.auth.enabled()).map_err(fail)?;

    if let Some(ctx) = &auth {
        ctx.require(Permission::Embeddings).map_err(fail)?;
        ctx.require_model(&request.model).map_err(fail)?;
    }
    if request.input.is_empty() {
        return Err(fail(ApiError::invalid_request(
            "input must contain at least one string",
        )));
    }

    let estimated = (request.input.char_len() / 4) as u32 + 8;
    let charge = precharge(&state, auth.as_ref(), estimated).map_err(fail)?;

    let ctx = call_context(&state, &context, &headers);
    let model = request.model.clone();
    let started = Instant::now();
    let result = state.dispatcher.embeddings(request, &ctx).await;
    let latency = started.elapsed();

    match result {
        Ok((response, meta)) => {
            if let (Some(auth), Some(charge)) = (&auth, &charge) {
                state.limiter.reconcile(charge, response.usage.total_tokens);
                state.usage.record(UsageEvent {
                    request_id,
                    key_id: auth.key.id.clone(),
                    tokens: response.usage.total_tokens as u64,
                });
            }
            metrics().record_request(&RequestRecord {
                provider: Some(meta.provider_id),
                model: Some(model),
                attempt: meta.attempts,
                success: true,
                latency,
                input_tokens: response.usage.prompt_tokens as u64,
                output_tokens: 0,
            });
            Ok(Json(response))
        }
        Err(e) => {
            if let Some(charge) = &charge {
                state.limiter.reconcile(charge, 0);
            }
            metrics().record_request(&RequestRecord {
                provider: None,
                model: Some(model),
                attempt: 0,
                success: false,
                latency,
                input_tokens: 0,
                output_tokens: 0,
            });
            Err(fail(ApiError::from(e)))
        }
    }
}

pub async fn list_models(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Extension(maybe_auth): Extension<MaybeAuth>,
) -> Result<Json<ModelList>, Response<Body>> {
    let fail = |e: ApiError| e.into_response_with_id(Some(&context.request_id));

    let auth = crate::middleware::require_auth(maybe_auth, state.auth.enabled()).map_err(fail)?;
    if let Some(ctx) = &auth {
        ctx.require(Permission::Models).map_err(fail)?;
    }

    let mut data = state.dispatcher.models();
    // Keys with a model filter only see what they may use.
    if let Some(ctx) = &auth {
        if !ctx.key.allowed_models.is_empty() {
            data.retain(|entry| ctx.key.model_allowed(&entry.id));
        }
    }

    Ok(Json(ModelList {
        object: "list".to_string(),
        data,
    }))
}

/// Liveness: the process is up.
pub async fn healthz() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": metrics().uptime().as_secs(),
    }))
}

/// Readiness: the store answers and at least one provider is enabled.
pub async fn ready(State(state): State<AppState>) -> Response<Body> {
    let store_ok = state.store.ping().await.is_ok();
    let provider_ok = state.registry.snapshot().any_enabled();

    let status = if store_ok && provider_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let store_state = if store_ok { "ok" } else { "unreachable" };
    let provider_state = if provider_ok { "ok" } else { "none enabled" };
    let body = json!({
        "store": store_state,
        "providers": provider_state,
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Prometheus text exposition.
pub async fn prometheus_metrics(State(state): State<AppState>) -> Response<Body> {
    let breakers = state.dispatcher.breakers().snapshot();
    let text = metrics().render_prometheus(&breakers);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(text))
        .unwrap()
}
