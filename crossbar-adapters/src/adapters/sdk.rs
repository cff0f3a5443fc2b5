//! HTTP-SDK adapter: authenticated OpenAI-dialect HTTPS upstreams.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Instant;

use crate::adapters::http_client::{payload_lines, AuthStrategy, HttpProviderClient};
use crate::adapters::{Adapter, CallContext, ChunkStream};
use crate::error::AdapterError;
use crate::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::normalize;
use crate::pool::ConnectionPool;
use crate::provider::{AuthMode, HealthSnapshot, HealthStatus, HttpConfig, ProviderKind};

pub struct HttpSdkAdapter {
    provider_id: String,
    config: HttpConfig,
    http: HttpProviderClient,
}

impl HttpSdkAdapter {
    pub fn new(
        provider_id: String,
        config: HttpConfig,
        credential: Option<String>,
        pool: &ConnectionPool,
    ) -> Result<Self, AdapterError> {
        let auth = match (&config.auth, credential) {
            (AuthMode::None, _) => AuthStrategy::None,
            (AuthMode::Bearer, Some(token)) => AuthStrategy::Bearer { token },
            (AuthMode::ApiKeyHeader { header }, Some(value)) => AuthStrategy::Header {
                name: header.clone(),
                value,
            },
            (AuthMode::Basic { username }, Some(password)) => AuthStrategy::Basic {
                username: username.clone(),
                password,
            },
            (_, None) => {
                return Err(AdapterError::config(format!(
                    "provider {provider_id} requires a credential but none resolved"
                )))
            }
        };
        let client = pool.client_for(&provider_id, config.max_sockets)?;
        let http = HttpProviderClient::new(client, &config.base_url, &config.headers, auth)?;
        Ok(Self {
            provider_id,
            config,
            http,
        })
    }

    fn chat_body(request: &ChatRequest, stream: bool) -> Value {
        let mut body = serde_json::to_value(request).unwrap_or_else(|_| json!({}));
        body["stream"] = Value::Bool(stream);
        body
    }
}

#[async_trait]
impl Adapter for HttpSdkAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::HttpSdk
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn chat_completion(
        &self,
        request: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse, AdapterError> {
        let timeout = ctx.call_timeout(self.config.timeout);
        let body = Self::chat_body(&request, false);
        let raw: Value = ctx
            .guard(self.http.post_json("/chat/completions", &body, timeout))
            .await?;
        normalize::chat_response(raw, &request.model)
    }

    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChunkStream, AdapterError> {
        let timeout = ctx.call_timeout(self.config.timeout);
        let body = Self::chat_body(&request, true);
        let response = ctx
            .guard(self.http.post_json_raw("/chat/completions", &body, timeout))
            .await?;

        let model = request.model.clone();
        let stream_id = normalize::new_completion_id();
        let created = normalize::now_unix();
        let cancel = ctx.cancel.clone();

        let stream = async_stream::stream! {
            let mut lines = Box::pin(payload_lines(response));
            loop {
                let next = tokio::select! {
                    line = futures::StreamExt::next(&mut lines) => line,
                    _ = cancel.cancelled() => {
                        yield Err(AdapterError::Cancelled);
                        return;
                    }
                };
                let Some(line) = next else { return };
                match line {
                    Ok(payload) => match serde_json::from_str::<Value>(&payload) {
                        Ok(value) => {
                            yield normalize::chat_chunk(value, &model, &stream_id, created);
                        }
                        Err(e) => {
                            yield Err(AdapterError::permanent(format!(
                                "unparsable stream frame: {e}"
                            )));
                            return;
                        }
                    },
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embeddings(
        &self,
        request: EmbeddingRequest,
        ctx: &CallContext,
    ) -> Result<EmbeddingResponse, AdapterError> {
        let timeout = ctx.call_timeout(self.config.timeout);
        let raw: Value = ctx
            .guard(self.http.post_json("/embeddings", &request, timeout))
            .await?;
        normalize::embeddings(raw, &request.model)
    }

    async fn health_probe(&self, ctx: &CallContext) -> Result<HealthSnapshot, AdapterError> {
        let timeout = ctx.call_timeout(self.config.timeout);
        let start = Instant::now();
        let result: Result<Value, AdapterError> =
            ctx.guard(self.http.get_json("/models", timeout)).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(_) => Ok(HealthSnapshot {
                status: HealthStatus::Healthy,
                latency_ms: Some(latency_ms),
                error_rate: 0.0,
                last_check: chrono::Utc::now(),
                consecutive_failures: 0,
            }),
            Err(AdapterError::Cancelled) => Err(AdapterError::Cancelled),
            Err(_) => Ok(HealthSnapshot {
                status: HealthStatus::Unhealthy,
                latency_ms: Some(latency_ms),
                error_rate: 1.0,
                last_check: chrono::Utc::now(),
                consecutive_failures: 1,
            }),
        }
    }

    async fn list_models(&self, ctx: &CallContext) -> Result<Vec<String>, AdapterError> {
        let timeout = ctx.call_timeout(self.config.timeout);
        let raw: Value = ctx.guard(self.http.get_json("/models", timeout)).await?;
        let ids = raw
            .get("data")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }
}
