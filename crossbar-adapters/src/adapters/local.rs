//! Local adapter: loopback or LAN inference servers.
//!
//! Same transport contract as the HTTP-SDK variant, but the wire dialect
//! is not configured up front. On first use the adapter probes the
//! well-known paths (`/v1/models` for OpenAI-dialect servers, `/api/tags`
//! for Ollama) and caches the verdict until the provider is edited or
//! marked unhealthy.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Instant;

use crate::adapters::http_client::{payload_lines, AuthStrategy, HttpProviderClient};
use crate::adapters::{Adapter, CallContext, ChunkStream};
use crate::cache::CatalogCache;
use crate::error::AdapterError;
use crate::models::{
    ChatRequest, ChatResponse, EmbeddingInput, EmbeddingRequest, EmbeddingResponse, Role,
};
use crate::normalize;
use crate::pool::ConnectionPool;
use crate::provider::{HealthSnapshot, HealthStatus, LocalConfig, ProviderKind};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    OpenAi,
    Ollama,
}

impl Dialect {
    fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAi),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }
}

pub struct LocalAdapter {
    provider_id: String,
    config: LocalConfig,
    http: HttpProviderClient,
    cache: Arc<CatalogCache>,
}

impl LocalAdapter {
    pub fn new(
        provider_id: String,
        config: LocalConfig,
        pool: &ConnectionPool,
        cache: Arc<CatalogCache>,
    ) -> Result<Self, AdapterError> {
        let client = pool.client_for(&provider_id, config.max_sockets)?;
        let http = HttpProviderClient::new(
            client,
            &config.base_url,
            &HashMap::new(),
            AuthStrategy::None,
        )?;
        Ok(Self {
            provider_id,
            config,
            http,
            cache,
        })
    }

    fn detect_key(&self) -> String {
        format!("detect:{}", self.provider_id)
    }

    /// Probe well-known paths to classify the service, consulting the
    /// cache first.
    async fn dialect(&self, ctx: &CallContext) -> Result<Dialect, AdapterError> {
        let key = self.detect_key();
        if let Some(cached) = self.cache.get(&key) {
            if let Some(dialect) = cached.as_str().and_then(Dialect::parse) {
                return Ok(dialect);
            }
        }

        let timeout = ctx.call_timeout(self.config.timeout);
        let detected = if self
            .http
            .get_json::<Value>("/v1/models", timeout)
            .await
            .is_ok()
        {
            Dialect::OpenAi
        } else if self
            .http
            .get_json::<Value>("/api/tags", timeout)
            .await
            .is_ok()
        {
            Dialect::Ollama
        } else {
            return Err(AdapterError::transient(format!(
                "local service at {} answered neither /v1/models nor /api/tags",
                self.config.base_url
            )));
        };

        tracing::debug!(
            provider = %self.provider_id,
            dialect = detected.as_str(),
            "local service detected"
        );
        self.cache.set(&key, json!(detected.as_str()), None);
        Ok(detected)
    }

    /// Drop the cached detection, forcing a re-probe on next use.
    pub fn invalidate_detection(&self) {
        self.cache.invalidate(&self.detect_key());
    }

    fn ollama_messages(request: &ChatRequest) -> Vec<Value> {
        request
            .messages
            .iter()
            .map(|msg| {
                json!({
                    "role": match msg.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::System => "system",
                        Role::Tool => "user",
                    },
                    "content": msg.content
                })
            })
            .collect()
    }

    fn ollama_chat_body(request: &ChatRequest, stream: bool) -> Value {
        json!({
            "model": request.model,
            "messages": Self::ollama_messages(request),
            "stream": stream,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            }
        })
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
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
        let raw: Value = match self.dialect(ctx).await? {
            Dialect::OpenAi => {
                let mut body = serde_json::to_value(&request)?;
                body["stream"] = Value::Bool(false);
                ctx.guard(self.http.post_json("/v1/chat/completions", &body, timeout))
                    .await?
            }
            Dialect::Ollama => {
                let body = Self::ollama_chat_body(&request, false);
                ctx.guard(self.http.post_json("/api/chat", &body, timeout))
                    .await?
            }
        };
        normalize::chat_response(raw, &request.model)
    }

    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChunkStream, AdapterError> {
        let timeout = ctx.call_timeout(self.config.timeout);
        let dialect = self.dialect(ctx).await?;
        let response = match dialect {
            Dialect::OpenAi => {
                let mut body = serde_json::to_value(&request)?;
                body["stream"] = Value::Bool(true);
                ctx.guard(
                    self.http
                        .post_json_raw("/v1/chat/completions", &body, timeout),
                )
                .await?
            }
            Dialect::Ollama => {
                let body = Self::ollama_chat_body(&request, true);
                ctx.guard(self.http.post_json_raw("/api/chat", &body, timeout))
                    .await?
            }
        };

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
                            let done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
                            yield normalize::chat_chunk(value, &model, &stream_id, created);
                            if done {
                                return;
                            }
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
        match self.dialect(ctx).await? {
            Dialect::OpenAi => {
                let raw: Value = ctx
                    .guard(self.http.post_json("/v1/embeddings", &request, timeout))
                    .await?;
                normalize::embeddings(raw, &request.model)
            }
            Dialect::Ollama => {
                // Ollama embeds one prompt per call; fan the inputs out.
                let inputs: Vec<String> = match &request.input {
                    EmbeddingInput::String(s) => vec![s.clone()],
                    EmbeddingInput::StringArray(items) => items.clone(),
                };
                let mut vectors = Vec::with_capacity(inputs.len());
                for input in inputs {
                    let body = json!({"model": request.model, "prompt": input});
                    let raw: Value = ctx
                        .guard(self.http.post_json("/api/embeddings", &body, timeout))
                        .await?;
                    let row = raw.get("embedding").cloned().ok_or_else(|| {
                        AdapterError::permanent("ollama embeddings response missing vector")
                    })?;
                    vectors.push(row);
                }
                normalize::embeddings(Value::Array(vectors), &request.model)
            }
        }
    }

    async fn health_probe(&self, ctx: &CallContext) -> Result<HealthSnapshot, AdapterError> {
        let start = Instant::now();
        let result = self.dialect(ctx).await;
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
            Err(_) => {
                // A failed probe also invalidates the cached detection.
                self.invalidate_detection();
                Ok(HealthSnapshot {
                    status: HealthStatus::Unhealthy,
                    latency_ms: Some(latency_ms),
                    error_rate: 1.0,
                    last_check: chrono::Utc::now(),
                    consecutive_failures: 1,
                })
            }
        }
    }

    async fn list_models(&self, ctx: &CallContext) -> Result<Vec<String>, AdapterError> {
        let timeout = ctx.call_timeout(self.config.timeout);
        match self.dialect(ctx).await? {
            Dialect::OpenAi => {
                let raw: Value = ctx
                    .guard(self.http.get_json("/v1/models", timeout))
                    .await?;
                Ok(raw
                    .get("data")
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|e| e.get("id").and_then(Value::as_str))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default())
            }
            Dialect::Ollama => {
                let raw: Value = ctx.guard(self.http.get_json("/api/tags", timeout)).await?;
                Ok(raw
                    .get("models")
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|e| e.get("name").and_then(Value::as_str))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default())
            }
        }
    }
}
