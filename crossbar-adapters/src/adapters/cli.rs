//! CLI adapter: pre-configured commands in sandbox containers.
//!
//! The whole request is serialized to one JSON document and delivered on
//! the child's stdin; nothing the caller sent ever appears in argv or the
//! environment. The child answers with a JSON document on stdout, or a
//! sequence of newline-delimited JSON objects when streaming.
//!
//! Exit classification: non-zero exit with no parsable stdout is
//! transient (the tool crashed); a clean exit with unparsable stdout is
//! permanent (the tool is broken); a non-zero exit alongside parsable
//! output is treated as a permanent tool error.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

use crate::adapters::{Adapter, CallContext, ChunkStream};
use crate::error::AdapterError;
use crate::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::normalize;
use crate::provider::{CliConfig, HealthSnapshot, HealthStatus, ProviderKind};
use crate::sandbox::{SandboxExecutor, SandboxOutput};

pub struct CliAdapter {
    provider_id: String,
    config: CliConfig,
    /// Internal model ids from the record's mappings; the container has
    /// no catalog endpoint of its own.
    advertised_models: Vec<String>,
    executor: Arc<SandboxExecutor>,
}

impl CliAdapter {
    pub fn new(
        provider_id: String,
        config: CliConfig,
        advertised_models: Vec<String>,
        executor: Arc<SandboxExecutor>,
    ) -> Self {
        Self {
            provider_id,
            config,
            advertised_models,
            executor,
        }
    }

    fn classify(&self, output: SandboxOutput) -> Result<Value, AdapterError> {
        if output.timed_out {
            return Err(AdapterError::Timeout);
        }
        let parsed: Result<Value, _> = serde_json::from_slice(&output.stdout);
        match (output.exit_code, parsed) {
            (Some(0), Ok(value)) => Ok(value),
            (Some(0), Err(e)) => Err(AdapterError::permanent(format!(
                "tool exited cleanly but stdout is not JSON: {e}"
            ))),
            (code, Ok(value)) => {
                let message = value
                    .get("error")
                    .and_then(|e| e.as_str().map(str::to_string))
                    .unwrap_or_else(|| format!("tool exited with status {code:?}"));
                Err(AdapterError::permanent(message))
            }
            (code, Err(_)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail: String = stderr.chars().rev().take(512).collect::<Vec<_>>().iter().rev().collect();
                Err(AdapterError::transient(format!(
                    "tool exited with status {code:?}: {tail}"
                )))
            }
        }
    }

    async fn invoke(&self, payload: &Value, ctx: &CallContext) -> Result<Value, AdapterError> {
        let stdin = serde_json::to_vec(payload)?;
        let timeout = ctx.call_timeout(self.config.timeout);
        let output = self
            .executor
            .run(&self.config, &stdin, timeout, &ctx.cancel)
            .await?;
        self.classify(output)
    }
}

#[async_trait]
impl Adapter for CliAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cli
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn chat_completion(
        &self,
        request: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse, AdapterError> {
        let payload = serde_json::to_value(&request)?;
        let raw = self.invoke(&payload, ctx).await?;
        match normalize::chat_response(raw.clone(), &request.model) {
            Ok(response) => Ok(response),
            Err(AdapterError::PermanentUpstream { .. }) => {
                // Valid JSON in no recognized chat shape: the document
                // itself is the tool's answer; surface it as content.
                normalize::chat_response(Value::String(raw.to_string()), &request.model)
            }
            Err(e) => Err(e),
        }
    }

    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChunkStream, AdapterError> {
        if !self.config.supports_streaming {
            return Err(AdapterError::bad_request(format!(
                "provider {} does not support streaming",
                self.provider_id
            )));
        }

        let mut payload = serde_json::to_value(&request)?;
        payload["stream"] = Value::Bool(true);
        let stdin = serde_json::to_vec(&payload)?;

        let timeout = ctx.call_timeout(self.config.timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut child = self
            .executor
            .spawn_streaming(&self.config, &stdin, &ctx.cancel)
            .await?;

        let model = request.model.clone();
        let stream_id = normalize::new_completion_id();
        let created = normalize::now_unix();
        let cancel = ctx.cancel.clone();

        let stream = async_stream::stream! {
            let mut line = String::new();
            loop {
                line.clear();
                let read = tokio::select! {
                    read = child.lines.read_line(&mut line) => read,
                    _ = tokio::time::sleep_until(deadline) => {
                        child.terminate().await;
                        yield Err(AdapterError::Timeout);
                        return;
                    }
                    _ = cancel.cancelled() => {
                        child.terminate().await;
                        yield Err(AdapterError::Cancelled);
                        return;
                    }
                };
                match read {
                    Ok(0) => {
                        // EOF; reap the child and finish the stream.
                        child.wait().await;
                        return;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(trimmed) {
                            Ok(value) => {
                                yield normalize::chat_chunk(value, &model, &stream_id, created);
                            }
                            Err(e) => {
                                child.terminate().await;
                                yield Err(AdapterError::permanent(format!(
                                    "unparsable stream line from tool: {e}"
                                )));
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        child.terminate().await;
                        yield Err(AdapterError::transient(format!(
                            "stream read from tool failed: {e}"
                        )));
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
        let payload = serde_json::to_value(&request)?;
        let raw = self.invoke(&payload, ctx).await?;
        normalize::embeddings(raw, &request.model)
    }

    /// CLI providers have no liveness endpoint; a probe validates the
    /// command and image against the sandbox policy instead.
    async fn health_probe(&self, _ctx: &CallContext) -> Result<HealthSnapshot, AdapterError> {
        let status = match self.executor.plan(&self.config) {
            Ok(_) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        Ok(HealthSnapshot {
            status,
            latency_ms: None,
            error_rate: 0.0,
            last_check: chrono::Utc::now(),
            consecutive_failures: 0,
        })
    }

    async fn list_models(&self, _ctx: &CallContext) -> Result<Vec<String>, AdapterError> {
        Ok(self.advertised_models.clone())
    }

    /// Test-connection for CLI providers runs the command end to end
    /// with a minimal document, proving image, sandbox and stdin plumbing.
    async fn dry_run(&self, ctx: &CallContext) -> Result<(), AdapterError> {
        self.executor.plan(&self.config)?;
        let probe = serde_json::json!({
            "model": self.advertised_models.first().cloned().unwrap_or_default(),
            "messages": [{"role": "user", "content": "ping"}]
        });
        self.invoke(&probe, ctx).await.map(|_| ())
    }
}
