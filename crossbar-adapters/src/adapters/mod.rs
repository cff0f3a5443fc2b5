//! Adapter abstraction.
//!
//! An adapter executes already-validated, provider-qualified requests
//! (internal model id substituted) against one class of upstream. Every
//! operation takes a [`CallContext`] carrying the request id, a
//! cancellation token and a hard deadline; adapters observe both at each
//! blocking point.
//!
//! Adapters own no provider state. Each invocation is built from an
//! immutable config snapshot and a shared per-provider HTTP client or
//! sandbox executor.

use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::CatalogCache;
use crate::error::AdapterError;
use crate::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, StreamChunk};
use crate::pool::ConnectionPool;
use crate::provider::{HealthSnapshot, ProviderKind, ProviderRecord, VariantConfig};
use crate::sandbox::SandboxExecutor;

pub mod cli;
pub mod http_client;
pub mod local;
pub mod proxy;
pub mod sdk;

/// Lazily-pulled sequence of streaming chunks. Finite, non-restartable;
/// the terminal sentinel is the end of the stream itself.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, AdapterError>> + Send>>;

/// Per-invocation context attached at admission.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Server-generated id, stable across retries of one inbound request.
    pub request_id: String,
    /// Trips on caller disconnect, deadline expiry or admin abort.
    pub cancel: CancellationToken,
    pub deadline: Instant,
    /// Safe subset of inbound headers, consulted by the proxy variant's
    /// forward list.
    pub headers: HashMap<String, String>,
}

impl CallContext {
    pub fn new(request_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            request_id: request_id.into(),
            cancel: CancellationToken::new(),
            deadline: Instant::now() + timeout,
            headers: HashMap::new(),
        }
    }

    /// Time left before the deadline; zero once expired.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Effective timeout for one upstream call: the smaller of the
    /// provider's configured timeout and what is left of the deadline.
    pub fn call_timeout(&self, provider_timeout: Duration) -> Duration {
        provider_timeout.min(self.remaining())
    }

    /// Run a fallible future under this context's cancellation token.
    /// Deadlines are enforced by the callee's own timeout; this only
    /// handles the caller going away.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, AdapterError>
    where
        F: std::future::Future<Output = Result<T, AdapterError>>,
    {
        tokio::select! {
            result = fut => result,
            _ = self.cancel.cancelled() => Err(AdapterError::Cancelled),
        }
    }
}

/// The four-variant upstream strategy interface.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn provider_id(&self) -> &str;

    /// Non-streaming chat completion.
    async fn chat_completion(
        &self,
        request: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse, AdapterError>;

    /// Streaming chat completion. Once the stream is returned, failures
    /// are reported in-band; the dispatcher will not fall back.
    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChunkStream, AdapterError>;

    async fn embeddings(
        &self,
        request: EmbeddingRequest,
        ctx: &CallContext,
    ) -> Result<EmbeddingResponse, AdapterError>;

    /// Cheap liveness probe against the upstream.
    async fn health_probe(&self, ctx: &CallContext) -> Result<HealthSnapshot, AdapterError>;

    /// Model ids the upstream itself advertises.
    async fn list_models(&self, ctx: &CallContext) -> Result<Vec<String>, AdapterError>;

    /// Synthetic end-to-end check used by admin test-connection. Runs
    /// outside rate limiting and never touches usage counters.
    async fn dry_run(&self, ctx: &CallContext) -> Result<(), AdapterError> {
        self.health_probe(ctx).await.map(|_| ())
    }
}

/// Build the adapter for a provider record from its config snapshot.
///
/// `credential` is the already-resolved secret, when the record
/// references one. The record must have passed validation.
pub fn build_adapter(
    record: &ProviderRecord,
    credential: Option<String>,
    pool: &ConnectionPool,
    sandbox: Arc<SandboxExecutor>,
    cache: Arc<CatalogCache>,
) -> Result<Arc<dyn Adapter>, AdapterError> {
    match &record.config {
        VariantConfig::Cli(config) => Ok(Arc::new(cli::CliAdapter::new(
            record.id.clone(),
            config.clone(),
            record
                .models
                .iter()
                .map(|m| m.internal_id.clone())
                .collect(),
            sandbox,
        ))),
        VariantConfig::HttpSdk(config) => Ok(Arc::new(sdk::HttpSdkAdapter::new(
            record.id.clone(),
            config.clone(),
            credential,
            pool,
        )?)),
        VariantConfig::Proxy(config) => Ok(Arc::new(proxy::ProxyAdapter::new(
            record.id.clone(),
            config.clone(),
            credential,
            pool,
        )?)),
        VariantConfig::Local(config) => Ok(Arc::new(local::LocalAdapter::new(
            record.id.clone(),
            config.clone(),
            pool,
            cache,
        )?)),
    }
}
