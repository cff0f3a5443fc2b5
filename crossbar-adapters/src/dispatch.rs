//! The dispatcher: breaker gate, retry, fallback.
//!
//! One inbound request keeps one server-side request id across every
//! attempt. Candidates come ordered from the resolver; transient
//! failures and breaker short-circuits advance to the next candidate,
//! everything else surfaces immediately. Retries back off exponentially
//! with full jitter, and only attempts that actually contacted the
//! upstream count against the breaker.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use futures::StreamExt;

use crate::adapters::{build_adapter, Adapter, CallContext, ChunkStream};
use crate::breaker::{BreakerDecision, BreakerTable};
use crate::cache::CatalogCache;
use crate::error::AdapterError;
use crate::models::{
    ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, ModelEntry,
};
use crate::pool::{AdmitError, ConnectionPool, Priority, QueuePermit, RequestQueue};
use crate::registry::{Candidate, ProviderRegistry};
use crate::sandbox::SandboxExecutor;
use crate::secrets::{resolve_credential, SecretsBackend};

const MODELS_CACHE_KEY: &str = "models:union";
const MODELS_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("model {model} not found")]
    ModelNotFound { model: String },

    #[error("gateway at capacity")]
    AtCapacity,

    #[error(transparent)]
    Upstream(#[from] AdapterError),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upstream-contacting attempts per inbound request.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with full jitter for the given attempt
    /// (1-based; the first attempt never sleeps).
    fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = self
            .base_delay
            .saturating_mul(1u32 << (attempt - 2).min(16));
        let capped = exp.min(self.max_delay);
        if capped.is_zero() {
            return capped;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=capped.as_millis() as u64))
    }
}

/// Which provider ultimately served a request, for logging and usage.
#[derive(Debug, Clone)]
pub struct DispatchMeta {
    pub provider_id: String,
    pub attempts: u32,
}

pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    breakers: Arc<BreakerTable>,
    pool: Arc<ConnectionPool>,
    queue: Arc<RequestQueue>,
    sandbox: Arc<SandboxExecutor>,
    secrets: Arc<dyn SecretsBackend>,
    cache: Arc<CatalogCache>,
    retry: RetryPolicy,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breakers: Arc<BreakerTable>,
        pool: Arc<ConnectionPool>,
        queue: Arc<RequestQueue>,
        sandbox: Arc<SandboxExecutor>,
        secrets: Arc<dyn SecretsBackend>,
        cache: Arc<CatalogCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            breakers,
            pool,
            queue,
            sandbox,
            secrets,
            cache,
            retry,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerTable> {
        &self.breakers
    }

    /// Non-streaming chat completion with fallback.
    pub async fn chat(
        &self,
        request: ChatRequest,
        ctx: &CallContext,
    ) -> Result<(ChatResponse, DispatchMeta), DispatchError> {
        let external_model = request.model.clone();
        let (response, meta, _permit) = self
            .run_with_fallback(&external_model, ctx, |candidate, adapter, call| {
                let request = request.clone();
                let external_model = external_model.clone();
                async move {
                    validate_chat(&request, &candidate)?;
                    let mut upstream = request;
                    upstream.model = candidate.mapping.internal_id.clone();
                    let mut response = adapter.chat_completion(upstream, &call).await?;
                    response.model = external_model;
                    Ok(response)
                }
            })
            .await?;
        Ok((response, meta))
    }

    /// Embeddings with fallback.
    pub async fn embeddings(
        &self,
        request: EmbeddingRequest,
        ctx: &CallContext,
    ) -> Result<(EmbeddingResponse, DispatchMeta), DispatchError> {
        let external_model = request.model.clone();
        let (response, meta, _permit) = self
            .run_with_fallback(&external_model, ctx, |candidate, adapter, call| {
                let request = request.clone();
                let external_model = external_model.clone();
                async move {
                    if !candidate.mapping.supports_embeddings {
                        return Err(AdapterError::bad_request(format!(
                            "model {external_model} does not support embeddings"
                        )));
                    }
                    let mut upstream = request;
                    upstream.model = candidate.mapping.internal_id.clone();
                    let mut response = adapter.embeddings(upstream, &call).await?;
                    response.model = external_model;
                    Ok(response)
                }
            })
            .await?;
        Ok((response, meta))
    }

    /// Streaming chat. Fallback applies only until a stream is acquired;
    /// after that the response is committed and failures flow in-band.
    pub async fn chat_stream(
        &self,
        request: ChatRequest,
        ctx: &CallContext,
    ) -> Result<(ChunkStream, DispatchMeta), DispatchError> {
        let external_model = request.model.clone();
        let (stream, meta, permit) = self
            .run_with_fallback(&external_model, ctx, |candidate, adapter, call| {
                let request = request.clone();
                async move {
                    validate_chat(&request, &candidate)?;
                    if !candidate.mapping.supports_streaming {
                        return Err(AdapterError::bad_request(format!(
                            "model {} does not support streaming",
                            request.model
                        )));
                    }
                    let mut upstream = request;
                    upstream.model = candidate.mapping.internal_id.clone();
                    adapter.stream_chat_completion(upstream, &call).await
                }
            })
            .await?;

        // Rewrite the model field on every chunk and feed terminal
        // outcomes back into the breaker and stats tables. The queue
        // permit rides along so the provider slot stays held until the
        // stream is drained or dropped.
        let registry = Arc::clone(&self.registry);
        let breakers = Arc::clone(&self.breakers);
        let provider_id = meta.provider_id.clone();
        let wrapped = stream.map(move |item| {
            let _ = &permit;
            match item {
                Ok(mut chunk) => {
                    chunk.model = external_model.clone();
                    Ok(chunk)
                }
                Err(e) => {
                    if e.trips_breaker() {
                        breakers.on_failure(&provider_id, e.is_retryable(), &e.to_string());
                        registry.record_outcome(&provider_id, false);
                    }
                    Err(e)
                }
            }
        });
        Ok((Box::pin(wrapped), meta))
    }

    /// The union of external models, served from the 30-second cache.
    pub fn models(&self) -> Vec<ModelEntry> {
        if let Some(cached) = self.cache.get(MODELS_CACHE_KEY) {
            if let Ok(models) = serde_json::from_value(cached) {
                return models;
            }
        }
        let models = self.registry.snapshot().external_models();
        if let Ok(value) = serde_json::to_value(&models) {
            self.cache.set(MODELS_CACHE_KEY, value, Some(MODELS_CACHE_TTL));
        }
        models
    }

    pub fn invalidate_model_cache(&self) {
        self.cache.invalidate(MODELS_CACHE_KEY);
    }

    /// Drop everything derived from one provider's config: its cached
    /// service detection and its pooled HTTP client. Called when the
    /// record is edited or removed.
    pub fn invalidate_provider(&self, provider_id: &str) {
        self.cache.invalidate_prefix(&format!("detect:{provider_id}"));
        self.pool.evict(provider_id);
    }

    /// Admin test-connection: a synthetic request straight through the
    /// adapter. No rate limiting, no queue, no usage accounting.
    pub async fn test_connection(
        &self,
        provider_id: &str,
        ctx: &CallContext,
    ) -> Result<(), DispatchError> {
        let snapshot = self.registry.snapshot();
        let record = snapshot
            .get(provider_id)
            .ok_or_else(|| DispatchError::ModelNotFound {
                model: provider_id.to_string(),
            })?;
        let adapter = self.adapter_for(record).await?;
        adapter.dry_run(ctx).await.map_err(DispatchError::from)
    }

    async fn adapter_for(
        &self,
        record: &Arc<crate::provider::ProviderRecord>,
    ) -> Result<Arc<dyn Adapter>, AdapterError> {
        let secret_ref = match &record.config {
            crate::provider::VariantConfig::HttpSdk(c) => c.secret_ref.as_deref(),
            crate::provider::VariantConfig::Proxy(c) => c.secret_ref.as_deref(),
            _ => None,
        };
        let credential = resolve_credential(self.secrets.as_ref(), secret_ref).await?;
        build_adapter(
            record,
            credential,
            &self.pool,
            Arc::clone(&self.sandbox),
            Arc::clone(&self.cache),
        )
    }

    /// The fallback loop shared by every operation.
    ///
    /// `op` runs one attempt against one candidate; the loop owns breaker
    /// bookkeeping, queue admission, backoff and candidate advancement.
    async fn run_with_fallback<T, F, Fut>(
        &self,
        model: &str,
        ctx: &CallContext,
        mut op: F,
    ) -> Result<(T, DispatchMeta, QueuePermit), DispatchError>
    where
        F: FnMut(Candidate, Arc<dyn Adapter>, CallContext) -> Fut,
        Fut: std::future::Future<Output = Result<T, AdapterError>>,
    {
        let snapshot = self.registry.snapshot();
        let candidates = self.registry.resolve(&snapshot, model, &self.breakers);
        if candidates.is_empty() {
            return Err(DispatchError::ModelNotFound {
                model: model.to_string(),
            });
        }

        let mut attempts = 0u32;
        let mut last_err: Option<AdapterError> = None;

        for candidate in candidates {
            if attempts >= self.retry.max_attempts {
                break;
            }
            let provider_id = candidate.provider.id.clone();

            match self.breakers.try_acquire(&provider_id) {
                BreakerDecision::Allow | BreakerDecision::AllowProbe => {}
                BreakerDecision::ShortCircuit => {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        provider = %provider_id,
                        "breaker open, skipping candidate"
                    );
                    last_err
                        .get_or_insert_with(|| AdapterError::transient("provider circuit open"));
                    continue;
                }
            }

            attempts += 1;
            let delay = self.retry.delay_before(attempts);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancel.cancelled() => {
                        return Err(DispatchError::Upstream(AdapterError::Cancelled));
                    }
                }
            }

            let permit = match self
                .queue
                .admit(&provider_id, Priority::Normal, &ctx.cancel)
                .await
            {
                Ok(permit) => permit,
                Err(AdmitError::AtCapacity) => return Err(DispatchError::AtCapacity),
                Err(AdmitError::Cancelled) => {
                    return Err(DispatchError::Upstream(AdapterError::Cancelled))
                }
            };

            let adapter = match self.adapter_for(&candidate.provider).await {
                Ok(adapter) => adapter,
                Err(e) => {
                    // Misconfiguration trips the breaker permanently and
                    // surfaces; a retry cannot help the caller.
                    self.breakers.force_open(&provider_id, &e.to_string());
                    return Err(DispatchError::Upstream(e));
                }
            };

            self.registry.inc_pending(&provider_id);
            let result = op(candidate, adapter, ctx.clone()).await;
            self.registry.dec_pending(&provider_id);

            match result {
                Ok(value) => {
                    self.breakers.on_success(&provider_id);
                    self.registry.record_outcome(&provider_id, true);
                    return Ok((
                        value,
                        DispatchMeta {
                            provider_id,
                            attempts,
                        },
                        permit,
                    ));
                }
                Err(e) => {
                    if e.trips_breaker() {
                        self.breakers
                            .on_failure(&provider_id, e.is_retryable(), &e.to_string());
                        self.registry.record_outcome(&provider_id, false);
                    }
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        provider = %provider_id,
                        attempt = attempts,
                        error = %e,
                        "attempt failed"
                    );
                    match &e {
                        AdapterError::TransientUpstream { .. } | AdapterError::Timeout => {
                            last_err = Some(e);
                        }
                        AdapterError::ConfigError { .. } => {
                            self.breakers.force_open(&provider_id, &e.to_string());
                            return Err(DispatchError::Upstream(e));
                        }
                        _ => return Err(DispatchError::Upstream(e)),
                    }
                }
            }
        }

        Err(DispatchError::Upstream(last_err.unwrap_or_else(|| {
            AdapterError::transient("no provider available for this model")
        })))
    }
}

fn validate_chat(request: &ChatRequest, candidate: &Candidate) -> Result<(), AdapterError> {
    if request.messages.is_empty() {
        return Err(AdapterError::bad_request("messages must not be empty"));
    }
    if let (Some(requested), Some(ceiling)) =
        (request.max_tokens, candidate.mapping.max_output_tokens)
    {
        if requested > ceiling {
            return Err(AdapterError::bad_request(format!(
                "max_tokens {requested} exceeds the model ceiling of {ceiling}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerState};
    use crate::models::Message;
    use crate::pool::QueueLimits;
    use crate::provider::{
        AuthMode, HttpConfig, ModelMapping, ProviderKind, ProviderRecord, VariantConfig,
    };
    use crate::sandbox::SandboxPolicy;
    use crate::secrets::MemorySecrets;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(id: &str, priority: i32, base_url: String) -> ProviderRecord {
        ProviderRecord {
            id: id.into(),
            name: id.into(),
            kind: ProviderKind::HttpSdk,
            enabled: true,
            config: VariantConfig::HttpSdk(HttpConfig {
                base_url,
                auth: AuthMode::None,
                secret_ref: None,
                timeout: Duration::from_secs(5),
                max_sockets: 4,
                headers: HashMap::new(),
            }),
            models: vec![ModelMapping {
                external_id: "gpt-3.5-turbo".into(),
                internal_id: "gpt-3.5-turbo".into(),
                max_output_tokens: Some(4096),
                context_window: Some(16384),
                supports_streaming: true,
                supports_embeddings: false,
                cost_per_1k_tokens: None,
                rate_limit: None,
            }],
            priority,
            tags: vec![],
        }
    }

    fn dispatcher(records: Vec<ProviderRecord>, threshold: u32) -> Dispatcher {
        Dispatcher::new(
            Arc::new(ProviderRegistry::from_records(records).unwrap()),
            Arc::new(BreakerTable::new(BreakerConfig {
                failure_threshold: threshold,
                ..BreakerConfig::default()
            })),
            Arc::new(ConnectionPool::new()),
            RequestQueue::new(QueueLimits::default()),
            Arc::new(SandboxExecutor::new(SandboxPolicy::default())),
            Arc::new(MemorySecrets::new()),
            Arc::new(CatalogCache::new(16, Duration::from_secs(30))),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        )
    }

    fn chat_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-3.5-turbo".into(),
            messages: vec![Message::user("hi")],
            ..Default::default()
        }
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"},
                         "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        })
    }

    #[tokio::test]
    async fn happy_path_resolves_and_rewrites_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(vec![record("only", 10, server.uri())], 5);
        let ctx = CallContext::new("req-1", Duration::from_secs(5));
        let (response, meta) = dispatcher.chat(chat_request(), &ctx).await.unwrap();
        assert_eq!(response.model, "gpt-3.5-turbo");
        assert_eq!(response.choices[0].message.content, "hello");
        assert_eq!(meta.provider_id, "only");
        assert_eq!(meta.attempts, 1);
    }

    #[tokio::test]
    async fn unknown_model_is_model_not_found() {
        let dispatcher = dispatcher(vec![], 5);
        let ctx = CallContext::new("req-1", Duration::from_secs(5));
        let err = dispatcher.chat(chat_request(), &ctx).await.unwrap_err();
        assert!(matches!(err, DispatchError::ModelNotFound { .. }));
    }

    #[tokio::test]
    async fn transient_failure_falls_back_to_secondary() {
        let primary = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&primary)
            .await;
        let secondary = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&secondary)
            .await;

        let dispatcher = dispatcher(
            vec![
                record("primary", 10, primary.uri()),
                record("secondary", 5, secondary.uri()),
            ],
            5,
        );
        let ctx = CallContext::new("req-1", Duration::from_secs(5));
        let (_, meta) = dispatcher.chat(chat_request(), &ctx).await.unwrap();
        assert_eq!(meta.provider_id, "secondary");
        assert_eq!(meta.attempts, 2);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_skips_primary() {
        let primary = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&primary)
            .await;
        let secondary = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&secondary)
            .await;

        let dispatcher = dispatcher(
            vec![
                record("primary", 10, primary.uri()),
                record("secondary", 5, secondary.uri()),
            ],
            2,
        );

        // Two requests, each failing once on primary, cross the threshold.
        for i in 0..2 {
            let ctx = CallContext::new(format!("req-{i}"), Duration::from_secs(5));
            dispatcher.chat(chat_request(), &ctx).await.unwrap();
        }
        assert_eq!(
            dispatcher.breakers().state("primary"),
            BreakerState::Open
        );

        // The next request routes straight to the secondary without
        // contacting the primary again.
        let before = primary.received_requests().await.unwrap().len();
        let ctx = CallContext::new("req-after", Duration::from_secs(5));
        let (_, meta) = dispatcher.chat(chat_request(), &ctx).await.unwrap();
        assert_eq!(meta.provider_id, "secondary");
        assert_eq!(meta.attempts, 1);
        let after = primary.received_requests().await.unwrap().len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn bad_request_surfaces_without_fallback() {
        let primary = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "bad payload"}
            })))
            .mount(&primary)
            .await;
        let secondary = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&secondary)
            .await;

        let dispatcher = dispatcher(
            vec![
                record("primary", 10, primary.uri()),
                record("secondary", 5, secondary.uri()),
            ],
            5,
        );
        let ctx = CallContext::new("req-1", Duration::from_secs(5));
        let err = dispatcher.chat(chat_request(), &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Upstream(AdapterError::BadRequest { .. })
        ));
        assert!(secondary.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn max_tokens_ceiling_is_inclusive() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;
        let dispatcher = dispatcher(vec![record("only", 10, server.uri())], 5);

        let mut at_ceiling = chat_request();
        at_ceiling.max_tokens = Some(4096);
        let ctx = CallContext::new("req-1", Duration::from_secs(5));
        assert!(dispatcher.chat(at_ceiling, &ctx).await.is_ok());

        let mut over = chat_request();
        over.max_tokens = Some(4097);
        let ctx = CallContext::new("req-2", Duration::from_secs(5));
        let err = dispatcher.chat(over, &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Upstream(AdapterError::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn empty_messages_is_a_bad_request() {
        let server = MockServer::start().await;
        let dispatcher = dispatcher(vec![record("only", 10, server.uri())], 5);
        let mut request = chat_request();
        request.messages.clear();
        let ctx = CallContext::new("req-1", Duration::from_secs(5));
        let err = dispatcher.chat(request, &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Upstream(AdapterError::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn exhausted_fallback_surfaces_last_transient() {
        let a = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&a)
            .await;
        let b = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&b)
            .await;

        let dispatcher = dispatcher(
            vec![record("a", 10, a.uri()), record("b", 5, b.uri())],
            5,
        );
        let ctx = CallContext::new("req-1", Duration::from_secs(5));
        let err = dispatcher.chat(chat_request(), &ctx).await.unwrap_err();
        match err {
            DispatchError::Upstream(AdapterError::TransientUpstream { message }) => {
                assert!(message.contains("502"), "expected last error, got {message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_secret_is_surfaced_and_opens_breaker() {
        let server = MockServer::start().await;
        let mut rec = record("only", 10, server.uri());
        if let VariantConfig::HttpSdk(ref mut http) = rec.config {
            http.auth = AuthMode::Bearer;
            http.secret_ref = Some("missing".into());
        }
        let dispatcher = dispatcher(vec![rec], 5);
        let ctx = CallContext::new("req-1", Duration::from_secs(5));
        let err = dispatcher.chat(chat_request(), &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Upstream(AdapterError::ConfigError { .. })
        ));
        assert_eq!(dispatcher.breakers().state("only"), BreakerState::Open);
    }

    #[tokio::test]
    async fn models_are_cached_for_the_ttl() {
        let server = MockServer::start().await;
        let dispatcher = dispatcher(vec![record("only", 10, server.uri())], 5);
        let first = dispatcher.models();
        assert_eq!(first.len(), 1);
        // Mutate the registry; the cached union is still served.
        dispatcher.registry().set_enabled("only", false);
        assert_eq!(dispatcher.models().len(), 1);
        dispatcher.invalidate_model_cache();
        assert_eq!(dispatcher.models().len(), 0);
    }
}
