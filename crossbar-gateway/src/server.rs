//! Server assembly: shared state, router, middleware stack and the
//! long-lived maintenance task.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

use crossbar_adapters::breaker::BreakerTable;
use crossbar_adapters::cache::CatalogCache;
use crossbar_adapters::dispatch::Dispatcher;
use crossbar_adapters::pool::{ConnectionPool, QueueLimits, RequestQueue};
use crossbar_adapters::registry::ProviderRegistry;
use crossbar_adapters::sandbox::SandboxExecutor;
use crossbar_adapters::secrets::{MemorySecrets, SecretsBackend};

use crate::admin::AdminApi;
use crate::auth::{ApiKeyRecord, AuthService, Permission, RateLimiter};
use crate::config::Config;
use crate::handlers;
use crate::middleware::{auth_middleware, context_middleware, cors_middleware, logging_middleware};
use crate::shield::IpShield;
use crate::store::{MemoryStore, ProviderStore};
use crate::usage::UsageRecorder;

/// Shared state behind every handler. Everything is `Arc`ed; cloning the
/// state clones pointers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<ProviderRegistry>,
    pub auth: Arc<AuthService>,
    pub limiter: Arc<RateLimiter>,
    pub shield: Arc<IpShield>,
    pub usage: UsageRecorder,
    pub store: Arc<dyn ProviderStore>,
    pub secrets: Arc<dyn SecretsBackend>,
    pub admin: Arc<AdminApi>,
}

/// Build the application router against explicit store and secrets
/// backends. Tests inject in-memory ones; `create_server` wires the
/// defaults.
pub async fn create_app(
    config: Config,
    store: Arc<dyn ProviderStore>,
    secrets: Arc<dyn SecretsBackend>,
) -> anyhow::Result<Router> {
    // Seed providers from config into the store, then build the registry
    // from whatever the store now holds.
    for record in &config.providers {
        store.put_provider(record.clone()).await?;
    }
    let records = store.list_enabled_providers().await?;
    let registry = Arc::new(ProviderRegistry::from_records(records)?);

    let breakers = Arc::new(BreakerTable::new(config.breaker.clone()));
    let pool = Arc::new(ConnectionPool::new());
    let queue = RequestQueue::new(QueueLimits {
        per_provider_concurrency: config.limits.per_provider_concurrency,
        per_provider_pending: config.limits.per_provider_pending,
        global_concurrency: config.limits.global_concurrency,
    });
    let sandbox = Arc::new(SandboxExecutor::new(config.sandbox_policy()));
    let cache = Arc::new(CatalogCache::new(256, Duration::from_secs(30)));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&breakers),
        pool,
        queue,
        sandbox,
        Arc::clone(&secrets),
        cache,
        config.limits.retry_policy(),
    ));

    let auth = Arc::new(AuthService::new(Arc::clone(&store), config.auth.enabled));
    let limiter = Arc::new(RateLimiter::new());
    let shield = Arc::new(IpShield::new((&config.shield).into()));
    let usage = UsageRecorder::spawn(Arc::clone(&store));
    let admin = Arc::new(AdminApi::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&dispatcher),
    ));

    let state = AppState {
        config: Arc::new(config),
        dispatcher,
        registry,
        auth,
        limiter: Arc::clone(&limiter),
        shield: Arc::clone(&shield),
        usage,
        store,
        secrets,
        admin,
    };

    spawn_maintenance(limiter, shield);

    let timeout = state.config.server.timeout;
    let app = Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/models", get(handlers::list_models))
        // Operational endpoints
        .route("/healthz", get(handlers::healthz))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::prometheus_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(cors_middleware(&state.config.server.cors))
                .layer(axum::middleware::from_fn(context_middleware))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    auth_middleware,
                ))
                .layer(axum::middleware::from_fn(logging_middleware))
                .layer(TimeoutLayer::new(timeout)),
        )
        .with_state(state);

    Ok(app)
}

/// Default wiring: in-memory store and secrets seeded from config.
pub async fn create_server(config: Config) -> anyhow::Result<Router> {
    let store = Arc::new(MemoryStore::new());
    seed_memory_store(&store, &config.auth.seed_keys);

    let secrets_backend = MemorySecrets::new();
    for (name, value) in &config.secrets {
        secrets_backend.insert(name.clone(), value.as_bytes().to_vec());
    }
    let secrets: Arc<dyn SecretsBackend> = Arc::new(secrets_backend);
    create_app(config, store, secrets).await
}

/// Periodic sweep of rate-limiter rings and shield windows. One named
/// long-lived task; everything else spawned by the gateway is bounded by
/// a request.
fn spawn_maintenance(limiter: Arc<RateLimiter>, shield: Arc<IpShield>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            limiter.sweep();
            shield.sweep();
        }
    });
}

fn seeded_hash(salt: &str, raw: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(raw.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Provision config-seeded keys into an in-memory store. The configured
/// raw value replaces the generated one; external stores manage keys
/// through their own provisioning instead.
pub fn seed_memory_store(store: &MemoryStore, seeds: &[crate::config::SeedKeyConfig]) {
    for seed in seeds {
        let permissions: std::collections::HashSet<Permission> =
            seed.permissions.iter().copied().collect();
        let (mut record, _generated) = ApiKeyRecord::issue(
            seed.name.clone(),
            "config",
            permissions,
            seed.requests_per_minute,
            seed.tokens_per_minute,
        );
        record.key_hash = seeded_hash(&record.salt, &seed.key);
        record.prefix = seed.key.chars().take(8).collect();
        record.allowed_models = seed.allowed_models.clone();
        store.put_api_key(crate::auth::lookup_hash(&seed.key), record);
    }
}
