//! Programmatic admin interface.
//!
//! The management HTTP surface lives elsewhere; this is the engine-side
//! API it calls into: provider CRUD (write-through to the store, then a
//! registry republish), enable/disable, synthetic test-connection,
//! breaker reset and a metrics snapshot.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crossbar_adapters::adapters::CallContext;
use crossbar_adapters::dispatch::Dispatcher;
use crossbar_adapters::provider::ProviderRecord;
use crossbar_adapters::registry::ProviderRegistry;

use crate::gateway_error::ApiError;
use crate::store::ProviderStore;

pub struct AdminApi {
    store: Arc<dyn ProviderStore>,
    registry: Arc<ProviderRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl AdminApi {
    pub fn new(
        store: Arc<dyn ProviderStore>,
        registry: Arc<ProviderRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
        }
    }

    /// Register or update a provider: validate, persist, publish.
    pub async fn put_provider(&self, record: ProviderRecord) -> Result<(), ApiError> {
        record
            .validate()
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        let id = record.id.clone();
        self.store
            .put_provider(record.clone())
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        self.registry
            .upsert(record)
            .map_err(|e| ApiError::internal(e.to_string()))?;
        self.dispatcher.invalidate_provider(&id);
        self.dispatcher.invalidate_model_cache();
        Ok(())
    }

    pub async fn delete_provider(&self, id: &str) -> Result<bool, ApiError> {
        let removed = self
            .store
            .delete_provider(id)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        self.registry.remove(id);
        self.dispatcher.invalidate_provider(id);
        self.dispatcher.invalidate_model_cache();
        Ok(removed)
    }

    /// Disabling removes the provider from resolution; its counters and
    /// breaker state survive for when it comes back.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), ApiError> {
        let mut record = self
            .store
            .get_provider(id)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?
            .ok_or_else(|| ApiError::invalid_request(format!("no provider with id {id}")))?;
        record.enabled = enabled;
        self.store
            .put_provider(record)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        self.registry.set_enabled(id, enabled);
        self.dispatcher.invalidate_model_cache();
        Ok(())
    }

    /// Synthetic request straight through the provider's adapter. Skips
    /// rate limiting and usage accounting entirely.
    pub async fn test_connection(&self, id: &str) -> Result<(), ApiError> {
        let ctx = CallContext::new(
            format!("admin_{}", uuid::Uuid::new_v4().simple()),
            Duration::from_secs(15),
        );
        self.dispatcher
            .test_connection(id, &ctx)
            .await
            .map_err(|e| match e {
                crossbar_adapters::dispatch::DispatchError::ModelNotFound { .. } => {
                    ApiError::invalid_request(format!("no provider with id {id}"))
                }
                other => ApiError::from(other),
            })
    }

    /// Administrative breaker reset: the next request observes Closed.
    pub fn reset_breaker(&self, id: &str) {
        self.dispatcher.breakers().reset(id);
    }

    /// Point-in-time view for dashboards: providers, breaker states,
    /// aggregate counters.
    pub fn metrics_snapshot(&self) -> Value {
        let snapshot = self.registry.snapshot();
        let breakers = self.dispatcher.breakers().snapshot();

        let providers: Vec<Value> = snapshot
            .iter()
            .map(|record| {
                let (total, failed) = self.registry.counters(&record.id);
                let breaker_state = breakers
                    .iter()
                    .find(|b| b.provider_id == record.id)
                    .map(|b| format!("{:?}", b.state).to_lowercase())
                    .unwrap_or_else(|| "closed".to_string());
                json!({
                    "id": record.id,
                    "name": record.name,
                    "kind": record.kind,
                    "enabled": record.enabled,
                    "priority": record.priority,
                    "models": record.models.iter().map(|m| &m.external_id).collect::<Vec<_>>(),
                    "requests_total": total,
                    "requests_failed": failed,
                    "breaker_state": breaker_state,
                })
            })
            .collect();

        json!({
            "registry_version": snapshot.version,
            "providers": providers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crossbar_adapters::breaker::{BreakerConfig, BreakerState, BreakerTable};
    use crossbar_adapters::cache::CatalogCache;
    use crossbar_adapters::dispatch::RetryPolicy;
    use crossbar_adapters::pool::{ConnectionPool, QueueLimits, RequestQueue};
    use crossbar_adapters::provider::{
        AuthMode, HttpConfig, ModelMapping, ProviderKind, VariantConfig,
    };
    use crossbar_adapters::sandbox::{SandboxExecutor, SandboxPolicy};
    use crossbar_adapters::secrets::MemorySecrets;
    use std::collections::HashMap;

    fn record(id: &str) -> ProviderRecord {
        ProviderRecord {
            id: id.into(),
            name: id.into(),
            kind: ProviderKind::HttpSdk,
            enabled: true,
            config: VariantConfig::HttpSdk(HttpConfig {
                base_url: "https://example.test/v1".into(),
                auth: AuthMode::None,
                secret_ref: None,
                timeout: Duration::from_secs(5),
                max_sockets: 4,
                headers: HashMap::new(),
            }),
            models: vec![ModelMapping::new("m", "m")],
            priority: 1,
            tags: vec![],
        }
    }

    fn admin() -> (AdminApi, Arc<ProviderRegistry>) {
        let registry = Arc::new(ProviderRegistry::new());
        let breakers = Arc::new(BreakerTable::new(BreakerConfig::default()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            breakers,
            Arc::new(ConnectionPool::new()),
            RequestQueue::new(QueueLimits::default()),
            Arc::new(SandboxExecutor::new(SandboxPolicy::default())),
            Arc::new(MemorySecrets::new()),
            Arc::new(CatalogCache::new(16, Duration::from_secs(30))),
            RetryPolicy::default(),
        ));
        let store: Arc<dyn ProviderStore> = Arc::new(MemoryStore::new());
        (
            AdminApi::new(store, Arc::clone(&registry), dispatcher),
            registry,
        )
    }

    #[tokio::test]
    async fn put_then_delete_round_trips_through_registry() {
        let (admin, registry) = admin();
        admin.put_provider(record("p1")).await.unwrap();
        assert!(registry.snapshot().get("p1").is_some());

        assert!(admin.delete_provider("p1").await.unwrap());
        assert!(registry.snapshot().get("p1").is_none());
        assert!(!admin.delete_provider("p1").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_record_is_rejected_before_the_store() {
        let (admin, registry) = admin();
        let mut bad = record("p1");
        bad.models.clear();
        assert!(admin.put_provider(bad).await.is_err());
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn disable_removes_from_resolution_but_keeps_the_record() {
        let (admin, registry) = admin();
        admin.put_provider(record("p1")).await.unwrap();
        admin.set_enabled("p1", false).await.unwrap();
        let snapshot = registry.snapshot();
        assert!(!snapshot.get("p1").unwrap().enabled);
        assert!(!snapshot.any_enabled());
    }

    #[tokio::test]
    async fn breaker_reset_returns_to_closed() {
        let (admin, _registry) = admin();
        let breakers = admin.dispatcher.breakers();
        for _ in 0..BreakerConfig::default().failure_threshold {
            breakers.on_failure("p1", true, "503");
        }
        assert_eq!(breakers.state("p1"), BreakerState::Open);
        admin.reset_breaker("p1");
        assert_eq!(breakers.state("p1"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn metrics_snapshot_lists_providers() {
        let (admin, _registry) = admin();
        admin.put_provider(record("p1")).await.unwrap();
        let snapshot = admin.metrics_snapshot();
        assert_eq!(snapshot["providers"][0]["id"], "p1");
        assert_eq!(snapshot["providers"][0]["breaker_state"], "closed");
    }
}
