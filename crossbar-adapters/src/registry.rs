//! Provider registry and model resolution.
//!
//! The registry owns the provider table. Mutations build a fresh snapshot
//! and publish it with an atomic pointer swap; requests pin the snapshot
//! they saw at admission and are never affected by concurrent edits.
//!
//! Per-provider runtime statistics (error rate, pending depth) are kept
//! outside the snapshot, keyed by stable provider id, so they survive
//! republication.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::breaker::{BreakerState, BreakerTable};
use crate::error::AdapterError;
use crate::models::ModelEntry;
use crate::provider::{ModelMapping, ProviderRecord};

/// Immutable view of the provider table, shared by all requests admitted
/// while it was current.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    providers: HashMap<String, Arc<ProviderRecord>>,
    /// Publication sequence number, for diagnostics.
    pub version: u64,
}

impl RegistrySnapshot {
    pub fn get(&self, id: &str) -> Option<&Arc<ProviderRecord>> {
        self.providers.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProviderRecord>> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn any_enabled(&self) -> bool {
        self.providers.values().any(|p| p.enabled)
    }

    /// Union of external model ids across enabled providers, OpenAI list
    /// shaped. Providers exposing the same external id collapse into one
    /// entry owned by the highest-priority provider.
    pub fn external_models(&self) -> Vec<ModelEntry> {
        let mut owners: HashMap<&str, &Arc<ProviderRecord>> = HashMap::new();
        for provider in self.providers.values().filter(|p| p.enabled) {
            for mapping in &provider.models {
                let entry = owners.entry(mapping.external_id.as_str()).or_insert(provider);
                if provider.priority > entry.priority {
                    *entry = provider;
                }
            }
        }
        let mut models: Vec<ModelEntry> = owners
            .into_iter()
            .map(|(id, provider)| ModelEntry::new(id, provider.name.clone(), 0))
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }
}

/// One resolution candidate: a provider and the mapping that matched.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: Arc<ProviderRecord>,
    pub mapping: ModelMapping,
}

#[derive(Debug, Default)]
struct ProviderStats {
    total: AtomicU64,
    failed: AtomicU64,
    pending: AtomicU64,
}

/// The registry: copy-on-write provider table plus long-lived stats.
pub struct ProviderRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    stats: DashMap<String, Arc<ProviderStats>>,
    version: AtomicU64,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            stats: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    pub fn from_records(records: Vec<ProviderRecord>) -> Result<Self, AdapterError> {
        let registry = Self::new();
        registry.publish(records)?;
        Ok(registry)
    }

    /// Pin the current snapshot for the duration of a request.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Replace the whole table. Each record is validated before anything
    /// is published; a bad record rejects the batch.
    pub fn publish(&self, records: Vec<ProviderRecord>) -> Result<(), AdapterError> {
        for record in &records {
            record.validate()?;
        }
        let providers = records
            .into_iter()
            .map(|r| (r.id.clone(), Arc::new(r)))
            .collect();
        self.store(providers);
        Ok(())
    }

    /// Insert or replace one provider via read-copy-update.
    pub fn upsert(&self, record: ProviderRecord) -> Result<(), AdapterError> {
        record.validate()?;
        let current = self.snapshot.load();
        let mut providers = current.providers.clone();
        providers.insert(record.id.clone(), Arc::new(record));
        self.store(providers);
        Ok(())
    }

    /// Remove a provider. Its stats cell is dropped with it; breaker state
    /// is owned by the breaker table and cleaned up there.
    pub fn remove(&self, id: &str) -> bool {
        let current = self.snapshot.load();
        if !current.providers.contains_key(id) {
            return false;
        }
        let mut providers = current.providers.clone();
        providers.remove(id);
        self.store(providers);
        self.stats.remove(id);
        true
    }

    /// Flip the enabled flag. Disabling removes the provider from
    /// resolution but preserves its counters.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let current = self.snapshot.load();
        let Some(existing) = current.providers.get(id) else {
            return false;
        };
        let mut record = (**existing).clone();
        record.enabled = enabled;
        let mut providers = current.providers.clone();
        providers.insert(id.to_string(), Arc::new(record));
        self.store(providers);
        true
    }

    fn store(&self, providers: HashMap<String, Arc<ProviderRecord>>) {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        self.snapshot
            .store(Arc::new(RegistrySnapshot { providers, version }));
        tracing::debug!(version, "registry snapshot published");
    }

    /// Resolve a caller's model id to an ordered candidate list.
    ///
    /// Candidates are partitioned by breaker state (Closed, HalfOpen,
    /// Open), then ordered by descending priority, ascending recent error
    /// rate, ascending pending depth. The result is a pure function of
    /// (snapshot, breaker states, model id).
    pub fn resolve(
        &self,
        snapshot: &RegistrySnapshot,
        model: &str,
        breakers: &BreakerTable,
    ) -> Vec<Candidate> {
        let mut ranked: Vec<(u8, i64, u64, u64, Candidate)> = snapshot
            .providers
            .values()
            .filter(|p| p.enabled)
            .filter_map(|provider| {
                let mapping = provider.mapping_for(model)?.clone();
                let partition = match breakers.state(&provider.id) {
                    BreakerState::Closed => 0u8,
                    BreakerState::HalfOpen => 1,
                    BreakerState::Open => 2,
                };
                let (error_permille, pending) = self.stats_of(&provider.id);
                Some((
                    partition,
                    -(provider.priority as i64),
                    error_permille,
                    pending,
                    Candidate {
                        provider: Arc::clone(provider),
                        mapping,
                    },
                ))
            })
            .collect();
        ranked.sort_by(|a, b| {
            (a.0, a.1, a.2, a.3, &a.4.provider.id).cmp(&(b.0, b.1, b.2, b.3, &b.4.provider.id))
        });
        ranked.into_iter().map(|(_, _, _, _, c)| c).collect()
    }

    fn stats_of(&self, id: &str) -> (u64, u64) {
        match self.stats.get(id) {
            Some(stats) => {
                let total = stats.total.load(Ordering::Relaxed);
                let failed = stats.failed.load(Ordering::Relaxed);
                let error_permille = if total == 0 { 0 } else { failed * 1000 / total };
                (error_permille, stats.pending.load(Ordering::Relaxed))
            }
            None => (0, 0),
        }
    }

    fn stats_cell(&self, id: &str) -> Arc<ProviderStats> {
        self.stats
            .entry(id.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub fn record_outcome(&self, id: &str, ok: bool) {
        let stats = self.stats_cell(id);
        stats.total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_pending(&self, id: &str) {
        self.stats_cell(id).pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_pending(&self, id: &str) {
        let stats = self.stats_cell(id);
        let mut current = stats.pending.load(Ordering::Relaxed);
        while current > 0 {
            match stats.pending.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// (total, failed) counters for one provider.
    pub fn counters(&self, id: &str) -> (u64, u64) {
        match self.stats.get(id) {
            Some(stats) => (
                stats.total.load(Ordering::Relaxed),
                stats.failed.load(Ordering::Relaxed),
            ),
            None => (0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::provider::{AuthMode, HttpConfig, ProviderKind, VariantConfig};
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    fn record(id: &str, priority: i32, models: &[&str]) -> ProviderRecord {
        ProviderRecord {
            id: id.into(),
            name: id.into(),
            kind: ProviderKind::HttpSdk,
            enabled: true,
            config: VariantConfig::HttpSdk(HttpConfig {
                base_url: "https://example.test/v1".into(),
                auth: AuthMode::None,
                secret_ref: None,
                timeout: Duration::from_secs(10),
                max_sockets: 8,
                headers: StdHashMap::new(),
            }),
            models: models
                .iter()
                .map(|m| ModelMapping::new(*m, format!("internal-{m}")))
                .collect(),
            priority,
            tags: vec![],
        }
    }

    #[test]
    fn resolution_orders_by_priority() {
        let registry = ProviderRegistry::from_records(vec![
            record("low", 5, &["gpt-3.5-turbo"]),
            record("high", 10, &["gpt-3.5-turbo"]),
        ])
        .unwrap();
        let breakers = BreakerTable::new(BreakerConfig::default());
        let snapshot = registry.snapshot();
        let candidates = registry.resolve(&snapshot, "gpt-3.5-turbo", &breakers);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].provider.id, "high");
        assert_eq!(candidates[1].provider.id, "low");
    }

    #[test]
    fn open_breaker_sorts_last() {
        let registry = ProviderRegistry::from_records(vec![
            record("primary", 10, &["m"]),
            record("secondary", 5, &["m"]),
        ])
        .unwrap();
        let breakers = BreakerTable::new(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        });
        breakers.on_failure("primary", true, "503");

        let snapshot = registry.snapshot();
        let candidates = registry.resolve(&snapshot, "m", &breakers);
        assert_eq!(candidates[0].provider.id, "secondary");
        assert_eq!(candidates[1].provider.id, "primary");
    }

    #[test]
    fn disabled_providers_do_not_resolve() {
        let registry = ProviderRegistry::from_records(vec![record("only", 1, &["m"])]).unwrap();
        registry.set_enabled("only", false);
        let breakers = BreakerTable::new(BreakerConfig::default());
        let snapshot = registry.snapshot();
        assert!(registry.resolve(&snapshot, "m", &breakers).is_empty());
    }

    #[test]
    fn disabling_preserves_counters() {
        let registry = ProviderRegistry::from_records(vec![record("p", 1, &["m"])]).unwrap();
        registry.record_outcome("p", true);
        registry.record_outcome("p", false);
        registry.set_enabled("p", false);
        assert_eq!(registry.counters("p"), (2, 1));
    }

    #[test]
    fn unknown_model_resolves_to_nothing() {
        let registry = ProviderRegistry::from_records(vec![record("p", 1, &["m"])]).unwrap();
        let breakers = BreakerTable::new(BreakerConfig::default());
        let snapshot = registry.snapshot();
        assert!(registry.resolve(&snapshot, "other", &breakers).is_empty());
    }

    #[test]
    fn snapshots_are_stable_across_mutation() {
        let registry = ProviderRegistry::from_records(vec![record("p", 1, &["m"])]).unwrap();
        let pinned = registry.snapshot();
        registry.remove("p");
        // The pinned snapshot still sees the provider; a fresh one does not.
        assert!(pinned.get("p").is_some());
        assert!(registry.snapshot().get("p").is_none());
    }

    #[test]
    fn error_rate_breaks_priority_ties() {
        let registry = ProviderRegistry::from_records(vec![
            record("clean", 5, &["m"]),
            record("flaky", 5, &["m"]),
        ])
        .unwrap();
        for _ in 0..10 {
            registry.record_outcome("flaky", false);
            registry.record_outcome("clean", true);
        }
        let breakers = BreakerTable::new(BreakerConfig::default());
        let snapshot = registry.snapshot();
        let candidates = registry.resolve(&snapshot, "m", &breakers);
        assert_eq!(candidates[0].provider.id, "clean");
    }

    #[test]
    fn model_union_dedups_by_external_id() {
        let registry = ProviderRegistry::from_records(vec![
            record("a", 5, &["shared", "only-a"]),
            record("b", 10, &["shared"]),
        ])
        .unwrap();
        let snapshot = registry.snapshot();
        let models = snapshot.external_models();
        let ids: Vec<_> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["only-a", "shared"]);
        let shared = models.iter().find(|m| m.id == "shared").unwrap();
        assert_eq!(shared.owned_by, "b");
    }
}
