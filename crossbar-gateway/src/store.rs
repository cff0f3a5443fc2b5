//! Persistent-store interface and the in-memory implementation.
//!
//! The engine treats the store as an external collaborator with
//! serializable writes and eventually-consistent reads; the registry
//! caches the enabled-provider list, so nothing here is on the hot path.
//! The in-memory store backs tests and single-node deployments seeded
//! from the config file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

use crossbar_adapters::provider::ProviderRecord;

use crate::auth::ApiKeyRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    #[error("store rejected the write: {message}")]
    Rejected { message: String },
}

/// Rolling usage counters for one API key.
#[derive(Debug, Clone, Default)]
pub struct KeyUsage {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub last_used: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn get_provider(&self, id: &str) -> Result<Option<ProviderRecord>, StoreError>;

    async fn list_enabled_providers(&self) -> Result<Vec<ProviderRecord>, StoreError>;

    async fn put_provider(&self, record: ProviderRecord) -> Result<(), StoreError>;

    async fn delete_provider(&self, id: &str) -> Result<bool, StoreError>;

    /// Lookup by the unsalted digest of the raw key.
    async fn get_api_key_by_hash(&self, hash: &str)
        -> Result<Option<ApiKeyRecord>, StoreError>;

    /// At-least-once usage accounting; callers dedup by request id.
    async fn increment_usage(
        &self,
        key_id: &str,
        requests: u64,
        tokens: u64,
        last_used: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Liveness, consumed by the readiness endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    providers: DashMap<String, ProviderRecord>,
    keys_by_hash: DashMap<String, ApiKeyRecord>,
    usage: DashMap<String, KeyUsage>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an API key under its lookup hash.
    pub fn put_api_key(&self, hash: String, record: ApiKeyRecord) {
        self.keys_by_hash.insert(hash, record);
    }

    pub fn usage_of(&self, key_id: &str) -> KeyUsage {
        self.usage
            .get(key_id)
            .map(|u| u.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProviderStore for MemoryStore {
    async fn get_provider(&self, id: &str) -> Result<Option<ProviderRecord>, StoreError> {
        Ok(self.providers.get(id).map(|r| r.clone()))
    }

    async fn list_enabled_providers(&self) -> Result<Vec<ProviderRecord>, StoreError> {
        Ok(self
            .providers
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.clone())
            .collect())
    }

    async fn put_provider(&self, record: ProviderRecord) -> Result<(), StoreError> {
        self.providers.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete_provider(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.providers.remove(id).is_some())
    }

    async fn get_api_key_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<ApiKeyRecord>, StoreError> {
        Ok(self.keys_by_hash.get(hash).map(|r| r.clone()))
    }

    async fn increment_usage(
        &self,
        key_id: &str,
        requests: u64,
        tokens: u64,
        last_used: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut usage = self.usage.entry(key_id.to_string()).or_default();
        usage.total_requests += requests;
        usage.total_tokens += tokens;
        usage.last_used = Some(last_used);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
