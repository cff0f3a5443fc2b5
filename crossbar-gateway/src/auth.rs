//! # Authentication and Quotas
//!
//! API keys, bearer authentication and per-key rate limiting.
//!
//! ## Keys
//!
//! Keys are opaque bearer credentials. Only a salted SHA-256 digest and
//! an 8-character display prefix are stored; the raw value is shown to
//! the caller exactly once, at creation. Lookup goes through an
//! unsalted digest index so the store never sees raw keys either. A key
//! carries its permission set, an optional allowed-model filter, an
//! optional IP allowlist and an optional expiry; revoked and expired
//! keys fail authentication outright.
//!
//! ## Rate limiting
//!
//! Two layers, both in-memory and O(1) per decision:
//!
//! - **Admission layer**: a sliding window of monotonic timestamps per
//!   key. The ring never holds more than the key's requests-per-minute
//!   budget; the oldest stamp yields the `retry_after` hint.
//! - **Token layer**: pre-charge and reconcile. At admission an
//!   estimated cost (prompt-length heuristic plus the `max_tokens`
//!   ceiling) is deducted from the minute's allowance; completion
//!   settles the difference against actual usage. A pre-charge that
//!   would overdraw the allowance rejects the request before any
//!   upstream work happens.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::gateway_error::ApiError;
use crate::store::ProviderStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Chat,
    Embeddings,
    Models,
    Admin,
}

/// Stored form of an API key. The raw value never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub name: String,
    /// Hex SHA-256 over salt + raw key.
    pub key_hash: String,
    pub salt: String,
    /// First 8 characters of the raw key, for display.
    pub prefix: String,
    pub owner: String,
    pub permissions: HashSet<Permission>,
    /// Empty means unrestricted.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
    #[serde(default)]
    pub ip_allowlist: Vec<IpAddr>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    /// Mint a new key. Returns the record and the raw value; the raw
    /// value is not reconstructible afterwards.
    pub fn issue(
        name: impl Into<String>,
        owner: impl Into<String>,
        permissions: HashSet<Permission>,
        requests_per_minute: u32,
        tokens_per_minute: u32,
    ) -> (Self, String) {
        let raw = format!("cb-{}", uuid::Uuid::new_v4().simple());
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let record = Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            key_hash: salted_digest(&salt, &raw),
            salt,
            prefix: raw.chars().take(8).collect(),
            owner: owner.into(),
            permissions,
            allowed_models: Vec::new(),
            requests_per_minute,
            tokens_per_minute,
            ip_allowlist: Vec::new(),
            expires_at: None,
            revoked: false,
            created_at: Utc::now(),
        };
        (record, raw)
    }

    pub fn verify(&self, raw: &str) -> bool {
        salted_digest(&self.salt, raw) == self.key_hash
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn model_allowed(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }

    pub fn ip_allowed(&self, ip: Option<IpAddr>) -> bool {
        if self.ip_allowlist.is_empty() {
            return true;
        }
        ip.map(|ip| self.ip_allowlist.contains(&ip)).unwrap_or(false)
    }
}

fn salted_digest(salt: &str, raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(raw.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Unsalted digest of the raw key, used as the store lookup index.
pub fn lookup_hash(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// The authenticated identity attached to a request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub key: Arc<ApiKeyRecord>,
}

impl AuthContext {
    pub fn require(&self, permission: Permission) -> Result<(), ApiError> {
        if self.key.permissions.contains(&permission) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "api key {} lacks the {permission:?} permission",
                self.key.prefix
            )))
        }
    }

    pub fn require_model(&self, model: &str) -> Result<(), ApiError> {
        if self.key.model_allowed(model) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "api key {} may not use model {model}",
                self.key.prefix
            )))
        }
    }
}

pub struct AuthService {
    store: Arc<dyn ProviderStore>,
    enabled: bool,
}

impl AuthService {
    pub fn new(store: Arc<dyn ProviderStore>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn extract_bearer(header: Option<&str>) -> Option<&str> {
        let header = header?.trim();
        header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .map(str::trim)
    }

    /// Validate a bearer credential end to end: lookup, salted-hash
    /// verification, revocation, expiry and IP allowlist.
    pub async fn authenticate(
        &self,
        header: Option<&str>,
        remote_ip: Option<IpAddr>,
    ) -> Result<AuthContext, ApiError> {
        let raw = Self::extract_bearer(header)
            .ok_or_else(|| ApiError::invalid_key("missing bearer api key"))?;

        let record = self
            .store
            .get_api_key_by_hash(&lookup_hash(raw))
            .await
            .map_err(|e| ApiError::internal(format!("key lookup failed: {e}")))?
            .ok_or_else(|| ApiError::invalid_key("unknown api key"))?;

        if !record.verify(raw) {
            return Err(ApiError::invalid_key("unknown api key"));
        }
        if record.revoked {
            return Err(ApiError::invalid_key("api key has been revoked"));
        }
        if record.is_expired(Utc::now()) {
            return Err(ApiError::invalid_key("api key has expired"));
        }
        if !record.ip_allowed(remote_ip) {
            return Err(ApiError::forbidden("request source not on the key's allowlist"));
        }

        Ok(AuthContext {
            key: Arc::new(record),
        })
    }
}

/// Monotonic timestamp ring for requests-per-minute admission.
#[derive(Debug, Default)]
struct RequestRing {
    stamps: VecDeque<Instant>,
}

/// Per-minute token bucket with pre-charge accounting.
#[derive(Debug, Default)]
struct TokenWindow {
    minute: u64,
    charged: u64,
}

/// Outstanding pre-charge, reconciled on completion.
#[derive(Debug, Clone)]
pub struct TokenCharge {
    pub key_id: String,
    pub estimated: u32,
    minute: u64,
}

pub struct RateLimiter {
    rings: DashMap<String, RequestRing>,
    tokens: DashMap<String, TokenWindow>,
    epoch: Instant,
}

const WINDOW_SECS: u64 = 60;

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            rings: DashMap::new(),
            tokens: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    /// Admission-layer check: one slot in the key's sliding window.
    pub fn check_request(&self, key: &ApiKeyRecord) -> Result<(), ApiError> {
        let now = Instant::now();
        let mut ring = self.rings.entry(key.id.clone()).or_default();

        while ring
            .stamps
            .front()
            .is_some_and(|t| now.duration_since(*t).as_secs() >= WINDOW_SECS)
        {
            ring.stamps.pop_front();
        }

        if ring.stamps.len() as u32 >= key.requests_per_minute {
            let retry_after = ring
                .stamps
                .front()
                .map(|oldest| WINDOW_SECS.saturating_sub(now.duration_since(*oldest).as_secs()))
                .unwrap_or(WINDOW_SECS)
                .max(1);
            return Err(ApiError::RateLimited {
                message: format!(
                    "rate limit of {} requests per minute exceeded",
                    key.requests_per_minute
                ),
                retry_after,
            });
        }

        ring.stamps.push_back(now);
        Ok(())
    }

    fn current_minute(&self) -> u64 {
        self.epoch.elapsed().as_secs() / WINDOW_SECS
    }

    /// Token-layer pre-charge: deduct the estimate from this minute's
    /// allowance, rejecting when it would overdraw.
    pub fn precharge_tokens(
        &self,
        key: &ApiKeyRecord,
        estimated: u32,
    ) -> Result<TokenCharge, ApiError> {
        let minute = self.current_minute();
        let mut window = self.tokens.entry(key.id.clone()).or_default();
        if window.minute != minute {
            window.minute = minute;
            window.charged = 0;
        }

        if window.charged + estimated as u64 > key.tokens_per_minute as u64 {
            let retry_after = WINDOW_SECS - (self.epoch.elapsed().as_secs() % WINDOW_SECS);
            return Err(ApiError::RateLimited {
                message: format!(
                    "token budget of {} per minute exhausted",
                    key.tokens_per_minute
                ),
                retry_after: retry_after.max(1),
            });
        }

        window.charged += estimated as u64;
        Ok(TokenCharge {
            key_id: key.id.clone(),
            estimated,
            minute,
        })
    }

    /// Settle a pre-charge against actual usage. Only adjusts the window
    /// the charge was taken from; late completions spanning a minute
    /// boundary leave the fresh window untouched.
    pub fn reconcile(&self, charge: &TokenCharge, actual: u32) {
        let Some(mut window) = self.tokens.get_mut(&charge.key_id) else {
            return;
        };
        if window.minute != charge.minute {
            return;
        }
        if actual >= charge.estimated {
            window.charged += (actual - charge.estimated) as u64;
        } else {
            window.charged = window
                .charged
                .saturating_sub((charge.estimated - actual) as u64);
        }
    }

    /// Drop state for keys idle longer than the window, called from the
    /// maintenance task.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.rings.retain(|_, ring| {
            ring.stamps
                .back()
                .is_some_and(|t| now.duration_since(*t).as_secs() < WINDOW_SECS * 2)
        });
        let minute = self.current_minute();
        self.tokens.retain(|_, w| minute.saturating_sub(w.minute) < 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn key(rpm: u32, tpm: u32) -> ApiKeyRecord {
        let (record, _raw) = ApiKeyRecord::issue(
            "test",
            "tester",
            [Permission::Chat].into(),
            rpm,
            tpm,
        );
        record
    }

    #[test]
    fn issued_key_verifies_and_prefix_is_eight_chars() {
        let (record, raw) = ApiKeyRecord::issue("k", "o", [Permission::Chat].into(), 60, 1000);
        assert!(record.verify(&raw));
        assert!(!record.verify("cb-wrong"));
        assert_eq!(record.prefix.len(), 8);
        assert!(raw.starts_with(&record.prefix));
        assert_ne!(record.key_hash, raw);
    }

    #[tokio::test]
    async fn authenticate_accepts_valid_and_rejects_revoked() {
        let store = Arc::new(MemoryStore::new());
        let (mut record, raw) =
            ApiKeyRecord::issue("k", "o", [Permission::Chat].into(), 60, 1000);
        store.put_api_key(lookup_hash(&raw), record.clone());

        let auth = AuthService::new(store.clone(), true);
        let header = format!("Bearer {raw}");
        let ctx = auth.authenticate(Some(&header), None).await.unwrap();
        assert!(ctx.require(Permission::Chat).is_ok());
        assert!(ctx.require(Permission::Admin).is_err());

        record.revoked = true;
        store.put_api_key(lookup_hash(&raw), record);
        let err = auth.authenticate(Some(&header), None).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidApiKey { .. }));
    }

    #[tokio::test]
    async fn expired_key_fails_authentication() {
        let store = Arc::new(MemoryStore::new());
        let (mut record, raw) =
            ApiKeyRecord::issue("k", "o", [Permission::Chat].into(), 60, 1000);
        record.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.put_api_key(lookup_hash(&raw), record);

        let auth = AuthService::new(store, true);
        let header = format!("Bearer {raw}");
        let err = auth.authenticate(Some(&header), None).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidApiKey { .. }));
    }

    #[test]
    fn allowed_models_filter() {
        let mut record = key(60, 1000);
        assert!(record.model_allowed("anything"));
        record.allowed_models = vec!["gpt-3.5-turbo".into()];
        assert!(record.model_allowed("gpt-3.5-turbo"));
        assert!(!record.model_allowed("gpt-4"));
    }

    #[test]
    fn request_ring_enforces_the_window() {
        let limiter = RateLimiter::new();
        let record = key(3, 10_000);
        for _ in 0..3 {
            limiter.check_request(&record).unwrap();
        }
        let err = limiter.check_request(&record).unwrap_err();
        match err {
            ApiError::RateLimited { retry_after, .. } => assert!(retry_after <= 60),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn token_precharge_and_reconcile() {
        let limiter = RateLimiter::new();
        let record = key(1000, 100);

        let charge = limiter.precharge_tokens(&record, 60).unwrap();
        // 60 of 100 charged; another 60 would overdraw.
        assert!(limiter.precharge_tokens(&record, 60).is_err());

        // Actual usage was lower; the difference is returned.
        limiter.reconcile(&charge, 20);
        assert!(limiter.precharge_tokens(&record, 60).is_ok());
    }

    #[test]
    fn reconcile_upward_consumes_more() {
        let limiter = RateLimiter::new();
        let record = key(1000, 100);
        let charge = limiter.precharge_tokens(&record, 10).unwrap();
        limiter.reconcile(&charge, 90);
        assert!(limiter.precharge_tokens(&record, 20).is_err());
    }

    #[test]
    fn rings_are_per_key() {
        let limiter = RateLimiter::new();
        let a = key(1, 1000);
        let b = key(1, 1000);
        limiter.check_request(&a).unwrap();
        limiter.check_request(&b).unwrap();
        assert!(limiter.check_request(&a).is_err());
    }
}
