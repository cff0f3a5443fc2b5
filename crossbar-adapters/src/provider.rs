//! Provider records and model mappings.
//!
//! A [`ProviderRecord`] is the durable description of one upstream: its
//! variant, its variant-specific configuration, and the model mappings it
//! advertises. Records are owned by the registry and handed to adapters as
//! immutable snapshots; runtime state (breaker, counters, health) lives
//! elsewhere, keyed by the stable provider id.

use crate::common::duration_serde;
use crate::error::AdapterError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Which adapter variant executes requests for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Pre-vetted command run inside a single-use container.
    Cli,
    /// HTTPS endpoint speaking a provider SDK dialect.
    HttpSdk,
    /// Near-verbatim forward to another OpenAI-compatible service.
    Proxy,
    /// Loopback or LAN inference server with service auto-detection.
    Local,
}

/// A configured upstream managed by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Stable identifier; breaker state and counters key off this.
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    pub config: VariantConfig,
    /// At least one mapping is required for the provider to resolve.
    pub models: Vec<ModelMapping>,
    /// Higher is preferred during resolution.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Variant-specific configuration; the tag must agree with
/// [`ProviderRecord::kind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VariantConfig {
    Cli(CliConfig),
    HttpSdk(HttpConfig),
    Proxy(ProxyConfig),
    Local(LocalConfig),
}

impl VariantConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Cli(_) => ProviderKind::Cli,
            Self::HttpSdk(_) => ProviderKind::HttpSdk,
            Self::Proxy(_) => ProviderKind::Proxy,
            Self::Local(_) => ProviderKind::Local,
        }
    }
}

/// CLI variant: a fixed command executed in a sandbox container.
/// Caller content never reaches the command line; it is piped to stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Container image; must be on the operator allowlist.
    pub image: String,
    #[serde(with = "duration_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_memory_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "default_cpus")]
    pub cpu_limit: f32,
    /// Static, operator-set environment; never caller-controlled.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub supports_streaming: bool,
}

/// HTTP-SDK variant: authenticated HTTPS endpoint with a bounded
/// per-provider socket pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthMode,
    /// Name of the credential in the secrets backend. The credential
    /// itself never lives on the record.
    #[serde(default)]
    pub secret_ref: Option<String>,
    #[serde(with = "duration_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Proxy variant: forwards the OpenAI-shaped body as-is, rewriting only
/// headers on the allowed-forward list and injecting auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub base_url: String,
    #[serde(default)]
    pub secret_ref: Option<String>,
    /// Inbound headers copied through verbatim; everything else dropped.
    #[serde(default)]
    pub forward_headers: Vec<String>,
    #[serde(with = "duration_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,
}

/// Local variant: loopback or LAN inference server. The wire dialect is
/// auto-detected on first use and cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub base_url: String,
    #[serde(with = "duration_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,
}

/// Upstream authentication modes for the HTTP-SDK variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    None,
    /// Credential sent in a named header.
    ApiKeyHeader { header: String },
    /// `Authorization: Bearer <credential>`.
    Bearer,
    /// HTTP basic auth; the credential is the password.
    Basic { username: String },
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_memory_mb() -> u64 {
    256
}

fn default_cpus() -> f32 {
    1.0
}

fn default_max_sockets() -> usize {
    32
}

/// The contract between the gateway's model namespace and a provider's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    /// What callers request.
    pub external_id: String,
    /// What the adapter passes upstream.
    pub internal_id: String,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub context_window: Option<u32>,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_embeddings: bool,
    #[serde(default)]
    pub cost_per_1k_tokens: Option<f64>,
    #[serde(default)]
    pub rate_limit: Option<ModelRateLimit>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelRateLimit {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
}

impl ModelMapping {
    pub fn new(external_id: impl Into<String>, internal_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            internal_id: internal_id.into(),
            max_output_tokens: None,
            context_window: None,
            supports_streaming: true,
            supports_embeddings: false,
            cost_per_1k_tokens: None,
            rate_limit: None,
        }
    }
}

/// Health snapshot for one provider, refreshed by probes and by request
/// outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub error_rate: f64,
    pub last_check: chrono::DateTime<chrono::Utc>,
    pub consecutive_failures: u32,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            latency_ms: None,
            error_rate: 0.0,
            last_check: chrono::Utc::now(),
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl ProviderRecord {
    /// Structural invariants: the variant tag must agree with the config
    /// record, and at least one model mapping must be present. External
    /// model ids must be unique within the provider.
    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.id.is_empty() {
            return Err(AdapterError::config("provider id cannot be empty"));
        }
        if self.config.kind() != self.kind {
            return Err(AdapterError::config(format!(
                "provider {} kind {:?} does not match its config variant {:?}",
                self.id,
                self.kind,
                self.config.kind()
            )));
        }
        if self.models.is_empty() {
            return Err(AdapterError::config(format!(
                "provider {} has no model mappings",
                self.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for mapping in &self.models {
            if mapping.external_id.is_empty() || mapping.internal_id.is_empty() {
                return Err(AdapterError::config(format!(
                    "provider {} has a mapping with an empty model id",
                    self.id
                )));
            }
            if !seen.insert(mapping.external_id.as_str()) {
                return Err(AdapterError::config(format!(
                    "provider {} maps external model {} more than once",
                    self.id, mapping.external_id
                )));
            }
        }
        match &self.config {
            VariantConfig::Cli(cli) => {
                if cli.command.is_empty() || cli.image.is_empty() {
                    return Err(AdapterError::config(format!(
                        "provider {} needs both a command and an image",
                        self.id
                    )));
                }
            }
            VariantConfig::HttpSdk(http) => validate_base_url(&self.id, &http.base_url)?,
            VariantConfig::Proxy(proxy) => validate_base_url(&self.id, &proxy.base_url)?,
            VariantConfig::Local(local) => validate_base_url(&self.id, &local.base_url)?,
        }
        Ok(())
    }

    /// Mapping for a caller-requested external model id, if advertised.
    pub fn mapping_for(&self, external_id: &str) -> Option<&ModelMapping> {
        self.models.iter().find(|m| m.external_id == external_id)
    }

    /// The request timeout this provider's variant is configured with.
    pub fn timeout(&self) -> Duration {
        match &self.config {
            VariantConfig::Cli(c) => c.timeout,
            VariantConfig::HttpSdk(c) => c.timeout,
            VariantConfig::Proxy(c) => c.timeout,
            VariantConfig::Local(c) => c.timeout,
        }
    }
}

fn validate_base_url(id: &str, base_url: &str) -> Result<(), AdapterError> {
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(AdapterError::config(format!(
            "provider {id} base_url must start with http:// or https://"
        )));
    }
    Ok(())
}
