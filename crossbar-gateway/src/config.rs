//! Gateway configuration.
//!
//! TOML file, environment overrides, validation before serving. Provider
//! records and API keys can be seeded straight from the file so a single
//! node runs without an external store.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3000
//! timeout = "60s"
//!
//! [auth]
//! enabled = true
//!
//! [[auth.seed_keys]]
//! name = "dev"
//! key = "cb-dev-key-0000000000000000"
//! permissions = ["chat", "embeddings", "models"]
//! requests_per_minute = 60
//! tokens_per_minute = 100000
//!
//! [sandbox]
//! runtime = "docker"
//! allowed_images = ["alpine:latest"]
//! allowed_commands = ["/usr/local/bin/llm-tool"]
//!
//! [[providers]]
//! id = "openai-main"
//! name = "OpenAI"
//! kind = "http_sdk"
//! enabled = true
//! priority = 10
//! config = { type = "http_sdk", base_url = "https://api.openai.com/v1", auth = { mode = "bearer" }, secret_ref = "openai-key" }
//! models = [{ external_id = "gpt-3.5-turbo", internal_id = "gpt-3.5-turbo" }]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crossbar_adapters::breaker::BreakerConfig;
use crossbar_adapters::common::duration_serde;
use crossbar_adapters::dispatch::RetryPolicy;
use crossbar_adapters::provider::ProviderRecord;

use crate::auth::Permission;
use crate::shield::ShieldConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub shield: ShieldSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Providers seeded into the store and registry at startup.
    #[serde(default)]
    pub providers: Vec<ProviderRecord>,
    /// Secrets seeded into the in-memory backend; values may name an
    /// environment variable with `env:NAME`.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub max_body_size: usize,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            timeout: Duration::from_secs(120),
            max_body_size: 2 * 1024 * 1024,
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_origins: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub enabled: bool,
    #[serde(default)]
    pub seed_keys: Vec<SeedKeyConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            seed_keys: vec![],
        }
    }
}

/// A key provisioned from config. The raw value lives in the file (or an
/// env var), so this is for development and single-node setups only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedKeyConfig {
    pub name: String,
    /// Raw key value, or `env:NAME` to pull it from the environment.
    pub key: String,
    pub permissions: Vec<Permission>,
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    #[serde(default = "default_tpm")]
    pub tokens_per_minute: u32,
    #[serde(default)]
    pub allowed_models: Vec<String>,
}

fn default_rpm() -> u32 {
    60
}

fn default_tpm() -> u32 {
    100_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_shield_rpm")]
    pub max_requests_per_minute: u32,
    #[serde(default = "default_shield_paths")]
    pub max_unique_paths_per_minute: u32,
    #[serde(with = "duration_serde", default = "default_block_ttl")]
    pub block_ttl: Duration,
}

impl Default for ShieldSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests_per_minute: default_shield_rpm(),
            max_unique_paths_per_minute: default_shield_paths(),
            block_ttl: default_block_ttl(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_shield_rpm() -> u32 {
    600
}

fn default_shield_paths() -> u32 {
    30
}

fn default_block_ttl() -> Duration {
    Duration::from_secs(600)
}

impl From<&ShieldSection> for ShieldConfig {
    fn from(section: &ShieldSection) -> Self {
        Self {
            enabled: section.enabled,
            max_requests_per_minute: section.max_requests_per_minute,
            max_unique_paths_per_minute: section.max_unique_paths_per_minute,
            block_ttl: section.block_ttl,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// "container" or "none"; anything else is rejected by validation.
    #[serde(default = "default_isolation")]
    pub isolation: String,
    #[serde(default)]
    pub allowed_images: Vec<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(with = "duration_serde", default = "default_kill_grace")]
    pub kill_grace: Duration,
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_isolation() -> String {
    "container".to_string()
}

fn default_kill_grace() -> Duration {
    Duration::from_secs(5)
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            isolation: default_isolation(),
            allowed_images: vec![],
            allowed_commands: vec![],
            kill_grace: default_kill_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_per_provider_concurrency")]
    pub per_provider_concurrency: usize,
    #[serde(default = "default_per_provider_pending")]
    pub per_provider_pending: usize,
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_per_provider_concurrency() -> usize {
    16
}

fn default_per_provider_pending() -> usize {
    64
}

fn default_global_concurrency() -> usize {
    256
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            per_provider_concurrency: default_per_provider_concurrency(),
            per_provider_pending: default_per_provider_pending(),
            global_concurrency: default_global_concurrency(),
        }
    }
}

impl LimitsConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            shield: ShieldSection::default(),
            sandbox: SandboxSection::default(),
            limits: LimitsConfig::default(),
            breaker: BreakerConfig::default(),
            logging: LoggingConfig::default(),
            providers: vec![],
            secrets: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var("CROSSBAR_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = env::var("CROSSBAR_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid CROSSBAR_PORT: {port}"))?;
        }
        if let Ok(level) = env::var("CROSSBAR_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(enabled) = env::var("CROSSBAR_AUTH_ENABLED") {
            self.auth.enabled = enabled.parse().unwrap_or(true);
        }

        // `env:NAME` secret values resolve now, failing fast on gaps.
        for (name, value) in self.secrets.iter_mut() {
            if let Some(var) = value.strip_prefix("env:") {
                *value = env::var(var).map_err(|_| {
                    anyhow::anyhow!("secret {name} references unset environment variable {var}")
                })?;
            }
        }
        for seed in &mut self.auth.seed_keys {
            if let Some(var) = seed.key.strip_prefix("env:") {
                seed.key = env::var(var).map_err(|_| {
                    anyhow::anyhow!(
                        "seed key {} references unset environment variable {var}",
                        seed.name
                    )
                })?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server port must be between 1 and 65535");
        }
        if self.server.timeout.as_secs() == 0 {
            anyhow::bail!("server timeout cannot be zero");
        }
        if self.server.max_body_size == 0 || self.server.max_body_size > 100 * 1024 * 1024 {
            anyhow::bail!("max_body_size must be between 1 byte and 100MB");
        }
        match self.sandbox.isolation.as_str() {
            "container" | "none" => {}
            other => anyhow::bail!("sandbox isolation must be 'container' or 'none', got {other}"),
        }
        if self.limits.max_attempts == 0 || self.limits.max_attempts > 10 {
            anyhow::bail!("limits.max_attempts must be between 1 and 10");
        }
        for seed in &self.auth.seed_keys {
            if seed.key.len() < 16 {
                anyhow::bail!("seed key {} is too short (minimum 16 characters)", seed.name);
            }
            if seed.requests_per_minute == 0 || seed.tokens_per_minute == 0 {
                anyhow::bail!("seed key {} has a zero budget", seed.name);
            }
        }
        for record in &self.providers {
            record
                .validate()
                .map_err(|e| anyhow::anyhow!("provider {}: {e}", record.id))?;
        }
        let mut seen = std::collections::HashSet::new();
        for record in &self.providers {
            if !seen.insert(&record.id) {
                anyhow::bail!("duplicate provider id {}", record.id);
            }
        }
        Ok(())
    }

    pub fn sandbox_policy(&self) -> crossbar_adapters::sandbox::SandboxPolicy {
        use crossbar_adapters::sandbox::{Isolation, SandboxPolicy};
        SandboxPolicy {
            isolation: match self.sandbox.isolation.as_str() {
                "none" => Isolation::None,
                _ => Isolation::Container {
                    runtime: self.sandbox.runtime.clone(),
                },
            },
            allowed_images: self.sandbox.allowed_images.iter().cloned().collect(),
            allowed_commands: self.sandbox.allowed_commands.iter().cloned().collect(),
            kill_grace: self.sandbox.kill_grace,
        }
    }
}
