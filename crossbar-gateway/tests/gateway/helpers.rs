//! Shared harness: an in-process gateway wired to in-memory store and
//! secrets, with providers pointing at wiremock upstreams or local
//! commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;

use crossbar_adapters::provider::{
    AuthMode, CliConfig, HttpConfig, ModelMapping, ProviderKind, ProviderRecord, VariantConfig,
};
use crossbar_adapters::secrets::{MemorySecrets, SecretsBackend};
use crossbar_gateway::auth::Permission;
use crossbar_gateway::config::{Config, SeedKeyConfig};
use crossbar_gateway::server::{create_app, seed_memory_store};
use crossbar_gateway::store::MemoryStore;

pub const TEST_KEY: &str = "cb-test-key-000000000000000000000000";

pub fn http_provider(id: &str, priority: i32, base_url: String, model: &str) -> ProviderRecord {
    ProviderRecord {
        id: id.to_string(),
        name: id.to_string(),
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
            external_id: model.to_string(),
            internal_id: format!("internal-{model}"),
            max_output_tokens: Some(4096),
            context_window: None,
            supports_streaming: true,
            supports_embeddings: true,
            cost_per_1k_tokens: None,
            rate_limit: None,
        }],
        priority,
        tags: vec![],
    }
}

pub fn cli_echo_provider(id: &str, model: &str) -> ProviderRecord {
    ProviderRecord {
        id: id.to_string(),
        name: id.to_string(),
        kind: ProviderKind::Cli,
        enabled: true,
        config: VariantConfig::Cli(CliConfig {
            command: "/bin/cat".to_string(),
            args: vec![],
            image: "alpine:latest".to_string(),
            timeout: Duration::from_secs(5),
            memory_limit_mb: 64,
            cpu_limit: 0.5,
            env: HashMap::new(),
            supports_streaming: false,
        }),
        models: vec![ModelMapping::new(model, model)],
        priority: 0,
        tags: vec![],
    }
}

pub struct TestGateway {
    pub server: TestServer,
    pub store: Arc<MemoryStore>,
}

pub async fn gateway_with(providers: Vec<ProviderRecord>, rpm: u32, tpm: u32) -> TestGateway {
    let mut config = Config::default();
    config.providers = providers;
    config.shield.enabled = false;
    // Direct execution so CLI tests do not need a container runtime.
    config.sandbox.isolation = "none".to_string();
    config.sandbox.allowed_commands = vec!["/bin/cat".to_string()];
    config.auth.seed_keys = vec![SeedKeyConfig {
        name: "test".to_string(),
        key: TEST_KEY.to_string(),
        permissions: vec![Permission::Chat, Permission::Embeddings, Permission::Models],
        requests_per_minute: rpm,
        tokens_per_minute: tpm,
        allowed_models: vec![],
    }];

    let store = Arc::new(MemoryStore::new());
    seed_memory_store(&store, &config.auth.seed_keys);
    let secrets: Arc<dyn SecretsBackend> = Arc::new(MemorySecrets::new());

    let app = create_app(config, store.clone(), secrets)
        .await
        .expect("test app builds");
    TestGateway {
        server: TestServer::new(app).expect("test server starts"),
        store,
    }
}

pub async fn gateway(providers: Vec<ProviderRecord>) -> TestGateway {
    gateway_with(providers, 600, 1_000_000).await
}

pub fn bearer() -> String {
    format!("Bearer {TEST_KEY}")
}

pub fn chat_body(model: &str, content: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": content}]
    })
}

pub fn openai_chat_response(content: &str) -> serde_json::Value {
    serde_json::json!({
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 4, "completion_tokens": 3, "total_tokens": 7}
    })
}
