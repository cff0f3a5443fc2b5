//! Secrets backend interface.
//!
//! Provider records carry only a credential *reference*; the bytes are
//! fetched at adapter construction time from whatever backend the
//! deployment wires in. The in-memory implementation backs tests and
//! single-node setups seeded from config.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::AdapterError;

#[async_trait]
pub trait SecretsBackend: Send + Sync {
    /// Fetch the credential bytes for a named secret.
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, AdapterError>;

    /// Rotate a secret, returning the name of the new version.
    async fn rotate(&self, name: &str) -> Result<String, AdapterError>;
}

/// Process-local secrets map.
#[derive(Default)]
pub struct MemorySecrets {
    entries: DashMap<String, Vec<u8>>,
}

impl MemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.insert(name.into(), value.into());
    }
}

#[async_trait]
impl SecretsBackend for MemorySecrets {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, AdapterError> {
        self.entries
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AdapterError::config(format!("secret {name} not found")))
    }

    async fn rotate(&self, name: &str) -> Result<String, AdapterError> {
        let value = self.fetch(name).await?;
        let rotated = format!("{name}.{}", uuid::Uuid::new_v4().simple());
        self.entries.insert(rotated.clone(), value);
        self.entries.remove(name);
        Ok(rotated)
    }
}

/// Resolve a record's optional secret reference to a UTF-8 credential.
pub async fn resolve_credential(
    secrets: &dyn SecretsBackend,
    secret_ref: Option<&str>,
) -> Result<Option<String>, AdapterError> {
    match secret_ref {
        None => Ok(None),
        Some(name) => {
            let bytes = secrets.fetch(name).await?;
            let credential = String::from_utf8(bytes)
                .map_err(|_| AdapterError::config(format!("secret {name} is not valid UTF-8")))?;
            Ok(Some(credential))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_and_rotate() {
        let secrets = MemorySecrets::new();
        secrets.insert("upstream-key", "sk-test");

        assert_eq!(secrets.fetch("upstream-key").await.unwrap(), b"sk-test");

        let rotated = secrets.rotate("upstream-key").await.unwrap();
        assert!(secrets.fetch("upstream-key").await.is_err());
        assert_eq!(secrets.fetch(&rotated).await.unwrap(), b"sk-test");
    }

    #[tokio::test]
    async fn missing_secret_is_a_config_error() {
        let secrets = MemorySecrets::new();
        let err = resolve_credential(&secrets, Some("nope")).await.unwrap_err();
        assert!(matches!(err, AdapterError::ConfigError { .. }));
        assert!(resolve_credential(&secrets, None).await.unwrap().is_none());
    }
}
