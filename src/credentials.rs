//! Broker credential lookup.
//!
//! The secure store itself is external; the core only needs get/set/delete
//! by key. Secrets are redacted from `Debug` output and never written to the
//! database.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

pub const BROKER_ACCOUNT_KEY: &str = "broker.account_id";
pub const BROKER_API_KEY: &str = "broker.api_key";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Credential store unavailable: {0}")]
    Backend(String),
}

/// A secret value. `Debug` never prints the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for handing to a gateway client.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Key/value secret storage.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Secret, CredentialError>;

    fn set(&self, key: &str, value: Secret) -> Result<(), CredentialError>;

    fn delete(&self, key: &str) -> Result<(), CredentialError>;
}

/// Process-lifetime store, used in tests and paper trading.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: RwLock<HashMap<String, Secret>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Secret, CredentialError> {
        let values = self.values.read().map_err(|e| CredentialError::Backend(e.to_string()))?;
        values
            .get(key)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(key.to_string()))
    }

    fn set(&self, key: &str, value: Secret) -> Result<(), CredentialError> {
        let mut values = self.values.write().map_err(|e| CredentialError::Backend(e.to_string()))?;
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CredentialError> {
        let mut values = self.values.write().map_err(|e| CredentialError::Backend(e.to_string()))?;
        values.remove(key);
        Ok(())
    }
}

/// Reads `PREFIX_KEY` environment variables (`broker.api_key` becomes
/// `AUTOTRADER_BROKER_API_KEY`). Writes and deletes only affect this process.
#[derive(Debug)]
pub struct EnvCredentialStore {
    prefix: String,
    /// `None` marks a key deleted in this process
    overrides: RwLock<HashMap<String, Option<Secret>>>,
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new("AUTOTRADER")
    }
}

impl EnvCredentialStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    fn var_name(&self, key: &str) -> String {
        let key: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}_{}", self.prefix, key)
    }
}

impl CredentialStore for EnvCredentialStore {
    fn get(&self, key: &str) -> Result<Secret, CredentialError> {
        let overrides = self.overrides.read().map_err(|e| CredentialError::Backend(e.to_string()))?;
        match overrides.get(key) {
            Some(Some(secret)) => return Ok(secret.clone()),
            Some(None) => return Err(CredentialError::NotFound(key.to_string())),
            None => {}
        }

        std::env::var(self.var_name(key))
            .ok()
            .filter(|v| !v.is_empty())
            .map(Secret::new)
            .ok_or_else(|| CredentialError::NotFound(key.to_string()))
    }

    fn set(&self, key: &str, value: Secret) -> Result<(), CredentialError> {
        let mut overrides = self.overrides.write().map_err(|e| CredentialError::Backend(e.to_string()))?;
        overrides.insert(key.to_string(), Some(value));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CredentialError> {
        let mut overrides = self.overrides.write().map_err(|e| CredentialError::Backend(e.to_string()))?;
        overrides.insert(key.to_string(), None);
        Ok(())
    }
}

/// Credentials needed to construct a broker gateway.
#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub account_id: String,
    pub api_key: Secret,
}

impl BrokerCredentials {
    pub fn resolve(store: &dyn CredentialStore) -> Result<Self, CredentialError> {
        Ok(Self {
            account_id: store.get(BROKER_ACCOUNT_KEY)?.expose().to_string(),
            api_key: store.get(BROKER_API_KEY)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let creds = BrokerCredentials {
            account_id: "acc-1".to_string(),
            api_key: Secret::new("sk-live-123"),
        };
        let printed = format!("{:?}", creds);
        assert!(printed.contains("acc-1"));
        assert!(!printed.contains("sk-live-123"));
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryCredentialStore::new();
        assert_eq!(store.get("k"), Err(CredentialError::NotFound("k".to_string())));

        store.set("k", Secret::new("v")).unwrap();
        assert_eq!(store.get("k").unwrap().expose(), "v");

        store.delete("k").unwrap();
        assert!(store.get("k").is_err());
    }

    #[test]
    fn test_resolve_requires_both_keys() {
        let store = MemoryCredentialStore::new();
        store.set(BROKER_ACCOUNT_KEY, Secret::new("acc-7")).unwrap();
        assert_eq!(
            BrokerCredentials::resolve(&store).unwrap_err(),
            CredentialError::NotFound(BROKER_API_KEY.to_string())
        );

        store.set(BROKER_API_KEY, Secret::new("key")).unwrap();
        assert_eq!(BrokerCredentials::resolve(&store).unwrap().account_id, "acc-7");
    }

    #[test]
    fn test_env_store_overrides_and_deletes() {
        let store = EnvCredentialStore::new("AUTOTRADER_TEST_CREDS");
        assert_eq!(store.var_name("broker.api_key"), "AUTOTRADER_TEST_CREDS_BROKER_API_KEY");

        store.set("broker.api_key", Secret::new("override")).unwrap();
        assert_eq!(store.get("broker.api_key").unwrap().expose(), "override");

        store.delete("broker.api_key").unwrap();
        assert!(matches!(store.get("broker.api_key"), Err(CredentialError::NotFound(_))));
    }
}
