//! Secret store abstraction
//!
//! Configuration never holds credentials, only references. A reference is
//! resolved through a [`SecretStore`] at composition time; the default
//! backend reads environment variables.

use std::collections::HashMap;
use thiserror::Error;

/// Resolves credential references into opaque credential values.
pub trait SecretStore: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<String, SecretError>;
}

#[derive(Debug, Error, PartialEq)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

/// Environment-variable backend: the reference is the variable name.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn resolve(&self, reference: &str) -> Result<String, SecretError> {
        std::env::var(reference).map_err(|_| SecretError::NotFound(reference.to_string()))
    }
}

/// Fixed-map backend for tests and local composition.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretStore {
    entries: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reference: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(reference.into(), value.into());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn resolve(&self, reference: &str) -> Result<String, SecretError> {
        self.entries
            .get(reference)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_store_resolves_known_references() {
        let store = StaticSecretStore::new().with("GEMINI_KEY_1", "abc");
        assert_eq!(store.resolve("GEMINI_KEY_1").unwrap(), "abc");
        assert_eq!(
            store.resolve("MISSING"),
            Err(SecretError::NotFound("MISSING".to_string()))
        );
    }

    #[test]
    fn test_env_store_reads_environment() {
        std::env::set_var("ALGOFORGE_TEST_SECRET", "s3cr3t");
        let store = EnvSecretStore;
        assert_eq!(store.resolve("ALGOFORGE_TEST_SECRET").unwrap(), "s3cr3t");
        std::env::remove_var("ALGOFORGE_TEST_SECRET");
        assert!(store.resolve("ALGOFORGE_TEST_SECRET").is_err());
    }
}
