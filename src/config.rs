//! Platform configuration
//!
//! TOML-based configuration for the bus backend, workflow bounds, router
//! tuning, the keys manifest, and agent limits. Credentials are referenced
//! by environment-variable name and resolved at composition time through the
//! secret store; no credential value ever lives in a config file.

use crate::keys::KeyRecord;
use crate::secrets::{SecretError, SecretStore};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformConfig {
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub router: RouterSection,
    pub keys: Vec<KeyManifestEntry>,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Bus backend selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusSection {
    #[serde(default = "default_bus_backend")]
    pub backend: BusBackend,
    /// Broker URL, used only by the mqtt backend.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    Memory,
    Mqtt,
}

fn default_bus_backend() -> BusBackend {
    BusBackend::Memory
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            backend: default_bus_backend(),
            broker_url: default_broker_url(),
        }
    }
}

/// Workflow engine bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSection {
    #[serde(default = "default_auto_fix_mode")]
    pub auto_fix_mode: bool,
    #[serde(default = "default_max_branch_depth")]
    pub max_branch_depth: u32,
    #[serde(default = "default_max_debug_attempts")]
    pub max_debug_attempts: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,
}

fn default_auto_fix_mode() -> bool {
    true
}

fn default_max_branch_depth() -> u32 {
    2
}

fn default_max_debug_attempts() -> u32 {
    3
}

fn default_max_iterations() -> u32 {
    5
}

fn default_task_timeout_secs() -> u64 {
    300
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            auto_fix_mode: default_auto_fix_mode(),
            max_branch_depth: default_max_branch_depth(),
            max_debug_attempts: default_max_debug_attempts(),
            max_iterations: default_max_iterations(),
            default_task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

/// Request router tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_conversation_ttl_secs")]
    pub conversation_ttl_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_conversation_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
            conversation_ttl_secs: default_conversation_ttl_secs(),
        }
    }
}

/// One entry in the keys manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyManifestEntry {
    pub key_id: String,
    /// Environment variable holding the credential.
    pub credential_env: String,
    pub model_name: String,
    #[serde(default)]
    pub priority_tags: Vec<String>,
    pub rpm_budget: u32,
    pub tpm_budget: u64,
    #[serde(default = "default_key_active")]
    pub active: bool,
}

fn default_key_active() -> bool {
    true
}

impl KeyManifestEntry {
    /// Resolve the credential reference into a usable key record.
    pub fn resolve(&self, secrets: &dyn SecretStore) -> Result<KeyRecord, SecretError> {
        let credential = secrets.resolve(&self.credential_env)?;
        Ok(KeyRecord {
            key_id: self.key_id.clone(),
            credential,
            model_name: self.model_name.clone(),
            priority_tags: self.priority_tags.clone(),
            rpm_budget: self.rpm_budget,
            tpm_budget: self.tpm_budget,
            active: self.active,
        })
    }
}

/// Agent runtime limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentsSection {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Directory agents write artifacts into.
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

fn default_max_in_flight() -> usize {
    1
}

fn default_workspace() -> String {
    "artifacts".to_string()
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            workspace: default_workspace(),
        }
    }
}

/// Health endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8080
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PlatformConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PlatformConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Consistency checks beyond what serde can express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keys.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "keys manifest must contain at least one key".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for key in &self.keys {
            if key.key_id.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "key entry with empty key_id".to_string(),
                ));
            }
            if !seen.insert(key.key_id.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate key_id: {}",
                    key.key_id
                )));
            }
            if key.rpm_budget == 0 || key.tpm_budget == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "key {} has a zero budget",
                    key.key_id
                )));
            }
        }
        if self.workflow.max_iterations == 0 {
            return Err(ConfigError::InvalidConfig(
                "workflow.max_iterations must be at least 1".to_string(),
            ));
        }
        if self.agents.max_in_flight == 0 {
            return Err(ConfigError::InvalidConfig(
                "agents.max_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the manifest into key records through the secret store.
    pub fn resolve_keys(
        &self,
        secrets: &dyn SecretStore,
    ) -> Result<Vec<KeyRecord>, SecretError> {
        self.keys.iter().map(|k| k.resolve(secrets)).collect()
    }

    /// Create a test configuration for unit testing.
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[bus]
backend = "memory"

[workflow]
auto_fix_mode = true
max_branch_depth = 2

[[keys]]
key_id = "flash-1"
credential_env = "GEMINI_KEY_FLASH_1"
model_name = "gemini-2.0-flash"
priority_tags = ["flash"]
rpm_budget = 15
tpm_budget = 1000000

[[keys]]
key_id = "pro-1"
credential_env = "GEMINI_KEY_PRO_1"
model_name = "gemini-1.5-pro"
priority_tags = ["pro"]
rpm_budget = 2
tpm_budget = 32000
"#;
        toml::from_str(toml_content).expect("test config should parse")
    }
}
