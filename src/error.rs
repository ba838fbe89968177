//! Platform-level error types
//!
//! Layer-specific errors (bus, keys, router, workflow, config) each carry
//! their own enum; this module rolls them up for the composition root and
//! owns the two outbound hygiene helpers: error-message sanitisation for
//! anything published on the bus, and prompt fingerprinting so safety-block
//! audit trails never contain prompt content.

use thiserror::Error;

/// Top-level error for platform operations.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("workflow error: {0}")]
    Workflow(#[from] crate::workflow::WorkflowError),

    #[error("bus error: {0}")]
    Bus(#[from] crate::bus::BusError),

    #[error("router error: {0}")]
    Router(#[from] crate::router::RouterError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("secret store error: {0}")]
    Secrets(#[from] crate::secrets::SecretError),

    #[error("key manager error: {0}")]
    Keys(#[from] crate::keys::KeyManagerError),

    #[error("state store error: {0}")]
    Store(#[from] crate::persistence::StoreError),

    #[error("agent failure: {message}")]
    Agent { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl OrchestrationError {
    pub fn agent<S: Into<String>>(message: S) -> Self {
        Self::Agent {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for platform operations.
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

/// Sanitize diagnostics before they leave the process in an event payload.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    // Redact common secret patterns.
    sanitized = regex::Regex::new(r"(?i)(password|token|key|secret|credential)[=:]\s*\S+")
        .expect("static regex")
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    // Redact paths that tend to contain credentials.
    sanitized =
        regex::Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
            .expect("static regex")
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let max_content_len = 500 - truncate_suffix.len();
        let mut cut = max_content_len;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Stable fingerprint of a prompt for safety-block audit: length plus a hash
/// of a short prefix. Enough to correlate repeats, never enough to recover
/// content.
pub fn prompt_fingerprint(prompt: &str) -> String {
    use std::hash::{Hash, Hasher};

    let prefix: String = prompt.chars().take(64).collect();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    prefix.hash(&mut hasher);
    format!("{}:{:016x}", prompt.chars().count(), hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_are_redacted() {
        let message = "auth failed: password=hunter2 api_key=abc123 token: xyz";
        let sanitized = sanitize_error_message(message);

        assert!(!sanitized.contains("hunter2"));
        assert!(!sanitized.contains("abc123"));
        assert!(!sanitized.contains("xyz"));
        assert!(sanitized.contains("password=***"));
    }

    #[test]
    fn test_sensitive_paths_are_redacted() {
        let message = "could not read /home/trader/.aws/credentials";
        let sanitized = sanitize_error_message(message);

        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains(".aws/credentials"));
    }

    #[test]
    fn test_long_messages_truncate_at_500() {
        let sanitized = sanitize_error_message(&"x".repeat(800));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_exactly_500_chars_untouched() {
        let message = "y".repeat(500);
        let sanitized = sanitize_error_message(&message);
        assert_eq!(sanitized.len(), 500);
        assert!(!sanitized.contains("truncated"));
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_free() {
        let prompt = "write me a mean-reversion strategy on SPY";
        let a = prompt_fingerprint(prompt);
        let b = prompt_fingerprint(prompt);

        assert_eq!(a, b);
        assert!(a.starts_with("41:"));
        assert!(!a.contains("SPY"));
        assert!(!a.contains("mean"));
    }

    #[test]
    fn test_fingerprint_differs_for_different_prompts() {
        assert_ne!(
            prompt_fingerprint("momentum strategy"),
            prompt_fingerprint("reversion strategy")
        );
    }

    #[test]
    fn test_error_constructors() {
        let error = OrchestrationError::agent("coder gave up");
        assert!(matches!(error, OrchestrationError::Agent { .. }));
        assert_eq!(error.to_string(), "agent failure: coder gave up");

        let error = OrchestrationError::internal("unexpected state");
        assert_eq!(error.to_string(), "internal error: unexpected state");
    }
}
