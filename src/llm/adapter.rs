//! Provider adapter abstraction
//!
//! One uniform `invoke` in front of any concrete LLM backend. The error
//! taxonomy is the contract the router depends on: a `SafetyBlock` is a
//! policy decision and must stay distinguishable from every capacity or
//! transport failure all the way up the stack.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// Conversation roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A completed model invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// One request handed to a provider adapter.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Opaque credential handle from the reservation.
    pub credential: String,
    pub model: String,
    /// Prior turns plus the current user prompt, oldest first.
    pub turns: Vec<ChatTurn>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// Error classes a provider invocation can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    SafetyBlock,
    RateLimited,
    Timeout,
    Transient,
    Fatal,
}

/// Provider failures, classified at the adapter boundary.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Policy rejection flagged by provider metadata. Never a key problem.
    #[error("safety policy block: {reason}")]
    SafetyBlock { reason: String },
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("fatal provider failure: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            ProviderError::SafetyBlock { .. } => ProviderErrorKind::SafetyBlock,
            ProviderError::RateLimited(_) => ProviderErrorKind::RateLimited,
            ProviderError::Timeout(_) => ProviderErrorKind::Timeout,
            ProviderError::Transient(_) => ProviderErrorKind::Transient,
            ProviderError::Fatal(_) => ProviderErrorKind::Fatal,
        }
    }
}

/// Uniform provider interface for dependency injection and testing.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name, e.g. "gemini".
    fn name(&self) -> &str;

    /// Run one completion. Implementations must inspect provider metadata
    /// for a policy block *before* attempting to read any content.
    async fn invoke(&self, request: InvokeRequest) -> Result<Completion, ProviderError>;
}
