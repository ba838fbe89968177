//! LLM request router
//!
//! Turns one logical call into a sequence of attempts over the key pool.
//! Capacity failures rotate keys and back off; safety blocks sanitise the
//! prompt, escalate the workload tier, and retry on the same key first. A
//! safety block must never propagate as an unhealthy-key signal; the key
//! manager release path and this attempt loop both uphold that.
//!
//! All retry policy lives here. Agents make one call and see one outcome.

pub mod conversation;

use crate::error::prompt_fingerprint;
use crate::keys::{
    KeyManager, KeyManagerSnapshot, ModelPreference, ReleaseOutcome, ReserveError, WorkloadClass,
};
use crate::llm::{
    ChatTurn, InvokeRequest, ProviderAdapter, ProviderError, TokenEstimator, TokenUsage,
};
use crate::observability::metrics::metrics;
use conversation::ConversationStore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Router tuning knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Capacity-failure attempts before giving up (safety retries budget is
    /// separate and fixed at two).
    pub max_attempts: u32,
    /// Retries of an exhausted `reserve` before the request fails.
    pub reserve_retries: u32,
    pub reserve_backoff: Duration,
    pub request_timeout: Duration,
    pub conversation_ttl: Duration,
    pub max_conversation_turns: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            reserve_retries: 3,
            reserve_backoff: Duration::from_millis(500),
            request_timeout: Duration::from_secs(120),
            conversation_ttl: Duration::from_secs(24 * 60 * 60),
            max_conversation_turns: 40,
        }
    }
}

/// One logical chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub conversation_id: Option<String>,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model_preference: ModelPreference,
    pub workload: WorkloadClass,
    pub expected_completion_tokens: u64,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            prompt: prompt.into(),
            system_prompt: None,
            model_preference: ModelPreference::Any,
            workload: WorkloadClass::Standard,
            expected_completion_tokens: 1024,
            temperature: None,
            max_output_tokens: None,
        }
    }

    pub fn in_conversation(mut self, conv_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conv_id.into());
        self
    }

    pub fn with_workload(mut self, workload: WorkloadClass) -> Self {
        self.workload = workload;
        self
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }
}

/// Successful routing result.
#[derive(Debug, Clone)]
pub struct RouterReply {
    pub content: String,
    pub model: String,
    pub key_id: String,
    pub usage: TokenUsage,
}

/// Terminal routing failures.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("all keys exhausted after {attempts} attempts")]
    AllKeysExhausted { attempts: u32 },
    #[error("no eligible key for the requested model")]
    NoEligibleKey,
    /// The prompt was refused by policy even after sanitisation and tier
    /// escalation. Carries a fingerprint, never the prompt itself.
    #[error("prompt rejected by safety policy (fingerprint {fingerprint})")]
    SafetyBlocked { fingerprint: String },
    #[error(transparent)]
    Fatal(ProviderError),
}

#[derive(Default)]
struct RouterStats {
    requests: AtomicU64,
    successes: AtomicU64,
    safety_blocks: AtomicU64,
    rate_limited: AtomicU64,
    exhausted: AtomicU64,
}

/// Serializable router health view.
#[derive(Debug, Clone, Serialize)]
pub struct RouterSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub safety_blocks: u64,
    pub rate_limited: u64,
    pub exhausted: u64,
    pub active_conversations: usize,
    pub keys: KeyManagerSnapshot,
}

/// Multi-key scheduler in front of one provider adapter.
pub struct RequestRouter {
    keys: Arc<KeyManager>,
    adapter: Arc<dyn ProviderAdapter>,
    estimator: Box<dyn TokenEstimator>,
    conversations: ConversationStore,
    config: RouterConfig,
    stats: RouterStats,
}

impl RequestRouter {
    pub fn new(
        keys: Arc<KeyManager>,
        adapter: Arc<dyn ProviderAdapter>,
        estimator: Box<dyn TokenEstimator>,
        config: RouterConfig,
    ) -> Self {
        let conversations =
            ConversationStore::new(config.conversation_ttl, config.max_conversation_turns);
        Self {
            keys,
            adapter,
            estimator,
            conversations,
            config,
            stats: RouterStats::default(),
        }
    }

    /// Send with conversation memory. Turns for one conversation id are
    /// strictly serialised; the assistant reply is appended only on success.
    pub async fn send_chat(&self, request: ChatRequest) -> Result<RouterReply, RouterError> {
        match &request.conversation_id {
            Some(conv_id) => {
                let conv_id = conv_id.clone();
                let guard = self.conversations.guard(&conv_id).await;
                let _in_flight = guard.lock().await;

                let history = self.conversations.history(&conv_id).await;
                let reply = self.attempt_loop(&request, history).await?;
                self.conversations
                    .append_exchange(
                        &conv_id,
                        ChatTurn::user(request.prompt.clone()),
                        ChatTurn::assistant(reply.content.clone()),
                    )
                    .await;
                Ok(reply)
            }
            None => self.attempt_loop(&request, Vec::new()).await,
        }
    }

    /// Send without touching conversation memory.
    pub async fn send_one_shot(&self, request: ChatRequest) -> Result<RouterReply, RouterError> {
        let mut request = request;
        request.conversation_id = None;
        self.attempt_loop(&request, Vec::new()).await
    }

    pub async fn health(&self) -> RouterSnapshot {
        RouterSnapshot {
            requests: self.stats.requests.load(Ordering::Relaxed),
            successes: self.stats.successes.load(Ordering::Relaxed),
            safety_blocks: self.stats.safety_blocks.load(Ordering::Relaxed),
            rate_limited: self.stats.rate_limited.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
            active_conversations: self.conversations.active_count().await,
            keys: self.keys.health(),
        }
    }

    /// Drive one logical request through the key pool.
    #[tracing::instrument(name = "route_request", skip(self, request, history))]
    async fn attempt_loop(
        &self,
        request: &ChatRequest,
        history: Vec<ChatTurn>,
    ) -> Result<RouterReply, RouterError> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let mut prompt = request.prompt.clone();
        let mut workload = request.workload;
        let mut capacity_attempts = 0u32;
        let mut safety_retries = 0u32;
        // After a safety block we try the same key first; a capacity failure
        // clears the preference so rotation can pick a different key.
        let mut preferred_key: Option<String> = None;

        loop {
            let history_tokens: u64 = history
                .iter()
                .map(|t| self.estimator.estimate(&t.content))
                .sum();
            let system_tokens = request
                .system_prompt
                .as_ref()
                .map(|s| self.estimator.estimate(s))
                .unwrap_or(0);
            let prompt_tokens = self.estimator.estimate(&prompt) + history_tokens + system_tokens;

            let reservation = self
                .reserve_with_retries(
                    request,
                    workload,
                    prompt_tokens,
                    preferred_key.as_deref(),
                    capacity_attempts,
                )
                .await?;

            let mut turns = history.clone();
            turns.push(ChatTurn::user(prompt.clone()));
            let invoke = InvokeRequest {
                credential: reservation.credential.clone(),
                model: reservation.model.clone(),
                turns,
                system_prompt: request.system_prompt.clone(),
                temperature: request.temperature,
                max_output_tokens: request.max_output_tokens,
            };

            metrics().record_llm_attempt();
            let key_id = reservation.key_id.clone();
            let model = reservation.model.clone();
            let outcome =
                tokio::time::timeout(self.config.request_timeout, self.adapter.invoke(invoke))
                    .await;

            match outcome {
                Err(_elapsed) => {
                    warn!(key_id = %key_id, "provider call timed out");
                    self.keys
                        .release(reservation, 0, ReleaseOutcome::TransientError);
                    capacity_attempts += 1;
                    if capacity_attempts >= self.config.max_attempts {
                        self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                        return Err(RouterError::AllKeysExhausted {
                            attempts: capacity_attempts,
                        });
                    }
                    preferred_key = None;
                    tokio::time::sleep(self.config.reserve_backoff * capacity_attempts).await;
                }
                Ok(Ok(completion)) => {
                    self.keys.release(
                        reservation,
                        completion.usage.completion_tokens,
                        ReleaseOutcome::Ok,
                    );
                    self.stats.successes.fetch_add(1, Ordering::Relaxed);
                    debug!(key_id = %key_id, model = %model, "request routed successfully");
                    return Ok(RouterReply {
                        content: completion.content,
                        model: completion.model,
                        key_id,
                        usage: completion.usage,
                    });
                }
                Ok(Err(err)) => match err {
                    ProviderError::SafetyBlock { ref reason } => {
                        // The one invariant that matters most: release as a
                        // safety block, which leaves the key healthy and out
                        // of cool-down.
                        self.keys.release(reservation, 0, ReleaseOutcome::SafetyBlock);
                        self.stats.safety_blocks.fetch_add(1, Ordering::Relaxed);
                        metrics().record_safety_block();
                        safety_retries += 1;
                        if safety_retries > 2 {
                            let fingerprint = prompt_fingerprint(&request.prompt);
                            warn!(
                                fingerprint = %fingerprint,
                                "prompt still safety-blocked after escalation"
                            );
                            return Err(RouterError::SafetyBlocked { fingerprint });
                        }
                        info!(
                            key_id = %key_id,
                            reason = %reason,
                            retry = safety_retries,
                            "safety block, sanitising and escalating workload tier"
                        );
                        prompt = sanitize_prompt(&prompt);
                        workload = workload.escalate();
                        // Same key first; the last retry drops the pin so
                        // selection can fall back to a different eligible key.
                        preferred_key = if safety_retries < 2 {
                            Some(key_id)
                        } else {
                            None
                        };
                    }
                    ProviderError::RateLimited(_) => {
                        self.keys
                            .release(reservation, 0, ReleaseOutcome::RateLimited);
                        self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                        metrics().record_rate_limited();
                        capacity_attempts += 1;
                        if capacity_attempts >= self.config.max_attempts {
                            self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                            return Err(RouterError::AllKeysExhausted {
                                attempts: capacity_attempts,
                            });
                        }
                        // Reselect: the cooled key is no longer eligible.
                        preferred_key = None;
                    }
                    ProviderError::Timeout(_) | ProviderError::Transient(_) => {
                        self.keys
                            .release(reservation, 0, ReleaseOutcome::TransientError);
                        capacity_attempts += 1;
                        if capacity_attempts >= self.config.max_attempts {
                            self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                            return Err(RouterError::AllKeysExhausted {
                                attempts: capacity_attempts,
                            });
                        }
                        preferred_key = None;
                        tokio::time::sleep(self.config.reserve_backoff * capacity_attempts).await;
                    }
                    ProviderError::Fatal(_) => {
                        self.keys
                            .release(reservation, 0, ReleaseOutcome::FatalError);
                        return Err(RouterError::Fatal(err));
                    }
                },
            }
        }
    }

    async fn reserve_with_retries(
        &self,
        request: &ChatRequest,
        workload: WorkloadClass,
        prompt_tokens: u64,
        preferred_key: Option<&str>,
        capacity_attempts: u32,
    ) -> Result<crate::keys::Reservation, RouterError> {
        let mut tries = 0u32;
        loop {
            match self.keys.reserve_with_preference(
                &request.model_preference,
                workload,
                prompt_tokens,
                request.expected_completion_tokens,
                preferred_key,
            ) {
                Ok(reservation) => return Ok(reservation),
                Err(ReserveError::NoMatchingKey) => {
                    return Err(RouterError::NoEligibleKey);
                }
                Err(ReserveError::Exhausted) => {
                    tries += 1;
                    if tries > self.config.reserve_retries {
                        self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                        return Err(RouterError::AllKeysExhausted {
                            attempts: capacity_attempts + tries,
                        });
                    }
                    tokio::time::sleep(self.config.reserve_backoff * tries).await;
                }
            }
        }
    }
}

/// Strip low-signal tokens before a safety-escalated retry: pure punctuation
/// runs and repeated character padding carry no meaning but trip filters.
pub(crate) fn sanitize_prompt(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .filter(|token| token.chars().any(|c| c.is_alphanumeric()))
        .map(collapse_runs)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Collapse any character repeated more than three times in a row.
fn collapse_runs(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut last: Option<char> = None;
    let mut run = 0usize;
    for ch in token.chars() {
        if Some(ch) == last {
            run += 1;
        } else {
            run = 1;
            last = Some(ch);
        }
        if run <= 3 {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_drops_pure_punctuation_tokens() {
        let cleaned = sanitize_prompt("write a strategy !!! ??? --- now");
        assert_eq!(cleaned, "write a strategy now");
    }

    #[test]
    fn test_sanitize_collapses_character_runs() {
        let cleaned = sanitize_prompt("pleaseeeeeee helllllp");
        assert_eq!(cleaned, "pleaseee helllp");
    }

    #[test]
    fn test_sanitize_keeps_normal_text() {
        let prompt = "momentum crossover with 20-day lookback";
        assert_eq!(sanitize_prompt(prompt), prompt);
    }

    #[test]
    fn test_chat_request_builder() {
        let request = ChatRequest::new("hello")
            .in_conversation("c1")
            .with_workload(WorkloadClass::Heavy)
            .with_system_prompt("be terse");
        assert_eq!(request.conversation_id.as_deref(), Some("c1"));
        assert_eq!(request.workload, WorkloadClass::Heavy);
        assert_eq!(request.system_prompt.as_deref(), Some("be terse"));
    }
}
