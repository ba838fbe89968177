//! Gemini provider implementation
//!
//! Talks to a Google Generative Language shaped HTTP API. Safety settings
//! are enforced three times over: they are attached when the request body is
//! built, the model is checked against the supported tier list before any
//! network call, and the response is inspected for a policy block *before*
//! any candidate text is read. A block reason always surfaces as
//! `ProviderError::SafetyBlock`, never as missing content.

use crate::llm::adapter::{
    ChatTurn, Completion, InvokeRequest, ProviderAdapter, ProviderError, TokenUsage, TurnRole,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Gemini provider configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Model tiers this adapter accepts. Anything else is rejected before the
/// request leaves the process.
const SUPPORTED_MODEL_PREFIXES: &[&str] = &[
    "gemini-2.0-flash",
    "gemini-2.5-flash",
    "gemini-1.5-flash",
    "gemini-2.5-pro",
    "gemini-1.5-pro",
];

fn assert_model_supported(model: &str) -> Result<(), ProviderError> {
    if SUPPORTED_MODEL_PREFIXES.iter().any(|p| model.starts_with(p)) {
        Ok(())
    } else {
        Err(ProviderError::Fatal(format!("model not found: {model}")))
    }
}

const HARM_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

fn safety_settings() -> Vec<GeminiSafetySetting> {
    HARM_CATEGORIES
        .iter()
        .map(|category| GeminiSafetySetting {
            category: category.to_string(),
            threshold: "BLOCK_MEDIUM_AND_ABOVE".to_string(),
        })
        .collect()
}

/// Gemini provider.
pub struct GeminiProvider {
    config: GeminiConfig,
    client: Client,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Fatal(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn build_request(request: &InvokeRequest) -> Result<GeminiGenerateRequest, ProviderError> {
        let contents = request
            .turns
            .iter()
            .map(|turn| GeminiContent {
                role: Some(gemini_role(turn).to_string()),
                parts: vec![GeminiPart {
                    text: turn.content.clone(),
                }],
            })
            .collect();

        let body = GeminiGenerateRequest {
            contents,
            system_instruction: request.system_prompt.as_ref().map(|text| GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: text.clone() }],
            }),
            generation_config: Some(GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_output_tokens,
            }),
            safety_settings: safety_settings(),
        };

        // Settings must cover every harm category; a request without full
        // coverage never leaves the process.
        if body.safety_settings.len() != HARM_CATEGORIES.len() {
            return Err(ProviderError::Fatal(
                "incomplete safety settings on request".to_string(),
            ));
        }
        Ok(body)
    }
}

fn gemini_role(turn: &ChatTurn) -> &'static str {
    match turn.role {
        TurnRole::User => "user",
        TurnRole::Assistant => "model",
    }
}

fn classify_status(status: u16, body: &str) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited(format!("HTTP 429: {body}")),
        401 | 403 => ProviderError::Fatal(format!("authentication rejected: HTTP {status}")),
        404 => ProviderError::Fatal(format!("model not found: {body}")),
        500..=599 => ProviderError::Transient(format!("HTTP {status}: {body}")),
        other => ProviderError::Fatal(format!("HTTP {other}: {body}")),
    }
}

/// Response inspection: policy block first, content second.
fn inspect_response(
    response: GeminiGenerateResponse,
    requested_model: &str,
) -> Result<Completion, ProviderError> {
    if let Some(feedback) = &response.prompt_feedback {
        if let Some(reason) = &feedback.block_reason {
            return Err(ProviderError::SafetyBlock {
                reason: format!("prompt blocked: {reason}"),
            });
        }
    }

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Transient("no candidates returned".to_string()))?;

    match candidate.finish_reason.as_deref() {
        Some("SAFETY") | Some("PROHIBITED_CONTENT") | Some("BLOCKLIST") => {
            return Err(ProviderError::SafetyBlock {
                reason: format!(
                    "candidate blocked: {}",
                    candidate.finish_reason.as_deref().unwrap_or("SAFETY")
                ),
            });
        }
        _ => {}
    }

    let content = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    if content.is_empty() {
        return Err(ProviderError::Transient(
            "candidate has no text content".to_string(),
        ));
    }

    let usage = response
        .usage_metadata
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        })
        .unwrap_or_default();

    Ok(Completion {
        content,
        model: response
            .model_version
            .unwrap_or_else(|| requested_model.to_string()),
        usage,
    })
}

#[async_trait]
impl ProviderAdapter for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn invoke(&self, request: InvokeRequest) -> Result<Completion, ProviderError> {
        assert_model_supported(&request.model)?;
        let body = Self::build_request(&request)?;

        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url, request.model
        );
        debug!(model = %request.model, turns = request.turns.len(), "invoking gemini");

        let response = self
            .client
            .post(&url)
            .query(&[("key", request.credential.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.config.timeout)
                } else {
                    ProviderError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let parsed: GeminiGenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("undecodable response: {e}")))?;

        inspect_response(parsed, &request.model)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerateRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
    safety_settings: Vec<GeminiSafetySetting>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct GeminiSafetySetting {
    category: String,
    threshold: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerateResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
    usage_metadata: Option<GeminiUsageMetadata>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}
