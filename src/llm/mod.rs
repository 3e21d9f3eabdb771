//! LLM providers and client
//!
//! Provides a unified interface to the five supported model APIs
//! (Gemini, ChatGPT, Claude, Grok, `DeepSeek`).

mod common;
mod http_utils;
mod openai_compat;
/// Implementations of specific LLM providers
pub mod providers;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ModelInfo, ModelKind, Settings, DEEPSEEK_REASONING_MODEL};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

/// Errors that can occur during LLM operations
#[derive(Debug, Error)]
pub enum LlmError {
    /// Error returned by the provider's API
    #[error("API error: {0}")]
    ApiError(String),
    /// Error during network communication
    #[error("Network error: {0}")]
    NetworkError(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    JsonError(String),
    /// Missing provider configuration or API key
    #[error("Missing client/API key: {0}")]
    MissingConfig(String),
    /// Rate limit exceeded (429), optionally with a wait time
    #[error("Rate limit exceeded: {message} (wait: {wait_secs:?}s)")]
    RateLimit {
        /// Retry-After duration in seconds, if provided by the server
        wait_secs: Option<u64>,
        /// Error message from the server
        message: String,
    },
    /// The provider cannot handle this kind of request
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// Any other unexpected error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl LlmError {
    /// Text shown to the Telegram user when a request to `kind` fails
    #[must_use]
    pub fn user_message(&self, kind: ModelKind) -> String {
        match self {
            Self::RateLimit { .. } => "⚠️ Too many requests. Please slow down.".to_string(),
            Self::MissingConfig(_) => {
                format!("❌ {kind} is not configured on this bot. Please choose another model.")
            }
            Self::Unsupported(_) => format!("❌ {kind} can't handle this kind of message."),
            Self::ApiError(msg) => Self::classify_api_error(msg, kind),
            Self::NetworkError(_) | Self::JsonError(_) | Self::Unknown(_) => generic_failure(kind),
        }
    }

    fn classify_api_error(msg: &str, kind: ModelKind) -> String {
        let lower = msg.to_lowercase();
        if lower.contains("insufficient") || lower.contains("quota") {
            format!("⚠️ {kind} API quota exceeded. Please try again later.")
        } else if lower.contains("rate_limit") || lower.contains("rate limit") {
            "⚠️ Too many requests. Please slow down.".to_string()
        } else if lower.contains("context_length") || lower.contains("too long") {
            "⚠️ Message too long. Try /reset to clear history.".to_string()
        } else if lower.contains("overloaded") {
            format!("⚠️ {kind} is experiencing high demand. Please try again in a moment.")
        } else if lower.contains("invalid_api_key")
            || lower.contains("authentication")
            || lower.contains("401")
        {
            format!("❌ Authentication with {kind} failed. Please contact the bot owner.")
        } else {
            generic_failure(kind)
        }
    }
}

fn generic_failure(kind: ModelKind) -> String {
    format!("An error occurred while talking to {kind}. Please try again later.")
}

/// Author of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The Telegram user
    User,
    /// The model
    Assistant,
}

impl Role {
    /// Wire name used by OpenAI-style APIs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A message in an LLM conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Text content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    #[must_use]
    pub fn user(content: &str) -> Self {
        Self {
            role: Role::User,
            content: content.to_string(),
        }
    }

    /// Create a new assistant message
    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self {
            role: Role::Assistant,
            content: content.to_string(),
        }
    }
}

/// Interface for all LLM providers
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a chat completion from prior turns plus a new user message
    async fn chat_completion(
        &self,
        system_prompt: &str,
        history: &[Message],
        user_message: &str,
        model: &ModelInfo,
    ) -> Result<String, LlmError>;

    /// Analyze an image
    async fn analyze_image(
        &self,
        image_bytes: Vec<u8>,
        text_prompt: &str,
        system_prompt: &str,
        model: &ModelInfo,
    ) -> Result<String, LlmError>;
}

/// Unified client for interacting with the configured providers
pub struct LlmClient {
    providers: HashMap<ModelKind, Arc<dyn LlmProvider>>,
    models: HashMap<ModelKind, ModelInfo>,
}

impl LlmClient {
    /// Create a new LLM client with providers configured from settings
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        let mut providers: HashMap<ModelKind, Arc<dyn LlmProvider>> = HashMap::new();

        if let Some(key) = settings.api_key(ModelKind::Gemini) {
            providers.insert(
                ModelKind::Gemini,
                Arc::new(providers::GeminiProvider::new(key.to_string())),
            );
        }
        if let Some(key) = settings.api_key(ModelKind::ChatGpt) {
            providers.insert(
                ModelKind::ChatGpt,
                Arc::new(providers::OpenAiProvider::new(key.to_string())),
            );
        }
        if let Some(key) = settings.api_key(ModelKind::Claude) {
            providers.insert(
                ModelKind::Claude,
                Arc::new(providers::ClaudeProvider::new(key.to_string())),
            );
        }
        if let Some(key) = settings.api_key(ModelKind::Grok) {
            providers.insert(
                ModelKind::Grok,
                Arc::new(providers::GrokProvider::new(key.to_string())),
            );
        }
        if let Some(key) = settings.api_key(ModelKind::DeepSeek) {
            providers.insert(
                ModelKind::DeepSeek,
                Arc::new(providers::DeepSeekProvider::new(key.to_string())),
            );
        }

        let models = ModelKind::ALL
            .into_iter()
            .map(|kind| (kind, settings.model_info(kind)))
            .collect();

        Self { providers, models }
    }

    /// Register a custom/mock LLM provider, replacing any configured one
    pub fn register_provider(&mut self, kind: ModelKind, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(kind, provider);
    }

    /// Returns true if requested provider is configured.
    #[must_use]
    pub fn is_provider_available(&self, kind: ModelKind) -> bool {
        self.providers.contains_key(&kind)
    }

    /// Models with a configured provider, in keyboard order
    #[must_use]
    pub fn available_models(&self) -> Vec<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .filter(|kind| self.is_provider_available(*kind))
            .collect()
    }

    /// Returns the model info for the given kind
    #[must_use]
    pub fn model_info(&self, kind: ModelKind) -> ModelInfo {
        self.models.get(&kind).cloned().unwrap_or_else(|| ModelInfo {
            id: String::new(),
            max_tokens: crate::config::DEFAULT_MAX_TOKENS,
            temperature: crate::config::DEFAULT_TEMPERATURE,
        })
    }

    fn get_provider(&self, kind: ModelKind) -> Result<&dyn LlmProvider, LlmError> {
        self.providers
            .get(&kind)
            .map(AsRef::as_ref)
            .ok_or_else(|| LlmError::MissingConfig(kind.slug().to_string()))
    }

    /// Perform a chat completion request
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingConfig` if the provider is not configured, or any error from the provider.
    #[instrument(skip(self, history, user_message), fields(history_len = history.len()))]
    pub async fn chat_completion(
        &self,
        kind: ModelKind,
        history: &[Message],
        user_message: &str,
    ) -> Result<String, LlmError> {
        let provider = self.get_provider(kind)?;
        let model = self.model_info(kind);

        debug!(model = %model.id, "Sending request to LLM");
        trace!(history = ?history, user_message = user_message, "Full LLM Request");

        let start = std::time::Instant::now();
        let result = provider
            .chat_completion(kind.system_prompt(), history, user_message, &model)
            .await;
        let duration = start.elapsed();

        match &result {
            Ok(resp) => {
                debug!(
                    model = %model.id,
                    duration_ms = duration.as_millis(),
                    "Received success response from LLM"
                );
                trace!(response = ?resp, "Full LLM Response");
            }
            Err(e) => {
                warn!(
                    model = %model.id,
                    duration_ms = duration.as_millis(),
                    error = %e,
                    "Received error response from LLM"
                );
            }
        }

        let reply = result?;
        if model.id == DEEPSEEK_REASONING_MODEL {
            return Ok(format_reasoning(&reply));
        }
        Ok(reply)
    }

    /// Analyze an image with a text prompt
    ///
    /// # Errors
    ///
    /// Returns `LlmError::Unsupported` for text-only models, or any error from the provider.
    #[instrument(skip(self, image_bytes, text_prompt), fields(image_len = image_bytes.len()))]
    pub async fn analyze_image(
        &self,
        kind: ModelKind,
        image_bytes: Vec<u8>,
        text_prompt: &str,
    ) -> Result<String, LlmError> {
        if !kind.supports_vision() {
            return Err(LlmError::Unsupported(format!(
                "{kind} does not accept images"
            )));
        }
        let provider = self.get_provider(kind)?;
        let model = self.model_info(kind);
        provider
            .analyze_image(image_bytes, text_prompt, kind.system_prompt(), &model)
            .await
    }
}

/// Render `<think>...</think>` output of reasoning models as two labelled sections.
///
/// Replies without a well-formed thinking block are returned unchanged.
#[must_use]
pub fn format_reasoning(reply: &str) -> String {
    if !reply.contains("<think>") {
        return reply.to_string();
    }
    let parts: Vec<&str> = reply.split("</think>").collect();
    if parts.len() != 2 {
        return reply.to_string();
    }
    let thinking = parts[0].replace("<think>", "");
    let answer = parts[1].trim();
    format!("💭 Thinking:\n{}\n\n📝 Answer:\n{answer}", thinking.trim())
}
