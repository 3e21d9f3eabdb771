//! Configuration and settings management
//!
//! Loads settings from environment variables and defines model constants.

use crate::conversation::UsagePolicy;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// The five supported model families
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Google Gemini
    Gemini,
    /// OpenAI ChatGPT
    ChatGpt,
    /// Anthropic Claude
    Claude,
    /// xAI Grok
    Grok,
    /// DeepSeek
    DeepSeek,
}

/// How a provider keeps track of the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryMode {
    /// Conversation lives behind a session handle
    Session,
    /// The full message list is sent with every request
    Stateless,
}

impl ModelKind {
    /// All models in keyboard order
    pub const ALL: [Self; 5] = [
        Self::Gemini,
        Self::ChatGpt,
        Self::Grok,
        Self::Claude,
        Self::DeepSeek,
    ];

    /// Human readable name shown in the UI
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Gemini => "Gemini",
            Self::ChatGpt => "ChatGPT",
            Self::Claude => "Claude",
            Self::Grok => "Grok",
            Self::DeepSeek => "DeepSeek",
        }
    }

    /// Stable identifier used in callback data and persisted state
    #[must_use]
    pub const fn slug(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::ChatGpt => "chatgpt",
            Self::Claude => "claude",
            Self::Grok => "grok",
            Self::DeepSeek => "deepseek",
        }
    }

    /// Parse a slug produced by [`ModelKind::slug`]
    #[must_use]
    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.slug() == slug)
    }

    /// Conversation representation required by the provider
    #[must_use]
    pub const fn history_mode(self) -> HistoryMode {
        match self {
            Self::Gemini | Self::Grok => HistoryMode::Session,
            Self::ChatGpt | Self::Claude | Self::DeepSeek => HistoryMode::Stateless,
        }
    }

    /// Whether the history sent to the provider must start with a user turn
    #[must_use]
    pub const fn requires_user_first(self) -> bool {
        matches!(self, Self::Claude)
    }

    /// Whether the provider accepts images
    #[must_use]
    pub const fn supports_vision(self) -> bool {
        !matches!(self, Self::DeepSeek)
    }

    /// Persona prompt sent as the system instruction
    #[must_use]
    pub const fn system_prompt(self) -> &'static str {
        match self {
            Self::Gemini => GEMINI_SYSTEM_PROMPT,
            Self::ChatGpt => CHATGPT_SYSTEM_PROMPT,
            Self::Claude => CLAUDE_SYSTEM_PROMPT,
            Self::Grok => GROK_SYSTEM_PROMPT,
            Self::DeepSeek => DEEPSEEK_SYSTEM_PROMPT,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

const GEMINI_SYSTEM_PROMPT: &str = "You are a helpful, witty, and knowledgeable AI assistant. \
You can remember our conversation history and provide contextual responses. \
Keep your answers clear, concise, and friendly. \
When analyzing images, be descriptive and specific about what you observe.";

const CHATGPT_SYSTEM_PROMPT: &str = "You are a helpful, witty, and knowledgeable AI assistant.
You provide clear, accurate, and friendly responses to user questions.
You can engage in natural conversations and remember context.";

const CLAUDE_SYSTEM_PROMPT: &str = "You are a helpful, witty, and knowledgeable AI assistant.
You provide clear, concise, and accurate answers.
You can engage in natural conversations and remember context from earlier in the conversation.
You're friendly and professional.";

const GROK_SYSTEM_PROMPT: &str = "You are Grok, a witty and intelligent AI assistant created by xAI.
You provide helpful, accurate, and sometimes humorous responses.";

const DEEPSEEK_SYSTEM_PROMPT: &str = "You are a helpful, intelligent AI assistant.
You provide clear, accurate, and well-reasoned responses.
You excel at coding, mathematics, and logical reasoning.";

/// Information about a configured model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Provider-side model identifier
    pub id: String,
    /// Maximum allowed output tokens
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

/// Default Gemini model
pub const GEMINI_DEFAULT_MODEL: &str = "gemini-2.5-flash";
/// Default `OpenAI` model
pub const CHATGPT_DEFAULT_MODEL: &str = "gpt-4o";
/// Default Claude model
pub const CLAUDE_DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
/// Default Grok model
pub const GROK_DEFAULT_MODEL: &str = "grok-4";
/// Default `DeepSeek` model
pub const DEEPSEEK_DEFAULT_MODEL: &str = "deepseek-chat";
/// `DeepSeek` model with chain-of-thought output
pub const DEEPSEEK_REASONING_MODEL: &str = "deepseek-reasoner";

/// Output token budget for chat replies
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
/// Sampling temperature for chat replies
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

/// Messages kept in a stateless history
pub const HISTORY_MAX_MESSAGES: usize = 20;
/// Messages kept in a live session transcript
pub const SESSION_MAX_MESSAGES: usize = 100;
/// Idle time after which an in-memory session is dropped (2 hours)
pub const SESSION_IDLE_SECS: u64 = 7200;
/// Maximum number of live sessions
pub const SESSION_MAX_CAPACITY: u64 = 10_000;

/// Prompt used for photos sent without a caption
pub const DEFAULT_IMAGE_PROMPT: &str = "Describe this image in detail.";

/// Default LLM HTTP timeout in seconds
pub const LLM_HTTP_TIMEOUT_SECS: u64 = 120;

/// Telegram API retry: maximum attempts
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;
/// Telegram API retry: initial backoff
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Telegram API retry: backoff cap
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4000;

/// Get the LLM HTTP timeout from env or default.
///
/// Environment variable: `LLM_HTTP_TIMEOUT_SECS`.
#[must_use]
pub fn get_llm_http_timeout_secs() -> u64 {
    std::env::var("LLM_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LLM_HTTP_TIMEOUT_SECS)
}

/// Get the Telegram API retry count from env or default.
///
/// Environment variable: `TELEGRAM_API_MAX_RETRIES`.
#[must_use]
pub fn get_telegram_api_max_retries() -> usize {
    std::env::var("TELEGRAM_API_MAX_RETRIES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(TELEGRAM_API_MAX_RETRIES)
}

/// Get the first Telegram retry delay from env or default.
///
/// Environment variable: `TELEGRAM_API_INITIAL_BACKOFF_MS`.
#[must_use]
pub fn get_telegram_api_initial_backoff_ms() -> u64 {
    std::env::var("TELEGRAM_API_INITIAL_BACKOFF_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(TELEGRAM_API_INITIAL_BACKOFF_MS)
}

/// Get the Telegram retry delay cap from env or default.
///
/// Environment variable: `TELEGRAM_API_MAX_BACKOFF_MS`.
#[must_use]
pub fn get_telegram_api_max_backoff_ms() -> u64 {
    std::env::var("TELEGRAM_API_MAX_BACKOFF_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(TELEGRAM_API_MAX_BACKOFF_MS)
}

/// Get the stateless history limit from env or default.
///
/// Environment variable: `HISTORY_MAX_MESSAGES`. Odd values are rounded down
/// so the history always holds whole turns; the minimum is one turn.
#[must_use]
pub fn get_history_max_messages() -> usize {
    history_limit(std::env::var("HISTORY_MAX_MESSAGES").ok().as_deref())
}

fn history_limit(raw: Option<&str>) -> usize {
    raw.and_then(|s| s.trim().parse::<usize>().ok())
        .map_or(HISTORY_MAX_MESSAGES, |n| (n - n % 2).max(2))
}

/// Whether verbose logging is requested.
///
/// Environment variable: `DEBUG_MODE` (`true` or `1`).
#[must_use]
pub fn get_debug_mode() -> bool {
    std::env::var("DEBUG_MODE")
        .is_ok_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// Comma-separated list of allowed user IDs (empty = everyone)
    #[serde(rename = "allowed_users")]
    pub allowed_users_str: Option<String>,

    /// Gemini API key
    pub gemini_api_key: Option<String>,
    /// `OpenAI` API key
    pub openai_api_key: Option<String>,
    /// Anthropic API key
    pub anthropic_api_key: Option<String>,
    /// xAI API key
    pub xai_api_key: Option<String>,
    /// `DeepSeek` API key
    pub deepseek_api_key: Option<String>,

    /// Model id overrides
    pub gemini_model: Option<String>,
    /// `OpenAI` model override
    pub chatgpt_model: Option<String>,
    /// Claude model override
    pub claude_model: Option<String>,
    /// Grok model override
    pub grok_model: Option<String>,
    /// `DeepSeek` model override
    pub deepseek_model: Option<String>,

    /// Use the `DeepSeek` reasoning model
    #[serde(default)]
    pub deepseek_reasoning: bool,

    /// Snapshot file for per-user state
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Seconds between snapshot flushes
    #[serde(default = "default_flush_interval")]
    pub state_flush_interval_secs: u64,

    /// Length of a usage window in seconds
    #[serde(default = "default_usage_window")]
    pub usage_window_secs: u64,
    /// Claude requests per window (0 = unlimited)
    #[serde(default = "default_claude_max_requests")]
    pub claude_max_requests: u32,
    /// ChatGPT requests per window (0 = unlimited)
    #[serde(default = "default_chatgpt_max_requests")]
    pub chatgpt_max_requests: u32,
    /// Gemini requests per window (0 = unlimited)
    #[serde(default)]
    pub gemini_max_requests: u32,
    /// Grok requests per window (0 = unlimited)
    #[serde(default)]
    pub grok_max_requests: u32,
    /// `DeepSeek` requests per window (0 = unlimited)
    #[serde(default)]
    pub deepseek_max_requests: u32,
}

fn default_state_file() -> String {
    "data/user_state.json".to_string()
}

const fn default_flush_interval() -> u64 {
    30
}

const fn default_usage_window() -> u64 {
    3600
}

const fn default_claude_max_requests() -> u32 {
    20
}

const fn default_chatgpt_max_requests() -> u32 {
    50
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ai_models_bot::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Not checked into git
            .add_source(File::with_name("config/local").required(false))
            // `APP__STATE_FILE=...` style overrides
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Plain env vars, UPPER_SNAKE_CASE -> snake_case
            .add_source(Environment::default().ignore_empty(true))
            .build()?
            .try_deserialize()
    }

    /// Returns a set of Telegram IDs that are allowed to use the bot
    #[must_use]
    pub fn allowed_users(&self) -> HashSet<i64> {
        self.allowed_users_str
            .as_ref()
            .map(|s| {
                s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .filter(|token| !token.is_empty())
                    .filter_map(|id| id.parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// An empty allowlist lets everyone in
    #[must_use]
    pub fn is_user_allowed(&self, user_id: i64) -> bool {
        let allowed = self.allowed_users();
        allowed.is_empty() || allowed.contains(&user_id)
    }

    /// API key configured for the given provider
    #[must_use]
    pub fn api_key(&self, kind: ModelKind) -> Option<&str> {
        let key = match kind {
            ModelKind::Gemini => &self.gemini_api_key,
            ModelKind::ChatGpt => &self.openai_api_key,
            ModelKind::Claude => &self.anthropic_api_key,
            ModelKind::Grok => &self.xai_api_key,
            ModelKind::DeepSeek => &self.deepseek_api_key,
        };
        key.as_deref().filter(|k| !k.is_empty())
    }

    /// Model configuration, with overrides applied
    #[must_use]
    pub fn model_info(&self, kind: ModelKind) -> ModelInfo {
        let (override_id, default_id) = match kind {
            ModelKind::Gemini => (&self.gemini_model, GEMINI_DEFAULT_MODEL),
            ModelKind::ChatGpt => (&self.chatgpt_model, CHATGPT_DEFAULT_MODEL),
            ModelKind::Claude => (&self.claude_model, CLAUDE_DEFAULT_MODEL),
            ModelKind::Grok => (&self.grok_model, GROK_DEFAULT_MODEL),
            ModelKind::DeepSeek if self.deepseek_reasoning => {
                (&self.deepseek_model, DEEPSEEK_REASONING_MODEL)
            }
            ModelKind::DeepSeek => (&self.deepseek_model, DEEPSEEK_DEFAULT_MODEL),
        };

        ModelInfo {
            id: override_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| default_id.to_string()),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// Usage policy for a provider, `None` when unlimited
    #[must_use]
    pub fn usage_policy(&self, kind: ModelKind) -> Option<UsagePolicy> {
        let max_requests = match kind {
            ModelKind::Gemini => self.gemini_max_requests,
            ModelKind::ChatGpt => self.chatgpt_max_requests,
            ModelKind::Claude => self.claude_max_requests,
            ModelKind::Grok => self.grok_max_requests,
            ModelKind::DeepSeek => self.deepseek_max_requests,
        };
        if max_requests == 0 || self.usage_window_secs == 0 {
            return None;
        }
        Some(UsagePolicy::new(
            max_requests,
            Duration::from_secs(self.usage_window_secs),
        ))
    }

    /// Settings with only a token, everything else defaulted
    #[must_use]
    pub fn with_token(telegram_token: impl Into<String>) -> Self {
        Self {
            telegram_token: telegram_token.into(),
            allowed_users_str: None,
            gemini_api_key: None,
            openai_api_key: None,
            anthropic_api_key: None,
            xai_api_key: None,
            deepseek_api_key: None,
            gemini_model: None,
            chatgpt_model: None,
            claude_model: None,
            grok_model: None,
            deepseek_model: None,
            deepseek_reasoning: false,
            state_file: default_state_file(),
            state_flush_interval_secs: default_flush_interval(),
            usage_window_secs: default_usage_window(),
            claude_max_requests: default_claude_max_requests(),
            chatgpt_max_requests: default_chatgpt_max_requests(),
            gemini_max_requests: 0,
            grok_max_requests: 0,
            deepseek_max_requests: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_env_loading() -> Result<(), Box<dyn std::error::Error>> {
        env::set_var("TELEGRAM_TOKEN", "dummy_token");
        env::set_var("CLAUDE_MAX_REQUESTS", "5");
        env::set_var("DEEPSEEK_API_KEY", "");

        let settings = Settings::new()?;
        assert_eq!(settings.telegram_token, "dummy_token");
        assert_eq!(settings.claude_max_requests, 5);
        // Empty env vars are treated as unset
        assert_eq!(settings.api_key(ModelKind::DeepSeek), None);
        assert_eq!(settings.state_file, "data/user_state.json");

        env::remove_var("TELEGRAM_TOKEN");
        env::remove_var("CLAUDE_MAX_REQUESTS");
        env::remove_var("DEEPSEEK_API_KEY");
        Ok(())
    }

    #[test]
    fn test_history_limit_keeps_whole_turns() {
        assert_eq!(history_limit(None), HISTORY_MAX_MESSAGES);
        assert_eq!(history_limit(Some("junk")), HISTORY_MAX_MESSAGES);
        assert_eq!(history_limit(Some("30")), 30);
        assert_eq!(history_limit(Some(" 15 ")), 14);
        assert_eq!(history_limit(Some("1")), 2);
        assert_eq!(history_limit(Some("0")), 2);
    }

    #[test]
    fn test_list_parsing() {
        let mut settings = Settings::with_token("dummy");

        assert!(settings.allowed_users().is_empty());
        assert!(settings.is_user_allowed(42));

        settings.allowed_users_str = Some("333; 444, 555".to_string());
        let allowed = settings.allowed_users();
        assert!(allowed.contains(&333));
        assert!(allowed.contains(&444));
        assert!(allowed.contains(&555));
        assert_eq!(allowed.len(), 3);

        settings.allowed_users_str = Some("abc, 777".to_string());
        assert!(settings.is_user_allowed(777));
        assert!(!settings.is_user_allowed(42));
    }

    #[test]
    fn test_slug_roundtrip_and_modes() {
        for kind in ModelKind::ALL {
            assert_eq!(ModelKind::from_slug(kind.slug()), Some(kind));
        }
        assert_eq!(ModelKind::from_slug("nova"), None);
        assert_eq!(ModelKind::Gemini.history_mode(), HistoryMode::Session);
        assert_eq!(ModelKind::Grok.history_mode(), HistoryMode::Session);
        assert_eq!(ModelKind::Claude.history_mode(), HistoryMode::Stateless);
        assert!(!ModelKind::DeepSeek.supports_vision());
    }

    #[test]
    fn test_model_info_overrides() {
        let mut settings = Settings::with_token("dummy");
        assert_eq!(
            settings.model_info(ModelKind::DeepSeek).id,
            DEEPSEEK_DEFAULT_MODEL
        );

        settings.deepseek_reasoning = true;
        assert_eq!(
            settings.model_info(ModelKind::DeepSeek).id,
            DEEPSEEK_REASONING_MODEL
        );

        settings.chatgpt_model = Some("gpt-4o-mini".to_string());
        assert_eq!(settings.model_info(ModelKind::ChatGpt).id, "gpt-4o-mini");
    }

    #[test]
    fn test_usage_policy_defaults() {
        let mut settings = Settings::with_token("dummy");
        let claude = settings.usage_policy(ModelKind::Claude);
        assert_eq!(claude.map(|p| p.max_requests), Some(20));
        assert!(settings.usage_policy(ModelKind::Gemini).is_none());

        settings.claude_max_requests = 0;
        assert!(settings.usage_policy(ModelKind::Claude).is_none());
    }
}
