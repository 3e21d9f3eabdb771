//! Per-user conversation state
//!
//! Tracks which model each user picked, where their conversation with each
//! model lives, and how much of their usage allowance is left.

mod history;
mod sessions;
mod usage;

pub use history::{append_turn, truncate_history, ConversationRef};
pub use sessions::{Session, SessionHandle, SessionRegistry};
pub use usage::{UsagePolicy, UsageWindow};

use crate::config::{
    get_history_max_messages, HistoryMode, ModelKind, Settings, SESSION_IDLE_SECS,
    SESSION_MAX_CAPACITY, SESSION_MAX_MESSAGES,
};
use crate::llm::{LlmClient, LlmError, Message};
use crate::storage::JsonFileStorage;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Errors surfaced to the chat layer
#[derive(Debug, Error)]
pub enum ChatError {
    /// The user has not picked a model yet
    #[error("no model selected")]
    NoModelSelected,
    /// The picked model has no configured provider
    #[error("{0} is not configured")]
    ModelUnavailable(ModelKind),
    /// The user's allowance for this model is used up
    #[error("{model} usage limit reached, resets in {}s", retry_after.as_secs())]
    RateLimited {
        /// Limited model
        model: ModelKind,
        /// Time until the window resets
        retry_after: Duration,
        /// Requests allowed per window
        max_requests: u32,
        /// Window length
        window: Duration,
    },
    /// The provider call failed
    #[error("{model} request failed: {source}")]
    Llm {
        /// Model that failed
        model: ModelKind,
        /// Underlying provider error
        #[source]
        source: LlmError,
    },
}

impl ChatError {
    /// Refusal for an image sent to a text-only model
    #[must_use]
    pub fn vision_unsupported(model: ModelKind) -> Self {
        Self::Llm {
            model,
            source: LlmError::Unsupported(format!("{model} does not accept images")),
        }
    }

    /// Text suitable for sending back to the user
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::NoModelSelected => {
                "Please select an AI model using the buttons below first.".to_string()
            }
            Self::ModelUnavailable(model) => {
                format!("{model} is not available right now. Please choose another model.")
            }
            Self::RateLimited {
                model,
                retry_after,
                max_requests,
                window,
            } => format!(
                "⏳ You have used all {max_requests} {model} requests for this {} period. \
                 Try again in {}.",
                format_duration(*window),
                format_duration(*retry_after)
            ),
            Self::Llm { model, source } => source.user_message(*model),
        }
    }
}

/// Human-readable duration, rounded up to whole minutes past the first minute
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        return format!("{}s", secs.max(1));
    }
    let minutes = secs.div_ceil(60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    match (hours, minutes) {
        (0, m) => format!("{m} min"),
        (h, 0) => format!("{h} h"),
        (h, m) => format!("{h} h {m} min"),
    }
}

/// A model reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply text
    pub text: String,
    /// The previous session was gone and a new one was started
    pub session_restarted: bool,
}

/// Usage of one rate-limited model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelUsage {
    /// Model
    pub model: ModelKind,
    /// Requests used in the current window
    pub used: u32,
    /// Requests allowed per window
    pub max_requests: u32,
    /// Time until the window resets, `None` when no window is running
    pub resets_in: Option<Duration>,
}

/// Snapshot of a user's state for `/status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStatus {
    /// Selected model
    pub selected: Option<ModelKind>,
    /// Messages remembered for the selected model
    pub history_len: usize,
    /// Usage per rate-limited model
    pub usage: Vec<ModelUsage>,
}

/// Routes user messages to models and keeps per-user state
pub struct ConversationManager {
    storage: Arc<JsonFileStorage>,
    llm: Arc<LlmClient>,
    sessions: SessionRegistry,
    policies: HashMap<ModelKind, UsagePolicy>,
    history_max: usize,
}

impl ConversationManager {
    /// Create a manager
    #[must_use]
    pub fn new(
        storage: Arc<JsonFileStorage>,
        llm: Arc<LlmClient>,
        policies: HashMap<ModelKind, UsagePolicy>,
    ) -> Self {
        Self {
            storage,
            llm,
            sessions: SessionRegistry::new(
                Duration::from_secs(SESSION_IDLE_SECS),
                SESSION_MAX_CAPACITY,
                SESSION_MAX_MESSAGES,
            ),
            policies,
            history_max: get_history_max_messages(),
        }
    }

    /// Create a manager with the usage policies from settings
    #[must_use]
    pub fn from_settings(
        settings: &Settings,
        storage: Arc<JsonFileStorage>,
        llm: Arc<LlmClient>,
    ) -> Self {
        let policies = ModelKind::ALL
            .into_iter()
            .filter_map(|kind| settings.usage_policy(kind).map(|policy| (kind, policy)))
            .collect();
        Self::new(storage, llm, policies)
    }

    /// Whether the model's provider is configured
    #[must_use]
    pub fn is_model_available(&self, kind: ModelKind) -> bool {
        self.llm.is_provider_available(kind)
    }

    /// The user's selected model
    pub async fn selected_model(&self, user_id: i64) -> Option<ModelKind> {
        self.storage.get_user_record(user_id).await.selected_model
    }

    /// Select a model for the user
    ///
    /// # Errors
    ///
    /// Returns `ChatError::ModelUnavailable` if the provider is not configured.
    pub async fn select_model(&self, user_id: i64, kind: ModelKind) -> Result<(), ChatError> {
        if !self.is_model_available(kind) {
            return Err(ChatError::ModelUnavailable(kind));
        }
        self.storage
            .modify_user_record(user_id, |record| record.selected_model = Some(kind))
            .await;
        info!(user_id = user_id, model = %kind, "Model selected");
        Ok(())
    }

    /// Forget the user's selection, keeping conversations
    pub async fn clear_selection(&self, user_id: i64) {
        self.storage
            .modify_user_record(user_id, |record| record.selected_model = None)
            .await;
    }

    async fn selected_or_err(&self, user_id: i64) -> Result<ModelKind, ChatError> {
        let kind = self
            .selected_model(user_id)
            .await
            .ok_or(ChatError::NoModelSelected)?;
        if !self.is_model_available(kind) {
            return Err(ChatError::ModelUnavailable(kind));
        }
        Ok(kind)
    }

    async fn check_usage(&self, user_id: i64, kind: ModelKind) -> Result<(), ChatError> {
        let Some(policy) = self.policies.get(&kind).copied() else {
            return Ok(());
        };
        let now = Utc::now();

        let outcome = self
            .storage
            .modify_user_record(user_id, |record| {
                let usage = record
                    .usage
                    .entry(kind)
                    .or_insert_with(|| UsageWindow::start(now));
                policy.try_acquire(usage, now)
            })
            .await;

        match outcome {
            Ok(remaining) => {
                info!(user_id = user_id, model = %kind, remaining = remaining, "Usage recorded");
                Ok(())
            }
            Err(retry_after) => {
                warn!(
                    user_id = user_id,
                    model = %kind,
                    retry_after_secs = retry_after.as_secs(),
                    "Usage limit reached"
                );
                Err(ChatError::RateLimited {
                    model: kind,
                    retry_after,
                    max_requests: policy.max_requests,
                    window: policy.window,
                })
            }
        }
    }

    /// Send a text message to the user's selected model
    ///
    /// # Errors
    ///
    /// Returns `ChatError` if no model is selected, the usage limit is reached,
    /// or the provider call fails.
    #[instrument(skip(self, text), fields(text_len = text.len()))]
    pub async fn send(&self, user_id: i64, text: &str) -> Result<Reply, ChatError> {
        let kind = self.selected_or_err(user_id).await?;
        self.check_usage(user_id, kind).await?;

        match kind.history_mode() {
            HistoryMode::Session => self.send_with_session(user_id, kind, text).await,
            HistoryMode::Stateless => self.send_with_history(user_id, kind, text).await,
        }
    }

    async fn send_with_session(
        &self,
        user_id: i64,
        kind: ModelKind,
        text: &str,
    ) -> Result<Reply, ChatError> {
        let existing = self
            .storage
            .get_user_record(user_id)
            .await
            .conversations
            .get(&kind)
            .cloned();

        let live = match existing {
            Some(ConversationRef::Session { id }) => self.sessions.get(&id).await,
            _ => None,
        };

        let (session, session_restarted) = match (live, existing) {
            (Some(session), _) => (session, false),
            (None, previous) => {
                let restarted = matches!(previous, Some(ConversationRef::Session { .. }));
                if restarted {
                    info!(user_id = user_id, model = %kind, "Session expired, starting a new one");
                }
                let (id, session) = self.sessions.create(kind).await;
                self.storage
                    .modify_user_record(user_id, |record| {
                        record
                            .conversations
                            .insert(kind, ConversationRef::Session { id });
                    })
                    .await;
                (session, restarted)
            }
        };

        let mut session = session.lock().await;
        let text_reply = self
            .llm
            .chat_completion(kind, &session.transcript, text)
            .await
            .map_err(|source| ChatError::Llm {
                model: kind,
                source,
            })?;
        session.record_turn(text, &text_reply);

        Ok(Reply {
            text: text_reply,
            session_restarted,
        })
    }

    async fn send_with_history(
        &self,
        user_id: i64,
        kind: ModelKind,
        text: &str,
    ) -> Result<Reply, ChatError> {
        let history: Vec<Message> = self
            .storage
            .get_user_record(user_id)
            .await
            .conversations
            .get(&kind)
            .map(|conv| conv.messages().to_vec())
            .unwrap_or_default();

        let text_reply = self
            .llm
            .chat_completion(kind, &history, text)
            .await
            .map_err(|source| ChatError::Llm {
                model: kind,
                source,
            })?;

        // Append to what is stored now; a reset or another turn may have
        // landed while the provider was answering
        let (history_max, user_first) = (self.history_max, kind.requires_user_first());
        self.storage
            .modify_user_record(user_id, |record| {
                let current = match record.conversations.remove(&kind) {
                    Some(ConversationRef::Messages { history }) => history,
                    _ => Vec::new(),
                };
                let history = append_turn(current, text, &text_reply, history_max, user_first);
                record
                    .conversations
                    .insert(kind, ConversationRef::Messages { history });
            })
            .await;

        Ok(Reply {
            text: text_reply,
            session_restarted: false,
        })
    }

    /// Ask the selected model about an image; history is left alone
    ///
    /// # Errors
    ///
    /// Returns `ChatError` if no model is selected, the usage limit is reached,
    /// or the provider call fails (including models without vision).
    #[instrument(skip(self, image_bytes, prompt), fields(image_len = image_bytes.len()))]
    pub async fn analyze_image(
        &self,
        user_id: i64,
        image_bytes: Vec<u8>,
        prompt: &str,
    ) -> Result<Reply, ChatError> {
        let kind = self.selected_or_err(user_id).await?;
        if !kind.supports_vision() {
            return Err(ChatError::vision_unsupported(kind));
        }
        self.check_usage(user_id, kind).await?;

        let text = self
            .llm
            .analyze_image(kind, image_bytes, prompt)
            .await
            .map_err(|source| ChatError::Llm {
                model: kind,
                source,
            })?;

        Ok(Reply {
            text,
            session_restarted: false,
        })
    }

    async fn drop_conversation(&self, conversation: Option<ConversationRef>) {
        if let Some(ConversationRef::Session { id }) = conversation {
            self.sessions.remove(&id).await;
        }
    }

    /// Forget the conversation with the selected model
    ///
    /// Returns the model that was reset, `None` if nothing is selected.
    pub async fn reset_conversation(&self, user_id: i64) -> Option<ModelKind> {
        let (kind, removed) = self
            .storage
            .modify_user_record(user_id, |record| {
                let kind = record.selected_model?;
                Some((kind, record.conversations.remove(&kind)))
            })
            .await?;

        self.drop_conversation(removed).await;
        info!(user_id = user_id, model = %kind, "Conversation reset");
        Some(kind)
    }

    /// Forget all conversations and the selection; usage counters stay.
    ///
    /// A user left with no usage to remember is dropped from storage.
    pub async fn clear_all(&self, user_id: i64) {
        let (removed, nothing_left) = self
            .storage
            .modify_user_record(user_id, |record| {
                record.selected_model = None;
                let removed = std::mem::take(&mut record.conversations);
                (removed, record.usage.is_empty())
            })
            .await;
        if nothing_left {
            self.storage.remove_user_record(user_id).await;
        }

        let count = removed.len();
        for conversation in removed.into_values() {
            self.drop_conversation(Some(conversation)).await;
        }
        info!(user_id = user_id, conversations = count, "User state cleared");
    }

    async fn session_len(&self, id: &Uuid) -> usize {
        match self.sessions.get(id).await {
            Some(session) => session.lock().await.transcript.len(),
            None => 0,
        }
    }

    /// Current state for `/status`
    pub async fn status(&self, user_id: i64) -> UserStatus {
        let record = self.storage.get_user_record(user_id).await;
        let now = Utc::now();

        let history_len = match record
            .selected_model
            .and_then(|kind| record.conversations.get(&kind))
        {
            Some(ConversationRef::Session { id }) => self.session_len(id).await,
            Some(ConversationRef::Messages { history }) => history.len(),
            None => 0,
        };

        let usage = ModelKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let policy = self.policies.get(&kind)?;
                let window = record.usage.get(&kind);
                Some(ModelUsage {
                    model: kind,
                    used: window.map_or(0, |w| policy.used(w, now)),
                    max_requests: policy.max_requests,
                    resets_in: window.and_then(|w| policy.resets_in(w, now)),
                })
            })
            .collect();

        UserStatus {
            selected: record.selected_model,
            history_len,
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HISTORY_MAX_MESSAGES;
    use crate::llm::{MockLlmProvider, Role};
    use anyhow::{bail, Result};
    use tempfile::TempDir;

    const USER: i64 = 1001;

    async fn manager_with(
        kind: ModelKind,
        provider: MockLlmProvider,
        policies: HashMap<ModelKind, UsagePolicy>,
    ) -> Result<(ConversationManager, Arc<JsonFileStorage>, TempDir)> {
        let dir = tempfile::tempdir()?;
        let storage = Arc::new(JsonFileStorage::open(dir.path().join("state.json")).await?);
        let mut llm = LlmClient::new(&Settings::with_token("test"));
        llm.register_provider(kind, Arc::new(provider));
        let manager = ConversationManager::new(storage.clone(), Arc::new(llm), policies);
        Ok((manager, storage, dir))
    }

    fn echo_provider() -> MockLlmProvider {
        let mut mock = MockLlmProvider::new();
        mock.expect_chat_completion()
            .returning(|_, history, user_message, _| {
                Ok(format!("{}:{user_message}", history.len()))
            });
        mock
    }

    #[tokio::test]
    async fn test_send_without_selection() -> Result<()> {
        let (manager, _, _dir) =
            manager_with(ModelKind::Claude, MockLlmProvider::new(), HashMap::new()).await?;
        let result = manager.send(USER, "hi").await;
        assert!(matches!(result, Err(ChatError::NoModelSelected)));
        Ok(())
    }

    #[tokio::test]
    async fn test_select_unconfigured_model() -> Result<()> {
        let (manager, _, _dir) =
            manager_with(ModelKind::Claude, MockLlmProvider::new(), HashMap::new()).await?;
        let result = manager.select_model(USER, ModelKind::Grok).await;
        assert!(matches!(
            result,
            Err(ChatError::ModelUnavailable(ModelKind::Grok))
        ));
        assert_eq!(manager.selected_model(USER).await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_stateless_history_grows_and_is_truncated() -> Result<()> {
        let (manager, storage, _dir) =
            manager_with(ModelKind::Claude, echo_provider(), HashMap::new()).await?;
        manager.select_model(USER, ModelKind::Claude).await?;

        assert_eq!(manager.send(USER, "one").await?.text, "0:one");
        assert_eq!(manager.send(USER, "two").await?.text, "2:two");

        for i in 0..15 {
            manager.send(USER, &format!("m{i}")).await?;
        }

        let record = storage.get_user_record(USER).await;
        let history = record.conversations[&ModelKind::Claude].messages();
        assert_eq!(history.len(), HISTORY_MAX_MESSAGES);
        assert_eq!(history[0].role, Role::User);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_call_leaves_history_untouched() -> Result<()> {
        let mut mock = MockLlmProvider::new();
        let mut calls = 0;
        mock.expect_chat_completion().returning(move |_, _, _, _| {
            calls += 1;
            if calls == 1 {
                Ok("fine".to_string())
            } else {
                Err(LlmError::ApiError("overloaded_error".to_string()))
            }
        });
        let (manager, storage, _dir) =
            manager_with(ModelKind::ChatGpt, mock, HashMap::new()).await?;
        manager.select_model(USER, ModelKind::ChatGpt).await?;

        manager.send(USER, "hello").await?;
        let Err(err) = manager.send(USER, "again").await else {
            bail!("second call should fail");
        };
        assert!(matches!(
            err,
            ChatError::Llm {
                model: ModelKind::ChatGpt,
                ..
            }
        ));
        assert!(err.user_message().contains("high demand"));

        let record = storage.get_user_record(USER).await;
        assert_eq!(
            record.conversations[&ModelKind::ChatGpt].messages().len(),
            2
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_session_mode_keeps_transcript_in_memory() -> Result<()> {
        let (manager, storage, _dir) =
            manager_with(ModelKind::Gemini, echo_provider(), HashMap::new()).await?;
        manager.select_model(USER, ModelKind::Gemini).await?;

        assert!(!manager.send(USER, "a").await?.session_restarted);
        assert_eq!(manager.send(USER, "b").await?.text, "2:b");

        let record = storage.get_user_record(USER).await;
        assert!(matches!(
            record.conversations.get(&ModelKind::Gemini),
            Some(ConversationRef::Session { .. })
        ));
        assert_eq!(manager.status(USER).await.history_len, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_session_is_restarted() -> Result<()> {
        let (manager, storage, _dir) =
            manager_with(ModelKind::Grok, echo_provider(), HashMap::new()).await?;
        manager.select_model(USER, ModelKind::Grok).await?;
        storage
            .modify_user_record(USER, |record| {
                record.conversations.insert(
                    ModelKind::Grok,
                    ConversationRef::Session { id: Uuid::new_v4() },
                );
            })
            .await;

        let reply = manager.send(USER, "hi").await?;
        assert!(reply.session_restarted);
        assert_eq!(reply.text, "0:hi");
        assert!(!manager.send(USER, "again").await?.session_restarted);
        Ok(())
    }

    #[tokio::test]
    async fn test_rate_limit_counts_dispatched_requests() -> Result<()> {
        let mut mock = MockLlmProvider::new();
        mock.expect_chat_completion()
            .times(2)
            .returning(|_, _, _, _| Err(LlmError::NetworkError("down".to_string())));
        let policies = HashMap::from([(
            ModelKind::Claude,
            UsagePolicy::new(2, Duration::from_secs(3600)),
        )]);
        let (manager, _, _dir) = manager_with(ModelKind::Claude, mock, policies).await?;
        manager.select_model(USER, ModelKind::Claude).await?;

        assert!(manager.send(USER, "1").await.is_err());
        assert!(manager.send(USER, "2").await.is_err());
        let Err(ChatError::RateLimited {
            max_requests,
            retry_after,
            ..
        }) = manager.send(USER, "3").await
        else {
            bail!("third call should hit the usage limit");
        };
        assert_eq!(max_requests, 2);
        assert!(retry_after <= Duration::from_secs(3600));

        let status = manager.status(USER).await;
        assert_eq!(status.usage.len(), 1);
        assert_eq!(status.usage[0].used, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_clear_all_keeps_usage() -> Result<()> {
        let policies = HashMap::from([(
            ModelKind::Claude,
            UsagePolicy::new(5, Duration::from_secs(3600)),
        )]);
        let (manager, storage, _dir) =
            manager_with(ModelKind::Claude, echo_provider(), policies).await?;
        manager.select_model(USER, ModelKind::Claude).await?;
        manager.send(USER, "hi").await?;

        manager.clear_all(USER).await;

        let record = storage.get_user_record(USER).await;
        assert_eq!(record.selected_model, None);
        assert!(record.conversations.is_empty());
        assert_eq!(record.usage[&ModelKind::Claude].count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_clear_all_drops_user_without_usage() -> Result<()> {
        let (manager, storage, _dir) =
            manager_with(ModelKind::Gemini, echo_provider(), HashMap::new()).await?;
        manager.select_model(USER, ModelKind::Gemini).await?;
        manager.send(USER, "hi").await?;
        assert_eq!(storage.user_count().await, 1);

        manager.clear_all(USER).await;

        assert_eq!(storage.user_count().await, 0);
        assert_eq!(manager.selected_model(USER).await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_conversation() -> Result<()> {
        let (manager, storage, _dir) =
            manager_with(ModelKind::Gemini, echo_provider(), HashMap::new()).await?;
        assert_eq!(manager.reset_conversation(USER).await, None);

        manager.select_model(USER, ModelKind::Gemini).await?;
        manager.send(USER, "hi").await?;
        assert_eq!(
            manager.reset_conversation(USER).await,
            Some(ModelKind::Gemini)
        );

        let record = storage.get_user_record(USER).await;
        assert!(record.conversations.is_empty());
        assert_eq!(record.selected_model, Some(ModelKind::Gemini));
        assert_eq!(manager.send(USER, "fresh").await?.text, "0:fresh");
        Ok(())
    }

    #[tokio::test]
    async fn test_analyze_image_is_one_shot() -> Result<()> {
        let mut mock = MockLlmProvider::new();
        mock.expect_analyze_image()
            .withf(|_, prompt, _, _| prompt == "what is it?")
            .times(1)
            .returning(|bytes, _, _, _| Ok(format!("{} bytes", bytes.len())));
        let (manager, storage, _dir) =
            manager_with(ModelKind::ChatGpt, mock, HashMap::new()).await?;
        manager.select_model(USER, ModelKind::ChatGpt).await?;

        let reply = manager
            .analyze_image(USER, vec![0xFF, 0xD8, 0xFF], "what is it?")
            .await?;
        assert_eq!(reply.text, "3 bytes");
        assert!(storage.get_user_record(USER).await.conversations.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_image_for_text_only_model_is_not_charged() -> Result<()> {
        let policies = HashMap::from([(
            ModelKind::DeepSeek,
            UsagePolicy::new(1, Duration::from_secs(3600)),
        )]);
        let (manager, _, _dir) =
            manager_with(ModelKind::DeepSeek, echo_provider(), policies).await?;
        manager.select_model(USER, ModelKind::DeepSeek).await?;

        let Err(err) = manager.analyze_image(USER, vec![1, 2, 3], "what?").await else {
            bail!("DeepSeek should refuse images");
        };
        assert!(matches!(
            err,
            ChatError::Llm {
                model: ModelKind::DeepSeek,
                source: LlmError::Unsupported(_)
            }
        ));
        assert_eq!(manager.status(USER).await.usage[0].used, 0);

        // The single allowed request is still available for text
        assert_eq!(manager.send(USER, "hello").await?.text, "0:hello");
        assert!(matches!(
            manager.send(USER, "again").await,
            Err(ChatError::RateLimited { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "1s");
        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
        assert_eq!(format_duration(Duration::from_secs(61)), "2 min");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1 h");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1 h 30 min");
    }
}
