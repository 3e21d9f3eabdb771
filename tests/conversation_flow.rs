//! End-to-end conversation flow with scripted providers, including a
//! simulated restart from the on-disk snapshot.

use ai_models_bot::config::{ModelInfo, ModelKind, Settings};
use ai_models_bot::conversation::{ChatError, ConversationManager, UsagePolicy};
use ai_models_bot::llm::{LlmClient, LlmError, LlmProvider, Message};
use ai_models_bot::storage::JsonFileStorage;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const ALICE: i64 = 11;
const BOB: i64 = 22;

/// Replies with the number of history messages it was given and records
/// every request. Messages starting with "slow" wait for `release`.
#[derive(Default)]
struct ScriptedProvider {
    seen: Mutex<Vec<(usize, String)>>,
    entered: Notify,
    release: Notify,
}

impl ScriptedProvider {
    fn requests(&self) -> Vec<(usize, String)> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat_completion(
        &self,
        _system_prompt: &str,
        history: &[Message],
        user_message: &str,
        _model: &ModelInfo,
    ) -> Result<String, LlmError> {
        if user_message == "fail" {
            return Err(LlmError::NetworkError("connection reset".to_string()));
        }
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((history.len(), user_message.to_string()));
        }
        if user_message.starts_with("slow") {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(format!("reply #{} to {user_message}", history.len() / 2 + 1))
    }

    async fn analyze_image(
        &self,
        image_bytes: Vec<u8>,
        text_prompt: &str,
        _system_prompt: &str,
        _model: &ModelInfo,
    ) -> Result<String, LlmError> {
        Ok(format!("{text_prompt}: {} bytes", image_bytes.len()))
    }
}

struct Harness {
    manager: Arc<ConversationManager>,
    storage: Arc<JsonFileStorage>,
    claude: Arc<ScriptedProvider>,
    gemini: Arc<ScriptedProvider>,
}

async fn boot(state_file: &Path) -> Result<Harness> {
    let storage = Arc::new(JsonFileStorage::open(state_file).await?);
    let claude = Arc::new(ScriptedProvider::default());
    let gemini = Arc::new(ScriptedProvider::default());
    let deepseek = Arc::new(ScriptedProvider::default());

    let mut llm = LlmClient::new(&Settings::with_token("test"));
    llm.register_provider(ModelKind::Claude, claude.clone());
    llm.register_provider(ModelKind::Gemini, gemini.clone());
    llm.register_provider(ModelKind::DeepSeek, deepseek);

    let policies = HashMap::from([
        (
            ModelKind::Claude,
            UsagePolicy::new(5, Duration::from_secs(3600)),
        ),
        (
            ModelKind::DeepSeek,
            UsagePolicy::new(1, Duration::from_secs(3600)),
        ),
    ]);
    let manager = Arc::new(ConversationManager::new(
        storage.clone(),
        Arc::new(llm),
        policies,
    ));

    Ok(Harness {
        manager,
        storage,
        claude,
        gemini,
    })
}

#[tokio::test]
async fn test_state_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let state_file = dir.path().join("user_state.json");

    {
        let app = boot(&state_file).await?;
        app.manager.select_model(ALICE, ModelKind::Claude).await?;
        app.manager.send(ALICE, "hello").await?;
        app.manager.send(ALICE, "how are you").await?;

        app.manager.select_model(BOB, ModelKind::Gemini).await?;
        app.manager.send(BOB, "hi gemini").await?;

        assert!(app.storage.flush().await?);
    }

    let app = boot(&state_file).await?;

    // Stateless history was restored from disk
    assert_eq!(
        app.manager.selected_model(ALICE).await,
        Some(ModelKind::Claude)
    );
    let reply = app.manager.send(ALICE, "still there?").await?;
    assert_eq!(reply.text, "reply #3 to still there?");
    assert!(!reply.session_restarted);
    assert_eq!(app.claude.requests(), vec![(4, "still there?".to_string())]);

    // The Gemini session lived in memory only
    let reply = app.manager.send(BOB, "remember me?").await?;
    assert!(reply.session_restarted);
    assert_eq!(app.gemini.requests(), vec![(0, "remember me?".to_string())]);

    // Usage counted before the restart is still there
    let status = app.manager.status(ALICE).await;
    assert_eq!(status.usage[0].used, 3);
    assert_eq!(status.history_len, 6);
    Ok(())
}

#[tokio::test]
async fn test_usage_limit_and_clear() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = boot(&dir.path().join("state.json")).await?;
    app.manager.select_model(ALICE, ModelKind::Claude).await?;

    for i in 0..4 {
        app.manager.send(ALICE, &format!("q{i}")).await?;
    }
    assert!(app.manager.send(ALICE, "fail").await.is_err());

    let Err(ChatError::RateLimited { model, .. }) = app.manager.send(ALICE, "one more").await
    else {
        bail!("sixth request should be refused");
    };
    assert_eq!(model, ModelKind::Claude);

    // Clearing does not hand out a fresh allowance
    app.manager.clear_all(ALICE).await;
    assert!(matches!(
        app.manager.send(ALICE, "after clear").await,
        Err(ChatError::NoModelSelected)
    ));
    app.manager.select_model(ALICE, ModelKind::Claude).await?;
    assert!(matches!(
        app.manager.send(ALICE, "after clear").await,
        Err(ChatError::RateLimited { .. })
    ));

    // Other users are unaffected
    app.manager.select_model(BOB, ModelKind::Claude).await?;
    assert_eq!(app.manager.send(BOB, "hi").await?.text, "reply #1 to hi");
    Ok(())
}

#[tokio::test]
async fn test_failed_request_keeps_history() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = boot(&dir.path().join("state.json")).await?;
    app.manager.select_model(ALICE, ModelKind::Claude).await?;

    app.manager.send(ALICE, "first").await?;
    let Err(err) = app.manager.send(ALICE, "fail").await else {
        bail!("scripted failure expected");
    };
    assert_eq!(
        err.user_message(),
        "An error occurred while talking to Claude. Please try again later."
    );

    app.manager.send(ALICE, "second").await?;
    assert_eq!(
        app.claude.requests(),
        vec![(0, "first".to_string()), (2, "second".to_string())]
    );
    Ok(())
}

#[tokio::test]
async fn test_photo_does_not_touch_history() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = boot(&dir.path().join("state.json")).await?;
    app.manager.select_model(ALICE, ModelKind::Gemini).await?;

    app.manager.send(ALICE, "text first").await?;
    let reply = app
        .manager
        .analyze_image(ALICE, vec![1, 2, 3, 4], "What is this?")
        .await?;
    assert_eq!(reply.text, "What is this?: 4 bytes");

    assert_eq!(app.manager.status(ALICE).await.history_len, 2);
    Ok(())
}

#[tokio::test]
async fn test_turns_finishing_out_of_order_are_all_kept() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = boot(&dir.path().join("state.json")).await?;
    app.manager.select_model(ALICE, ModelKind::Claude).await?;

    let manager = app.manager.clone();
    let pending = tokio::spawn(async move { manager.send(ALICE, "slow question").await });
    app.claude.entered.notified().await;

    // A second chat of the same user answers first
    app.manager.send(ALICE, "quick question").await?;
    app.claude.release.notify_one();
    pending.await??;

    let status = app.manager.status(ALICE).await;
    assert_eq!(status.history_len, 4);
    Ok(())
}

#[tokio::test]
async fn test_reset_during_pending_reply_sticks() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = boot(&dir.path().join("state.json")).await?;
    app.manager.select_model(ALICE, ModelKind::Claude).await?;
    app.manager.send(ALICE, "one").await?;
    app.manager.send(ALICE, "two").await?;

    let manager = app.manager.clone();
    let pending = tokio::spawn(async move { manager.send(ALICE, "slow three").await });
    app.claude.entered.notified().await;

    assert_eq!(
        app.manager.reset_conversation(ALICE).await,
        Some(ModelKind::Claude)
    );
    app.claude.release.notify_one();
    pending.await??;

    // Only the turn that was in flight survives the reset
    assert_eq!(app.manager.status(ALICE).await.history_len, 2);
    app.manager.send(ALICE, "four").await?;
    assert_eq!(
        app.claude.requests().last(),
        Some(&(2, "four".to_string()))
    );
    Ok(())
}

#[tokio::test]
async fn test_refused_image_keeps_allowance() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = boot(&dir.path().join("state.json")).await?;
    app.manager.select_model(BOB, ModelKind::DeepSeek).await?;

    let Err(err) = app.manager.analyze_image(BOB, vec![7; 16], "What is this?").await else {
        bail!("DeepSeek should refuse images");
    };
    assert_eq!(
        err.user_message(),
        "❌ DeepSeek can't handle this kind of message."
    );

    assert_eq!(app.manager.send(BOB, "hello").await?.text, "reply #1 to hello");
    assert!(matches!(
        app.manager.send(BOB, "again").await,
        Err(ChatError::RateLimited { .. })
    ));
    Ok(())
}
