//! Telegram command, message and callback handlers

use super::messaging::{deliver_reply, send_reply};
use super::resilient::{download_file_resilient, edit_message_resilient, send_message_resilient};
use super::views;
use crate::config::DEFAULT_IMAGE_PROMPT;
use crate::conversation::{ChatError, ConversationManager, Reply};
use anyhow::Result;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, ChatId, ParseMode};
use teloxide::utils::command::BotCommands;
use teloxide::utils::html;
use tracing::{debug, error, info, warn};

/// Supported bot commands
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    /// Start over and pick a model
    #[command(description = "choose a model and start over.")]
    Start,
    /// Show usage
    #[command(description = "show this text.")]
    Help,
    /// Show the model keyboard
    #[command(description = "switch to another model.")]
    Model,
    /// Forget everything
    #[command(description = "forget all conversations and the selected model.")]
    Clear,
    /// Forget the current conversation
    #[command(description = "forget the conversation with the current model.")]
    Reset,
    /// Show selection and usage
    #[command(description = "show the selected model and your usage.")]
    Status,
}

/// Get user ID from message safely
#[must_use]
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

fn get_user_name(msg: &Message) -> String {
    msg.from
        .as_ref()
        .map_or_else(|| "Unknown".to_string(), |u| u.first_name.clone())
}

/// Handler for /start
///
/// # Errors
///
/// Returns an error if the greeting cannot be sent.
pub async fn start(bot: Bot, msg: Message, manager: Arc<ConversationManager>) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    info!(user_id = user_id, user_name = %get_user_name(&msg), "User started the bot");

    manager.clear_selection(user_id).await;

    let mention = msg.from.as_ref().map_or_else(
        || "there".to_string(),
        |user| html::user_mention(user.id, &html::escape(&user.full_name())),
    );
    send_message_resilient(
        &bot,
        msg.chat.id,
        views::greeting(&mention),
        Some(ParseMode::Html),
        None,
    )
    .await?;
    show_model_keyboard(&bot, msg.chat.id, views::PLEASE_CHOOSE).await
}

/// Handler for /help
///
/// # Errors
///
/// Returns an error if the message cannot be sent.
pub async fn help(bot: Bot, msg: Message) -> Result<()> {
    send_message_resilient(&bot, msg.chat.id, views::HELP, None, None).await?;
    Ok(())
}

/// Handler for /model
///
/// # Errors
///
/// Returns an error if the keyboard cannot be sent.
pub async fn choose_model(bot: Bot, msg: Message) -> Result<()> {
    show_model_keyboard(&bot, msg.chat.id, views::CHOOSE_MODEL).await
}

/// Handler for /clear
///
/// # Errors
///
/// Returns an error if the confirmation cannot be sent.
pub async fn clear(bot: Bot, msg: Message, manager: Arc<ConversationManager>) -> Result<()> {
    manager.clear_all(get_user_id_safe(&msg)).await;
    send_message_resilient(&bot, msg.chat.id, views::ALL_CLEAR, None, None).await?;
    Ok(())
}

/// Handler for /reset
///
/// # Errors
///
/// Returns an error if the confirmation cannot be sent.
pub async fn reset(bot: Bot, msg: Message, manager: Arc<ConversationManager>) -> Result<()> {
    let reset = manager.reset_conversation(get_user_id_safe(&msg)).await;
    send_message_resilient(
        &bot,
        msg.chat.id,
        views::conversation_reset(reset),
        None,
        None,
    )
    .await?;
    Ok(())
}

/// Handler for /status
///
/// # Errors
///
/// Returns an error if the status cannot be sent.
pub async fn status(bot: Bot, msg: Message, manager: Arc<ConversationManager>) -> Result<()> {
    let status = manager.status(get_user_id_safe(&msg)).await;
    send_message_resilient(&bot, msg.chat.id, views::status(&status), None, None).await?;
    Ok(())
}

async fn show_model_keyboard(bot: &Bot, chat_id: ChatId, caption: &str) -> Result<()> {
    send_message_resilient(bot, chat_id, caption, None, Some(views::model_keyboard())).await?;
    Ok(())
}

/// Handler for plain text messages
///
/// # Errors
///
/// Returns an error if Telegram calls fail. Model errors are reported to the user.
pub async fn handle_text(bot: Bot, msg: Message, manager: Arc<ConversationManager>) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    let Some(text) = msg.text() else {
        return Ok(());
    };

    if manager.selected_model(user_id).await.is_none() {
        return ask_for_model(&bot, msg.chat.id).await;
    }

    info!(user_id = user_id, text_len = text.len(), "Routing text message");
    let placeholder =
        send_message_resilient(&bot, msg.chat.id, views::GENERATING, None, None).await?;

    let result = manager.send(user_id, text).await;
    finish_request(&bot, msg.chat.id, placeholder.id, user_id, result).await
}

/// Handler for photos; the caption, if any, is the prompt
///
/// # Errors
///
/// Returns an error if Telegram calls fail. Model errors are reported to the user.
pub async fn handle_photo(bot: Bot, msg: Message, manager: Arc<ConversationManager>) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    let Some(photo) = msg.photo().and_then(<[_]>::last) else {
        return Ok(());
    };

    let Some(kind) = manager.selected_model(user_id).await else {
        return ask_for_model(&bot, msg.chat.id).await;
    };
    if !kind.supports_vision() {
        let refusal = ChatError::vision_unsupported(kind).user_message();
        send_message_resilient(&bot, msg.chat.id, refusal, None, None).await?;
        return Ok(());
    }

    let placeholder =
        send_message_resilient(&bot, msg.chat.id, views::GENERATING, None, None).await?;

    let image = match download_file_resilient(&bot, &photo.file.id).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(user_id = user_id, error = %e, "Failed to download photo");
            edit_message_resilient(
                &bot,
                msg.chat.id,
                placeholder.id,
                "❌ Could not download the photo. Please try again.",
                None,
            )
            .await?;
            return Ok(());
        }
    };

    let prompt = msg.caption().unwrap_or(DEFAULT_IMAGE_PROMPT);
    info!(user_id = user_id, image_len = image.len(), "Routing photo");

    let result = manager.analyze_image(user_id, image, prompt).await;
    finish_request(&bot, msg.chat.id, placeholder.id, user_id, result).await
}

/// Handler for anything that is neither text nor a photo
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn handle_other(bot: Bot, msg: Message) -> Result<()> {
    send_message_resilient(&bot, msg.chat.id, views::SEND_TEXT, None, None).await?;
    Ok(())
}

async fn ask_for_model(bot: &Bot, chat_id: ChatId) -> Result<()> {
    send_message_resilient(
        bot,
        chat_id,
        ChatError::NoModelSelected.user_message(),
        None,
        None,
    )
    .await?;
    show_model_keyboard(bot, chat_id, views::CHOOSE_MODEL).await
}

async fn finish_request(
    bot: &Bot,
    chat_id: ChatId,
    placeholder: teloxide::types::MessageId,
    user_id: i64,
    result: Result<Reply, ChatError>,
) -> Result<()> {
    match result {
        Ok(reply) => {
            if reply.session_restarted {
                send_reply(bot, chat_id, views::SESSION_RESTARTED).await?;
            }
            deliver_reply(bot, chat_id, placeholder, &reply.text).await
        }
        Err(e) => {
            if matches!(e, ChatError::Llm { .. }) {
                error!(user_id = user_id, error = %e, "Model request failed");
            } else {
                warn!(user_id = user_id, error = %e, "Request refused");
            }
            edit_message_resilient(bot, chat_id, placeholder, e.user_message(), None).await?;
            Ok(())
        }
    }
}

/// Handler for inline keyboard clicks
///
/// # Errors
///
/// Returns an error if Telegram calls fail.
pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    manager: Arc<ConversationManager>,
) -> Result<()> {
    if let Err(e) = bot.answer_callback_query(q.id.clone()).await {
        debug!(error = %e, "Failed to answer callback query");
    }

    let Some(message) = q.message.as_ref() else {
        return Ok(());
    };
    let (chat_id, msg_id) = (message.chat().id, message.id());
    let user_id = q.from.id.0.cast_signed();

    let Some(kind) = q.data.as_deref().and_then(views::parse_model_callback) else {
        warn!(user_id = user_id, data = ?q.data, "Unrecognised callback data");
        edit_message_resilient(&bot, chat_id, msg_id, views::INVALID_BUTTON, None).await?;
        return Ok(());
    };

    let text = match manager.select_model(user_id, kind).await {
        Ok(()) => views::model_selected(kind),
        Err(ChatError::ModelUnavailable(kind)) => views::model_unavailable(kind),
        Err(e) => e.user_message(),
    };
    edit_message_resilient(&bot, chat_id, msg_id, text, None).await?;
    Ok(())
}

/// Log updates from users outside the allowlist and drop them
pub fn log_unauthorized(user_id: i64, user_name: &str) {
    info!(user_id = user_id, user_name = user_name, "⛔️ Ignoring update from unauthorized user");
}
