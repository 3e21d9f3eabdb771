//! Telegram calls with automatic retry on transient failures.
//!
//! Every call goes through [`crate::utils::retry_telegram_operation`], which
//! backs off exponentially with jitter.

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardMarkup, Message, MessageId, ParseMode};
use tracing::debug;

/// Send a message, retrying on failure.
///
/// # Errors
///
/// Returns the last Telegram error once all retries are exhausted.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    parse_mode: Option<ParseMode>,
    keyboard: Option<InlineKeyboardMarkup>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        let mut req = bot.send_message(chat_id, text.clone());
        if let Some(pm) = parse_mode {
            req = req.parse_mode(pm);
        }
        if let Some(markup) = keyboard.clone() {
            req = req.reply_markup(markup);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Replace a message's text, retrying on failure. The inline keyboard, if
/// any, is removed.
///
/// # Errors
///
/// Returns the last Telegram error once all retries are exhausted.
pub async fn edit_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: impl Into<String>,
    parse_mode: Option<ParseMode>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        let mut req = bot.edit_message_text(chat_id, msg_id, text.clone());
        if let Some(pm) = parse_mode {
            req = req.parse_mode(pm);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram edit error: {e}"))
    })
    .await
}

/// Download a Telegram file into memory, retrying on failure.
///
/// # Errors
///
/// Returns the last error once all retries are exhausted.
pub async fn download_file_resilient(bot: &Bot, file_id: &teloxide::types::FileId) -> Result<Vec<u8>> {
    use teloxide::net::Download;

    let bytes = crate::utils::retry_telegram_operation(|| async {
        let file = bot.get_file(file_id.clone()).await?;
        let mut buf = Vec::new();
        bot.download_file(&file.path, &mut buf).await?;
        Ok(buf)
    })
    .await?;

    debug!(size = bytes.len(), "Downloaded file from Telegram");
    Ok(bytes)
}

/// Whether an edit failed only because the target message is gone or unchanged
#[must_use]
pub fn is_benign_edit_error(error: &anyhow::Error) -> bool {
    const ERROR_NOT_MODIFIED: &str = "message is not modified";
    const ERROR_NOT_FOUND: &str = "message to edit not found";

    let message = error.to_string();
    message.contains(ERROR_NOT_MODIFIED) || message.contains(ERROR_NOT_FOUND)
}
