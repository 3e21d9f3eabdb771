//! Delivering model replies to Telegram.
//!
//! Replies are split on the raw markdown first (so code fences can be closed
//! and reopened) and each part is formatted to HTML afterwards. A part that
//! Telegram refuses as HTML is resent as plain text.

use super::resilient::{edit_message_resilient, is_benign_edit_error, send_message_resilient};
use crate::utils;
use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId, ParseMode};
use tracing::{debug, warn};

/// Telegram's hard limit on message length, in characters
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Raw part size before formatting; leaves room for HTML markup
pub const RAW_PART_LIMIT: usize = 3500;

/// A reply part ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPart {
    /// Formatted HTML
    pub html: String,
    /// Plain-text fallback
    pub plain: String,
}

/// Split and format a reply.
#[must_use]
pub fn prepare_reply(text: &str) -> Vec<ReplyPart> {
    utils::split_long_message(text, RAW_PART_LIMIT)
        .into_iter()
        .map(|part| {
            let html = utils::format_text(&part);
            let plain = utils::truncate_str(&part, TELEGRAM_MESSAGE_LIMIT);
            ReplyPart { html, plain }
        })
        .filter(|part| !part.html.is_empty())
        .collect()
}

/// Show a reply by editing the placeholder message, sending any further
/// parts as new messages.
///
/// If the placeholder cannot be edited, the first part is sent as a new
/// message instead.
///
/// # Errors
///
/// Returns an error if a part can be delivered neither as HTML nor as plain text.
pub async fn deliver_reply(
    bot: &Bot,
    chat_id: ChatId,
    placeholder: MessageId,
    text: &str,
) -> Result<()> {
    let mut parts = prepare_reply(text).into_iter();

    let Some(first) = parts.next() else {
        edit_message_resilient(bot, chat_id, placeholder, "🤷 (empty response)", None).await?;
        return Ok(());
    };

    if !edit_part(bot, chat_id, placeholder, &first).await {
        send_part(bot, chat_id, &first).await?;
    }

    for part in parts {
        send_part(bot, chat_id, &part).await?;
    }

    Ok(())
}

/// Send a reply as new messages.
///
/// # Errors
///
/// Returns an error if a part can be delivered neither as HTML nor as plain text.
pub async fn send_reply(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    for part in prepare_reply(text) {
        send_part(bot, chat_id, &part).await?;
    }
    Ok(())
}

async fn edit_part(bot: &Bot, chat_id: ChatId, msg_id: MessageId, part: &ReplyPart) -> bool {
    match edit_message_resilient(bot, chat_id, msg_id, &part.html, Some(ParseMode::Html)).await {
        Ok(_) => return true,
        Err(e) if is_benign_edit_error(&e) => {
            debug!(error = %e, "Placeholder edit skipped");
            return false;
        }
        Err(e) => warn!(error = %e, "HTML edit rejected, retrying as plain text"),
    }

    match edit_message_resilient(bot, chat_id, msg_id, &part.plain, None).await {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "Plain-text edit failed");
            false
        }
    }
}

async fn send_part(bot: &Bot, chat_id: ChatId, part: &ReplyPart) -> Result<()> {
    if let Err(e) =
        send_message_resilient(bot, chat_id, &part.html, Some(ParseMode::Html), None).await
    {
        warn!(error = %e, "HTML message rejected, retrying as plain text");
        send_message_resilient(bot, chat_id, &part.plain, None, None).await?;
    }
    Ok(())
}
