//! Texts, keyboards and callback data for the chat UI

use crate::config::ModelKind;
use crate::conversation::{format_duration, UserStatus};
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

/// Prefix of model-selection callback data
pub const MODEL_CALLBACK_PREFIX: &str = "model:";

/// Placeholder shown while the model is thinking
pub const GENERATING: &str = "🤖 Generating response...";
/// Keyboard caption after /start
pub const PLEASE_CHOOSE: &str = "Please choose:";
/// Keyboard caption for /model and when nothing is selected
pub const CHOOSE_MODEL: &str = "Choose a model:";
/// Reply to /clear
pub const ALL_CLEAR: &str = "All clear!";
/// Reply to unsupported message types
pub const SEND_TEXT: &str = "Please send a text message.";
/// Reply to stale or malformed keyboard buttons
pub const INVALID_BUTTON: &str =
    "Sorry, I could not process this button click 😕 Please send /start to get a new keyboard.";
/// Prepended to a reply when the previous session had expired
pub const SESSION_RESTARTED: &str =
    "ℹ️ The previous conversation has expired, so this one starts fresh.";

/// Usage text for /help
pub const HELP: &str = "I relay your messages to the AI model of your choice.\n\n\
/start - choose a model and start over\n\
/model - switch to another model\n\
/reset - forget the conversation with the current model\n\
/clear - forget all conversations and the selected model\n\
/status - show the selected model and your usage\n\
/help - show this message\n\n\
Send a photo with an optional caption to ask about the image.";

/// Callback data for a model button
#[must_use]
pub fn model_callback(kind: ModelKind) -> String {
    format!("{MODEL_CALLBACK_PREFIX}{}", kind.slug())
}

/// Parse model-selection callback data
#[must_use]
pub fn parse_model_callback(data: &str) -> Option<ModelKind> {
    data.strip_prefix(MODEL_CALLBACK_PREFIX)
        .and_then(ModelKind::from_slug)
}

/// One button per model, in a single column
#[must_use]
pub fn model_keyboard() -> InlineKeyboardMarkup {
    let rows = ModelKind::ALL.into_iter().map(|kind| {
        vec![InlineKeyboardButton::callback(
            kind.display_name(),
            model_callback(kind),
        )]
    });
    InlineKeyboardMarkup::new(rows)
}

/// Greeting for /start; `mention` is already HTML
#[must_use]
pub fn greeting(mention: &str) -> String {
    format!("Hi {mention}! I can forward your questions to several AI models.")
}

/// Confirmation after a model was picked
#[must_use]
pub fn model_selected(kind: ModelKind) -> String {
    format!(
        "✅ Model selected: {kind}\n\nYou can now send me your questions, and I will forward them to {kind}."
    )
}

/// Reply when the picked model has no API key
#[must_use]
pub fn model_unavailable(kind: ModelKind) -> String {
    format!("❌ {kind} is not available on this bot. Please choose another model.")
}

/// Reply to /reset
#[must_use]
pub fn conversation_reset(kind: Option<ModelKind>) -> String {
    kind.map_or_else(
        || "No model is selected, so there is nothing to reset.".to_string(),
        |kind| format!("🧹 Conversation with {kind} has been reset."),
    )
}

/// Reply to /status
#[must_use]
pub fn status(status: &UserStatus) -> String {
    let mut lines = vec![match status.selected {
        Some(kind) => format!("Model: {kind}"),
        None => "Model: none selected".to_string(),
    }];
    if status.selected.is_some() {
        lines.push(format!("Messages remembered: {}", status.history_len));
    }
    for usage in &status.usage {
        let resets = usage
            .resets_in
            .map(|d| format!(", resets in {}", format_duration(d)))
            .unwrap_or_default();
        lines.push(format!(
            "{}: {}/{} requests{resets}",
            usage.model, usage.used, usage.max_requests
        ));
    }
    lines.join("\n")
}
