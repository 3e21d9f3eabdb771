//! Telegram bot that relays chats to Gemini, ChatGPT, Claude, Grok and DeepSeek.
//!
//! Each user picks a model from an inline keyboard; the bot keeps their
//! conversation per model, persists it across restarts and enforces
//! per-model usage limits.

#![deny(missing_docs)]

/// Telegram handlers and UI
pub mod bot;
/// Settings and model constants
pub mod config;
/// Per-user conversation state
pub mod conversation;
/// LLM providers and client
pub mod llm;
/// Persistent user state
pub mod storage;
/// Text formatting and retry helpers
pub mod utils;
