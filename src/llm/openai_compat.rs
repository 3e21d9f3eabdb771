//! OpenAI-compatible provider utilities
//!
//! Shared implementation for the providers that speak the `OpenAI`
//! chat-completions dialect (ChatGPT, Grok, `DeepSeek`).

use super::common::{build_openai_messages, extract_openai_response, openai_vision_body};
use super::http_utils::{create_http_client, extract_text_content, send_json_request};
use super::{LlmError, Message};
use crate::config::ModelInfo;
use async_openai::error::OpenAIError;
use async_openai::{config::OpenAIConfig, types::chat::CreateChatCompletionRequestArgs, Client};
use reqwest::Client as HttpClient;

/// Client pair for one OpenAI-compatible endpoint
pub struct OpenAiCompatClient {
    client: Client<OpenAIConfig>,
    http_client: HttpClient,
    api_key: String,
    api_base: String,
}

impl OpenAiCompatClient {
    /// Create a client for the given API base
    #[must_use]
    pub fn new(api_key: String, api_base: &str) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key.clone())
            .with_api_base(api_base);
        Self {
            client: Client::with_config(config),
            http_client: create_http_client(),
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Perform a chat completion
    ///
    /// # Errors
    ///
    /// Returns `LlmError` if the request cannot be built or the API call fails.
    pub async fn chat_completion(
        &self,
        system_prompt: &str,
        history: &[Message],
        user_message: &str,
        model: &ModelInfo,
    ) -> Result<String, LlmError> {
        let messages = build_openai_messages(system_prompt, history, user_message)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(model.id.as_str())
            .messages(messages)
            .max_tokens(model.max_tokens)
            .temperature(model.temperature)
            .build()
            .map_err(|e| LlmError::Unknown(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        extract_openai_response(&response)
    }

    /// Perform a vision request with an inline data-URL image
    ///
    /// # Errors
    ///
    /// Returns `LlmError` if the API call fails or the response has no text.
    pub async fn analyze_image(
        &self,
        image_bytes: &[u8],
        text_prompt: &str,
        system_prompt: &str,
        model: &ModelInfo,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = openai_vision_body(
            &model.id,
            system_prompt,
            text_prompt,
            image_bytes,
            model.max_tokens,
        );
        let auth = format!("Bearer {}", self.api_key);
        let res_json = send_json_request(&self.http_client, &url, &body, Some(&auth), &[]).await?;
        extract_text_content(&res_json, &["choices", "0", "message", "content"])
    }
}

fn map_openai_error(error: OpenAIError) -> LlmError {
    match error {
        OpenAIError::Reqwest(e) => LlmError::NetworkError(e.to_string()),
        other => {
            let message = other.to_string();
            if message.contains("rate_limit_exceeded") {
                LlmError::RateLimit {
                    wait_secs: None,
                    message,
                }
            } else {
                LlmError::ApiError(message)
            }
        }
    }
}
