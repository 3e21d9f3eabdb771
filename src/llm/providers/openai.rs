use crate::config::ModelInfo;
use crate::llm::openai_compat::OpenAiCompatClient;
use crate::llm::{LlmError, LlmProvider, Message};
use async_trait::async_trait;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// LLM provider implementation for `OpenAI` ChatGPT
pub struct OpenAiProvider {
    client: OpenAiCompatClient,
}

impl OpenAiProvider {
    /// Create a new provider instance
    #[must_use]
    pub fn new(api_key: String) -> Self {
        Self {
            client: OpenAiCompatClient::new(api_key, OPENAI_API_BASE),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat_completion(
        &self,
        system_prompt: &str,
        history: &[Message],
        user_message: &str,
        model: &ModelInfo,
    ) -> Result<String, LlmError> {
        self.client
            .chat_completion(system_prompt, history, user_message, model)
            .await
    }

    async fn analyze_image(
        &self,
        image_bytes: Vec<u8>,
        text_prompt: &str,
        system_prompt: &str,
        model: &ModelInfo,
    ) -> Result<String, LlmError> {
        self.client
            .analyze_image(&image_bytes, text_prompt, system_prompt, model)
            .await
    }
}
