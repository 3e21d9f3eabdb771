use crate::config::ModelInfo;
use crate::llm::openai_compat::OpenAiCompatClient;
use crate::llm::{LlmError, LlmProvider, Message};
use async_trait::async_trait;

const DEEPSEEK_API_BASE: &str = "https://api.deepseek.com";

/// LLM provider implementation for `DeepSeek`
///
/// The `DeepSeek` chat API is text-only, so image requests are rejected.
pub struct DeepSeekProvider {
    client: OpenAiCompatClient,
}

impl DeepSeekProvider {
    /// Create a new provider instance
    #[must_use]
    pub fn new(api_key: String) -> Self {
        Self {
            client: OpenAiCompatClient::new(api_key, DEEPSEEK_API_BASE),
        }
    }
}

#[async_trait]
impl LlmProvider for DeepSeekProvider {
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
        _image_bytes: Vec<u8>,
        _text_prompt: &str,
        _system_prompt: &str,
        _model: &ModelInfo,
    ) -> Result<String, LlmError> {
        Err(LlmError::Unsupported(
            "Image analysis is not available for DeepSeek".to_string(),
        ))
    }
}
