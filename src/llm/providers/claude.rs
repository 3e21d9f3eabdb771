use crate::config::ModelInfo;
use crate::llm::common::sniff_image_mime;
use crate::llm::http_utils::{create_http_client, extract_text_content, send_json_request};
use crate::llm::{LlmError, LlmProvider, Message};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

const CLAUDE_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// LLM provider implementation for Anthropic Claude
pub struct ClaudeProvider {
    http_client: HttpClient,
    api_key: String,
}

impl ClaudeProvider {
    /// Create a new Claude provider instance
    #[must_use]
    pub fn new(api_key: String) -> Self {
        Self {
            http_client: create_http_client(),
            api_key,
        }
    }

    async fn send(&self, body: &Value) -> Result<String, LlmError> {
        let headers = [
            ("x-api-key", self.api_key.as_str()),
            ("anthropic-version", ANTHROPIC_VERSION),
        ];
        let res_json =
            send_json_request(&self.http_client, CLAUDE_MESSAGES_URL, body, None, &headers)
                .await?;
        extract_text_content(&res_json, &["content", "0", "text"])
    }
}

/// Claude takes the system prompt separately; only user/assistant turns go here
fn claude_messages(history: &[Message], user_message: &str) -> Vec<Value> {
    history
        .iter()
        .map(|msg| json!({"role": msg.role.as_str(), "content": msg.content}))
        .chain(std::iter::once(
            json!({"role": "user", "content": user_message}),
        ))
        .collect()
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    async fn chat_completion(
        &self,
        system_prompt: &str,
        history: &[Message],
        user_message: &str,
        model: &ModelInfo,
    ) -> Result<String, LlmError> {
        let body = json!({
            "model": model.id,
            "max_tokens": model.max_tokens,
            "temperature": model.temperature,
            "system": system_prompt,
            "messages": claude_messages(history, user_message)
        });

        self.send(&body).await
    }

    async fn analyze_image(
        &self,
        image_bytes: Vec<u8>,
        text_prompt: &str,
        system_prompt: &str,
        model: &ModelInfo,
    ) -> Result<String, LlmError> {
        let body = json!({
            "model": model.id,
            "max_tokens": model.max_tokens,
            "system": system_prompt,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": sniff_image_mime(&image_bytes),
                            "data": BASE64.encode(&image_bytes)
                        }
                    },
                    {"type": "text", "text": text_prompt}
                ]
            }]
        });

        self.send(&body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_exclude_system_prompt() {
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let messages = claude_messages(&history, "again");
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m["role"] != "system"));
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[2]["content"], "again");
    }
}
