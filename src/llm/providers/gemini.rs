use crate::config::ModelInfo;
use crate::llm::http_utils::{create_http_client, extract_text_content, send_json_request};
use crate::llm::{LlmError, LlmProvider, Message, Role};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const TEXT_PATH: &[&str] = &["candidates", "0", "content", "parts", "0", "text"];

/// LLM provider implementation for Google Gemini
pub struct GeminiProvider {
    http_client: HttpClient,
    api_key: String,
}

impl GeminiProvider {
    /// Create a new Gemini provider instance
    #[must_use]
    pub fn new(api_key: String) -> Self {
        Self {
            http_client: create_http_client(),
            api_key,
        }
    }

    fn endpoint(model_id: &str) -> String {
        format!("{GEMINI_API_BASE}/{model_id}:generateContent")
    }

    async fn generate(&self, model_id: &str, body: &Value) -> Result<String, LlmError> {
        let headers = [("x-goog-api-key", self.api_key.as_str())];
        let res_json = send_json_request(
            &self.http_client,
            &Self::endpoint(model_id),
            body,
            None,
            &headers,
        )
        .await?;
        extract_text_content(&res_json, TEXT_PATH)
    }
}

/// Gemini calls the assistant role `model`
fn gemini_contents(history: &[Message], user_message: &str) -> Vec<Value> {
    history
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            json!({"role": role, "parts": [{"text": msg.content}]})
        })
        .chain(std::iter::once(
            json!({"role": "user", "parts": [{"text": user_message}]}),
        ))
        .collect()
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn chat_completion(
        &self,
        system_prompt: &str,
        history: &[Message],
        user_message: &str,
        model: &ModelInfo,
    ) -> Result<String, LlmError> {
        let body = json!({
            "contents": gemini_contents(history, user_message),
            "system_instruction": {
                "parts": [{"text": system_prompt}]
            },
            "generationConfig": {
                "temperature": model.temperature,
                "maxOutputTokens": model.max_tokens
            }
        });

        self.generate(&model.id, &body).await
    }

    async fn analyze_image(
        &self,
        image_bytes: Vec<u8>,
        text_prompt: &str,
        system_prompt: &str,
        model: &ModelInfo,
    ) -> Result<String, LlmError> {
        let body = json!({
            "contents": [{
                "parts": [
                    {
                        "inline_data": {
                            "mime_type": crate::llm::common::sniff_image_mime(&image_bytes),
                            "data": BASE64.encode(&image_bytes)
                        }
                    },
                    {"text": text_prompt}
                ]
            }],
            "system_instruction": {
                "parts": [{"text": system_prompt}]
            },
            "generationConfig": {
                "temperature": model.temperature,
                "maxOutputTokens": model.max_tokens
            }
        });

        self.generate(&model.id, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contents_use_model_role() {
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let contents = gemini_contents(&history, "again");
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["text"], "again");
    }
}
