//! HTTP utilities for LLM providers
//!
//! Common request/response handling for the providers that talk to
//! their APIs over plain JSON (Gemini, Claude, vision requests).

use crate::config::get_llm_http_timeout_secs;
use crate::llm::LlmError;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::Value;
use std::time::Duration;

const MAX_ERROR_BODY_CHARS: usize = 500;

/// Creates an HTTP client configured with the standard LLM timeout.
///
/// Uses `LLM_HTTP_TIMEOUT_SECS` environment variable or the default.
#[must_use]
pub fn create_http_client() -> HttpClient {
    let timeout = Duration::from_secs(get_llm_http_timeout_secs());
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// Sends an HTTP POST request with JSON body and returns parsed JSON response.
///
/// # Errors
///
/// Returns `LlmError::NetworkError` on connectivity issues, `LlmError::RateLimit` on 429,
/// `LlmError::ApiError` on other non-success status codes, or `LlmError::JsonError` if parsing fails.
pub async fn send_json_request(
    client: &HttpClient,
    url: &str,
    body: &Value,
    auth_header: Option<&str>,
    extra_headers: &[(&str, &str)],
) -> Result<Value, LlmError> {
    let mut request = client.post(url).json(body);

    if let Some(auth) = auth_header {
        request = request.header("Authorization", auth);
    }

    for (key, value) in extra_headers {
        request = request.header(*key, *value);
    }

    let response = request
        .send()
        .await
        .map_err(|e| LlmError::NetworkError(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| LlmError::JsonError(e.to_string()));
    }

    let wait_secs = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let error_text = response.text().await.unwrap_or_default();

    Err(status_error(status, &error_text, wait_secs))
}

/// Map a non-success status and its body to an `LlmError`
fn status_error(status: StatusCode, error_text: &str, wait_secs: Option<u64>) -> LlmError {
    let trimmed = error_text.trim_start();
    let is_html = trimmed.starts_with("<!DOCTYPE")
        || trimmed.starts_with("<html")
        || trimmed.starts_with("<HTML");

    let message = if is_html {
        format!("{status} (Server returned HTML error page)")
    } else if error_text.chars().count() > MAX_ERROR_BODY_CHARS {
        format!(
            "{status} - {}... (truncated)",
            crate::utils::truncate_str(error_text, MAX_ERROR_BODY_CHARS)
        )
    } else {
        format!("{status} - {error_text}")
    };

    if status == StatusCode::TOO_MANY_REQUESTS {
        // Quota exhaustion also comes back as 429 but is not worth retrying
        let lower = error_text.to_lowercase();
        if lower.contains("quota") || lower.contains("insufficient") {
            return LlmError::ApiError(message);
        }
        return LlmError::RateLimit { wait_secs, message };
    }

    LlmError::ApiError(message)
}

/// Extracts text content from a JSON response by navigating a path.
///
/// # Example
/// ```ignore
/// // Gemini: ["candidates", "0", "content", "parts", "0", "text"]
/// // Claude: ["content", "0", "text"]
/// let content = extract_text_content(&response, &["content", "0", "text"])?;
/// ```
///
/// # Errors
///
/// Returns `LlmError::ApiError` if the path is invalid or the target is not a string.
pub fn extract_text_content(response: &Value, path: &[&str]) -> Result<String, LlmError> {
    let mut current = response;

    for segment in path {
        current = if let Ok(index) = segment.parse::<usize>() {
            current.get(index).ok_or_else(|| {
                LlmError::ApiError(format!("Invalid path: missing index {index}"))
            })?
        } else {
            current.get(*segment).ok_or_else(|| {
                LlmError::ApiError(format!("Invalid path: missing key {segment}"))
            })?
        };
    }

    current
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| LlmError::ApiError(format!("Expected string at path, got: {current:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_text_content() {
        let body = json!({"content": [{"type": "text", "text": "hello"}]});
        let text = extract_text_content(&body, &["content", "0", "text"]);
        assert_eq!(text.ok().as_deref(), Some("hello"));

        let missing = extract_text_content(&body, &["content", "1", "text"]);
        assert!(matches!(missing, Err(LlmError::ApiError(_))));
    }

    #[test]
    fn test_status_error_rate_limit() {
        let err = status_error(StatusCode::TOO_MANY_REQUESTS, "slow down", Some(7));
        assert!(matches!(
            err,
            LlmError::RateLimit {
                wait_secs: Some(7),
                ..
            }
        ));

        let quota = status_error(
            StatusCode::TOO_MANY_REQUESTS,
            "{\"error\":{\"code\":\"insufficient_quota\"}}",
            None,
        );
        assert!(matches!(quota, LlmError::ApiError(_)));
    }

    #[test]
    fn test_status_error_hides_html_and_truncates() {
        let html = status_error(StatusCode::BAD_GATEWAY, "<html><body>nginx</body></html>", None);
        assert!(html.to_string().contains("HTML error page"));
        assert!(!html.to_string().contains("nginx"));

        let long = "x".repeat(2000);
        let err = status_error(StatusCode::BAD_REQUEST, &long, None);
        assert!(err.to_string().contains("(truncated)"));
        assert!(err.to_string().len() < 700);
    }
}
