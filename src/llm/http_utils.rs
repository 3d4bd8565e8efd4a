//! HTTP utilities for LLM providers
//!
//! Common request/response handling for JSON chat endpoints.

use crate::config::LLM_HTTP_TIMEOUT_SECS;
use crate::llm::LlmError;
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Creates an HTTP client configured with the standard LLM timeout.
///
/// This prevents infinite hangs when the API is slow or unresponsive.
#[must_use]
pub fn create_http_client() -> HttpClient {
    HttpClient::builder()
        .timeout(Duration::from_secs(LLM_HTTP_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// Sends an HTTP POST request with JSON body and returns parsed JSON response.
///
/// # Errors
///
/// Returns `LlmError::NetworkError` on connectivity issues, `LlmError::RateLimit`
/// on 429, `LlmError::ApiError` on other non-success status codes,
/// or `LlmError::JsonError` if parsing fails.
pub async fn send_json_request(
    client: &HttpClient,
    url: &str,
    body: &Value,
    auth_header: Option<&str>,
) -> Result<Value, LlmError> {
    let mut request = client.post(url).json(body);

    if let Some(auth) = auth_header {
        request = request.header("Authorization", auth);
    }

    let response = request
        .send()
        .await
        .map_err(|e| LlmError::NetworkError(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let wait_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let error_text = response.text().await.unwrap_or_default();
        return Err(classify_error(status, &error_text, wait_secs));
    }

    response
        .json()
        .await
        .map_err(|e| LlmError::JsonError(e.to_string()))
}

fn classify_error(status: StatusCode, error_text: &str, wait_secs: Option<u64>) -> LlmError {
    // Detect HTML error pages from Nginx/proxies
    let trimmed = error_text.trim_start();
    let is_html = trimmed.starts_with("<!DOCTYPE")
        || trimmed.starts_with("<html")
        || trimmed.starts_with("<HTML");

    let clean_message = if is_html {
        format!("API error: {status} (Server returned HTML error page)")
    } else {
        format!(
            "API error: {status} - {}",
            crate::utils::truncate_str(error_text, 500)
        )
    };

    if status == StatusCode::TOO_MANY_REQUESTS {
        LlmError::RateLimit {
            wait_secs,
            message: clean_message,
        }
    } else {
        LlmError::ApiError(clean_message)
    }
}
