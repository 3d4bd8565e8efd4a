//! LLM provider interface and message model
//!
//! Provides the message types exchanged with the model, the
//! [`ModelProvider`] seam and an OpenAI-compatible implementation.

mod http_utils;
/// OpenAI-compatible chat completions provider
pub mod openai;

use crate::config::IMAGE_DETAIL;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use openai::OpenAiProvider;

/// Errors that can occur during LLM operations
#[derive(Debug, Error)]
pub enum LlmError {
    /// Error returned by the provider's API
    #[error("API error: {0}")]
    ApiError(String),
    /// Error during network communication
    #[error("Network error: {0}")]
    NetworkError(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    JsonError(String),
    /// Rate limit exceeded (429), optionally with a wait time
    #[error("Rate limit exceeded: {message} (wait: {wait_secs:?}s)")]
    RateLimit {
        /// Retry-After duration in seconds, if provided by the server
        wait_secs: Option<u64>,
        /// Error message from the server
        message: String,
    },
    /// The call did not finish within the configured timeout
    #[error("Request timed out after {0}s")]
    Timeout(u64),
    /// The model returned neither text nor a function call
    #[error("Empty response")]
    EmptyResponse,
}

impl LlmError {
    /// Whether retrying the same request may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError(_) | Self::RateLimit { .. } | Self::Timeout(_) => true,
            Self::ApiError(msg) => matches!(api_status(msg), Some(429 | 500..=599)),
            Self::JsonError(_) | Self::EmptyResponse => false,
        }
    }
}

/// HTTP status at the head of an `API error: <status> ...` message
fn api_status(msg: &str) -> Option<u16> {
    msg.strip_prefix("API error: ")?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// Author of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions and user settings
    System,
    /// The human side of the conversation
    User,
    /// The model
    Assistant,
    /// Result of a local function call
    Function,
}

impl Role {
    /// Wire name of the role
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Function => "function",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One piece of message content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text
    Text {
        /// The text itself
        text: String,
    },
    /// Image referenced by URL
    ImageUrl {
        /// URL and detail level
        image_url: ImageUrl,
    },
}

/// Image reference inside a content part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// Publicly reachable image URL
    pub url: String,
    /// Resolution hint for the model
    pub detail: String,
}

/// Function call requested by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the registered function
    pub name: String,
    /// Arguments as a JSON object encoded in a string
    pub arguments: String,
}

/// A message in an LLM conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Ordered content parts
    pub content: Vec<ContentPart>,
    /// Function name (for function-role results)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Function call recorded on an assistant turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl Message {
    /// Build a message from text and any number of image URLs.
    ///
    /// Empty text and `None`/empty URLs are skipped, so history replay and
    /// fresh user turns produce the same shape.
    ///
    /// # Examples
    ///
    /// ```
    /// use gpt_bridge::llm::{Message, Role};
    ///
    /// let msg = Message::pack(Some("look"), &[None, Some("https://x/1.jpg")], Role::User);
    /// assert_eq!(msg.content.len(), 2);
    /// assert_eq!(msg.image_urls(), vec!["https://x/1.jpg"]);
    /// ```
    #[must_use]
    pub fn pack(text: Option<&str>, image_urls: &[Option<&str>], role: Role) -> Self {
        let mut content = Vec::with_capacity(1 + image_urls.len());
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            content.push(ContentPart::Text {
                text: text.to_string(),
            });
        }
        for url in image_urls.iter().flatten().filter(|u| !u.is_empty()) {
            content.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: (*url).to_string(),
                    detail: IMAGE_DETAIL.to_string(),
                },
            });
        }
        Self {
            role,
            content,
            name: None,
            function_call: None,
        }
    }

    /// Create a new system message
    #[must_use]
    pub fn system(text: &str) -> Self {
        Self::pack(Some(text), &[], Role::System)
    }

    /// Create a new user message
    #[must_use]
    pub fn user(text: &str) -> Self {
        Self::pack(Some(text), &[], Role::User)
    }

    /// Create a new assistant message
    #[must_use]
    pub fn assistant(text: &str) -> Self {
        Self::pack(Some(text), &[], Role::Assistant)
    }

    /// Assistant turn recording a function call it made
    #[must_use]
    pub fn assistant_function_call(call: FunctionCall) -> Self {
        Self {
            role: Role::Assistant,
            content: Vec::new(),
            name: None,
            function_call: Some(call),
        }
    }

    /// Function-role turn carrying a serialized result
    #[must_use]
    pub fn function_result(name: &str, content: &str) -> Self {
        Self {
            role: Role::Function,
            content: vec![ContentPart::Text {
                text: content.to_string(),
            }],
            name: Some(name.to_string()),
            function_call: None,
        }
    }

    /// Concatenated text parts, if any
    #[must_use]
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    /// URLs of attached images, in order
    #[must_use]
    pub fn image_urls(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ImageUrl { image_url } => Some(image_url.url.as_str()),
                ContentPart::Text { .. } => None,
            })
            .collect()
    }

    /// True when the message carries neither text nor images
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Function schema offered to the model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSchema {
    /// Name of the function
    pub name: String,
    /// Description of what the function does
    pub description: String,
    /// JSON schema for the parameters
    pub parameters: serde_json::Value,
}

/// Token usage statistics from API response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    /// Input tokens
    pub prompt_tokens: u32,
    /// Output tokens
    pub completion_tokens: u32,
    /// Total tokens used
    pub total_tokens: u32,
}

/// One chat completion request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// Model identifier
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Full context, system message first
    pub messages: Vec<Message>,
    /// Functions offered to the model.
    ///
    /// `None` means function calling is not offered at all; it is never
    /// replaced by an empty list on the wire.
    pub functions: Option<Vec<FunctionSchema>>,
}

/// Chat response that may carry a function call
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Text content of the response
    pub content: Option<String>,
    /// Function call requested by the model
    pub function_call: Option<FunctionCall>,
    /// Reason why the model stopped generating
    pub finish_reason: String,
    /// Token usage statistics (if provided by the API)
    pub usage: Option<TokenUsage>,
}

/// Interface for chat model providers
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    /// Perform one chat completion
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_skips_empty_parts() {
        let msg = Message::pack(Some(""), &[None, Some(""), Some("https://a/b.png")], Role::User);
        assert_eq!(msg.content.len(), 1);
        assert_eq!(msg.text(), None);
        assert_eq!(msg.image_urls(), vec!["https://a/b.png"]);
    }

    #[test]
    fn test_pack_text_only() {
        let msg = Message::pack(Some("hi"), &[], Role::Assistant);
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.text().as_deref(), Some("hi"));
        assert!(msg.image_urls().is_empty());
    }

    #[test]
    fn test_pack_nothing_is_empty() {
        let msg = Message::pack(None, &[None], Role::User);
        assert!(msg.is_empty());
    }

    #[test]
    fn test_content_part_wire_shape() -> Result<(), serde_json::Error> {
        let msg = Message::pack(Some("t"), &[Some("https://i")], Role::User);
        let value = serde_json::to_value(&msg.content)?;
        assert_eq!(
            value,
            serde_json::json!([
                {"type": "text", "text": "t"},
                {"type": "image_url", "image_url": {"url": "https://i", "detail": "low"}}
            ])
        );
        Ok(())
    }

    #[test]
    fn test_transient_errors() {
        assert!(LlmError::NetworkError("reset".into()).is_transient());
        assert!(LlmError::Timeout(5).is_transient());
        assert!(LlmError::ApiError("API error: 503 Service Unavailable".into()).is_transient());
        assert!(!LlmError::ApiError("API error: 401 Unauthorized".into()).is_transient());
        assert!(!LlmError::EmptyResponse.is_transient());
    }

    #[test]
    fn test_only_the_status_decides_transience() {
        let body_mentions_500 =
            "API error: 400 Bad Request - prompt is 6200 tokens, max 5000 tokens";
        assert!(!LlmError::ApiError(body_mentions_500.into()).is_transient());
        let not_found = "API error: 404 Not Found - model timeout";
        assert!(!LlmError::ApiError(not_found.into()).is_transient());
        let overloaded = "API error: 529 <unknown status code> - overloaded";
        assert!(LlmError::ApiError(overloaded.into()).is_transient());
        assert!(!LlmError::ApiError("All retry attempts exhausted".into()).is_transient());
    }
}
