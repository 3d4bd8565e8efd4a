use super::http_utils::{create_http_client, send_json_request};
use super::{
    ChatRequest, ChatResponse, ContentPart, FunctionCall, LlmError, Message, ModelProvider, Role,
    TokenUsage,
};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

/// LLM provider for OpenAI-compatible chat completion endpoints
pub struct OpenAiProvider {
    http_client: HttpClient,
    api_key: String,
    api_base: String,
}

impl OpenAiProvider {
    /// Create a new provider instance
    #[must_use]
    pub fn new(api_key: String, api_base: String) -> Self {
        Self {
            http_client: create_http_client(),
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = build_request_body(request);
        let auth = format!("Bearer {}", self.api_key);
        let res_json = send_json_request(&self.http_client, &url, &body, Some(&auth)).await?;
        parse_response(&res_json)
    }
}

/// Serialize a request into the chat completions wire format.
///
/// The `functions` and `function_call` keys are only present when the
/// request offers functions.
pub(crate) fn build_request_body(request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(message_to_json).collect();

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "temperature": request.temperature,
    });

    if let Some(functions) = &request.functions {
        body["functions"] = json!(functions);
        body["function_call"] = json!("auto");
    }

    body
}

fn message_to_json(msg: &Message) -> Value {
    match msg.role {
        Role::User => json!({
            "role": "user",
            "content": msg.content,
        }),
        Role::Assistant => {
            if let Some(call) = &msg.function_call {
                json!({
                    "role": "assistant",
                    "content": Value::Null,
                    "function_call": {
                        "name": call.name,
                        "arguments": call.arguments,
                    }
                })
            } else {
                json!({
                    "role": "assistant",
                    "content": msg.text().unwrap_or_default(),
                })
            }
        }
        Role::Function => json!({
            "role": "function",
            "name": msg.name,
            "content": msg.text().unwrap_or_default(),
        }),
        Role::System => json!({
            "role": "system",
            "content": system_content(msg),
        }),
    }
}

fn system_content(msg: &Message) -> Value {
    if msg
        .content
        .iter()
        .all(|part| matches!(part, ContentPart::Text { .. }))
    {
        json!(msg.text().unwrap_or_default())
    } else {
        json!(msg.content)
    }
}

/// Extract content, function call and usage from a completion response.
///
/// # Errors
///
/// Returns `LlmError::JsonError` if the function call is malformed and
/// `LlmError::EmptyResponse` if the first choice carries nothing usable.
pub(crate) fn parse_response(res_json: &Value) -> Result<ChatResponse, LlmError> {
    let choice = res_json
        .get("choices")
        .and_then(|choices| choices.get(0))
        .ok_or(LlmError::EmptyResponse)?;
    let message = choice.get("message").ok_or(LlmError::EmptyResponse)?;

    // blank content counts as no content
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
        .map(ToString::to_string);

    let function_call = match message.get("function_call") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            serde_json::from_value::<FunctionCall>(value.clone())
                .map_err(|e| LlmError::JsonError(format!("Invalid function_call: {e}")))?,
        ),
    };

    if content.is_none() && function_call.is_none() {
        return Err(LlmError::EmptyResponse);
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let usage = res_json.get("usage").and_then(|u| {
        Some(TokenUsage {
            prompt_tokens: u32::try_from(u.get("prompt_tokens")?.as_u64()?).ok()?,
            completion_tokens: u32::try_from(u.get("completion_tokens")?.as_u64()?).ok()?,
            total_tokens: u32::try_from(u.get("total_tokens")?.as_u64()?).ok()?,
        })
    });

    Ok(ChatResponse {
        content,
        function_call,
        finish_reason,
        usage,
    })
}
