//! Chat engine - one answer cycle against the model
//!
//! Sends the context with the registered function schemas, runs the
//! function the model asks for and, when the function needs it, makes a
//! followup call so the model can phrase the result.

use crate::config::Settings;
use crate::functions::{parse_arguments, Action, FunctionError, FunctionOutput, FunctionRegistry};
use crate::llm::{ChatRequest, ChatResponse, LlmError, Message, ModelProvider};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors of an answer cycle
#[derive(Debug, Error)]
pub enum ChatError {
    /// The model could not be reached or returned nothing usable
    #[error("Model unavailable: {0}")]
    ModelUnavailable(#[from] LlmError),
    /// The requested function could not be called
    #[error(transparent)]
    Function(#[from] FunctionError),
}

/// Result of one answer cycle
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// Text written by the model
    Text(String),
    /// Raw output of a function that did not need a followup
    Data(Value),
    /// Structured action for the platform to render
    Action(Action),
}

impl From<FunctionOutput> for Answer {
    fn from(output: FunctionOutput) -> Self {
        match output {
            FunctionOutput::Data(value) => Self::Data(value),
            FunctionOutput::Action(action) => Self::Action(action),
        }
    }
}

/// Model call parameters
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Model identifier
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Timeout for a single provider call
    pub request_timeout: Option<Duration>,
    /// Total attempts per call, retrying only transient errors
    pub max_attempts: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.4,
            request_timeout: None,
            max_attempts: 1,
        }
    }
}

impl From<&Settings> for EngineOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            model: settings.model.clone(),
            temperature: settings.temperature,
            request_timeout: settings.llm_timeout(),
            max_attempts: settings.llm_max_attempts.max(1),
        }
    }
}

/// Runs answer cycles with an injected provider and function registry
pub struct ChatEngine {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<FunctionRegistry>,
    options: EngineOptions,
}

impl ChatEngine {
    /// Create a new engine
    #[must_use]
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<FunctionRegistry>,
        options: EngineOptions,
    ) -> Self {
        Self {
            provider,
            registry,
            options,
        }
    }

    /// Answer a bare text prompt with no history
    ///
    /// # Errors
    ///
    /// Same as [`Self::generate_answer`].
    pub async fn generate_answer_from_text(&self, text: &str) -> Result<Answer, ChatError> {
        self.generate_answer(&[Message::user(text)]).await
    }

    /// Run one answer cycle over the given context.
    ///
    /// Function schemas are offered only when the registry is not empty.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::ModelUnavailable` if a provider call fails after
    /// retries or yields no text where text is expected, and
    /// `ChatError::Function` if the requested function cannot be parsed or run.
    pub async fn generate_answer(&self, context: &[Message]) -> Result<Answer, ChatError> {
        let functions = if self.registry.is_empty() {
            None
        } else {
            Some(self.registry.describe_all())
        };

        let request = ChatRequest {
            model: self.options.model.clone(),
            temperature: self.options.temperature,
            messages: context.to_vec(),
            functions,
        };
        let response = self.complete(&request).await?;

        let Some(call) = response.function_call else {
            return text_answer(response.content);
        };

        info!(function = %call.name, "Model requested a function call");
        let arguments = parse_arguments(&call.name, &call.arguments)?;
        let invocation = self.registry.invoke(&call.name, arguments).await?;

        if !invocation.needs_followup {
            return Ok(invocation.output.into());
        }

        let result = serde_json::to_string(&invocation.output).map_err(|e| {
            FunctionError::Execution {
                name: call.name.clone(),
                reason: format!("Result is not serializable: {e}"),
            }
        })?;

        let mut messages = request.messages;
        let name = call.name.clone();
        messages.push(Message::assistant_function_call(call));
        messages.push(Message::function_result(&name, &result));

        let followup = ChatRequest {
            model: request.model,
            temperature: request.temperature,
            messages,
            functions: None,
        };
        let response = self.complete(&followup).await?;
        text_answer(response.content)
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let max_attempts = self.options.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let start = Instant::now();
            let result = self.call_once(request).await;
            let duration = start.elapsed();

            match result {
                Ok(response) => {
                    if let Some(usage) = response.usage {
                        info!(
                            model = %request.model,
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            total_tokens = usage.total_tokens,
                            duration_ms = duration.as_millis(),
                            "Completion created"
                        );
                    }
                    debug!(
                        finish_reason = %response.finish_reason,
                        has_function_call = response.function_call.is_some(),
                        "Received response from model"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    warn!(
                        model = %request.model,
                        attempt,
                        max_attempts,
                        duration_ms = duration.as_millis(),
                        error = %e,
                        "Model request failed"
                    );
                    if attempt < max_attempts {
                        if let Some(backoff) = retry_delay(&e, attempt) {
                            info!(
                                backoff_ms = backoff.as_millis(),
                                attempt,
                                "Retrying model request"
                            );
                            tokio::time::sleep(backoff).await;
                            continue;
                        }
                    }
                    return Err(e);
                }
            }
        }

        Err(LlmError::ApiError("All retry attempts exhausted".to_string()))
    }

    async fn call_once(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        match self.options.request_timeout {
            Some(limit) => tokio::time::timeout(limit, self.provider.chat_completion(request))
                .await
                .map_err(|_| LlmError::Timeout(limit.as_secs()))?,
            None => self.provider.chat_completion(request).await,
        }
    }
}

/// Text the user can be shown; blank or missing text is an empty response
fn text_answer(content: Option<String>) -> Result<Answer, ChatError> {
    content
        .filter(|text| !text.trim().is_empty())
        .map(Answer::Text)
        .ok_or(ChatError::ModelUnavailable(LlmError::EmptyResponse))
}

/// Delay before the next attempt, `None` when the error is not worth retrying
fn retry_delay(error: &LlmError, attempt: usize) -> Option<Duration> {
    const INITIAL_BACKOFF_MS: u64 = 1000;
    // longest `retry-after` we are willing to sit through for one user
    const MAX_RETRY_AFTER_SECS: u64 = 60;

    if !error.is_transient() {
        return None;
    }
    let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(6);
    match error {
        LlmError::RateLimit {
            wait_secs: Some(secs),
            ..
        } => Some(Duration::from_secs(secs.saturating_add(1).min(MAX_RETRY_AFTER_SECS))),
        LlmError::RateLimit { .. } => Some(Duration::from_secs(10 * 2u64.pow(exponent))),
        _ => Some(Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(exponent))),
    }
}
