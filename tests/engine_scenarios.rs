use gpt_bridge::chat::{Answer, ChatEngine, EngineOptions};
use gpt_bridge::functions::{
    builtin, Action, FunctionOutput, FunctionRegistry, ParamSpec, ParamType,
};
use gpt_bridge::llm::{
    ChatRequest, ChatResponse, FunctionCall, LlmError, Message, ModelProvider, Role,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Replays canned responses in order and records every request
struct ScriptedProvider {
    responses: Mutex<Vec<ChatResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
    call_count: AtomicUsize,
}

impl ScriptedProvider {
    fn new(mut responses: Vec<ChatResponse>) -> Arc<Self> {
        responses.reverse();
        Arc::new(Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn request(&self, index: usize) -> ChatRequest {
        self.requests.lock().expect("poisoned")[index].clone()
    }
}

#[async_trait::async_trait]
impl ModelProvider for ScriptedProvider {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("poisoned").push(request.clone());
        self.responses
            .lock()
            .expect("poisoned")
            .pop()
            .ok_or(LlmError::EmptyResponse)
    }
}

/// Always fails with a network error
struct DownProvider {
    call_count: AtomicUsize,
}

#[async_trait::async_trait]
impl ModelProvider for DownProvider {
    async fn chat_completion(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        Err(LlmError::NetworkError("connection refused".to_string()))
    }
}

fn text(content: &str) -> ChatResponse {
    ChatResponse {
        content: Some(content.to_string()),
        finish_reason: "stop".to_string(),
        ..ChatResponse::default()
    }
}

fn call(name: &str, arguments: &str) -> ChatResponse {
    ChatResponse {
        function_call: Some(FunctionCall {
            name: name.to_string(),
            arguments: arguments.to_string(),
        }),
        finish_reason: "function_call".to_string(),
        ..ChatResponse::default()
    }
}

fn engine(provider: Arc<dyn ModelProvider>, registry: FunctionRegistry) -> ChatEngine {
    ChatEngine::new(provider, Arc::new(registry), EngineOptions::default())
}

#[tokio::test]
async fn test_plain_answer_without_functions() {
    let provider = ScriptedProvider::new(vec![text("Hello! How can I help?")]);
    let engine = engine(provider.clone(), FunctionRegistry::new());

    let answer = engine
        .generate_answer(&[Message::system("be nice"), Message::user("Hi")])
        .await
        .expect("Should succeed");

    assert_eq!(answer, Answer::Text("Hello! How can I help?".to_string()));
    assert_eq!(provider.calls(), 1);
    let request = provider.request(0);
    assert!(request.functions.is_none());
    assert_eq!(request.messages.len(), 2);
}

#[tokio::test]
async fn test_clarify_is_a_single_call() {
    let provider = ScriptedProvider::new(vec![call(
        "clarify",
        r#"{"question":"Which city?","options":["Paris","Rome"]}"#,
    )]);
    let mut registry = FunctionRegistry::new();
    builtin::register_defaults(&mut registry).expect("Should register");
    let engine = engine(provider.clone(), registry);

    let answer = engine
        .generate_answer(&[Message::user("What's the weather?")])
        .await
        .expect("Should succeed");

    assert_eq!(
        answer,
        Answer::Action(Action::Clarify {
            question: "Which city?".to_string(),
            options: vec!["Paris".to_string(), "Rome".to_string()],
        })
    );
    assert_eq!(provider.calls(), 1);
    let functions = provider.request(0).functions.expect("functions offered");
    assert_eq!(functions[0].name, "clarify");
    assert_eq!(
        functions[0].parameters["required"],
        json!(["question", "options"])
    );
}

#[tokio::test]
async fn test_followup_makes_exactly_two_calls() {
    let provider = ScriptedProvider::new(vec![
        call("lookup", r#"{"key":"answer"}"#),
        text("The answer is 42."),
    ]);
    let mut registry = FunctionRegistry::new();
    registry
        .register_fn(
            "lookup",
            "Look a value up",
            vec![ParamSpec::new("key", ParamType::String, "Key")],
            true,
            |_| async { Ok(FunctionOutput::Data(json!({"value": 42}))) },
        )
        .expect("Should register");
    let engine = engine(provider.clone(), registry);

    let context = [Message::user("What is the answer?")];
    let answer = engine.generate_answer(&context).await.expect("Should succeed");

    assert_eq!(answer, Answer::Text("The answer is 42.".to_string()));
    assert_eq!(provider.calls(), 2);

    let followup = provider.request(1);
    assert_eq!(followup.messages.len(), 3);
    assert_eq!(followup.messages[0], context[0]);
    assert_eq!(
        followup.messages[1].function_call.as_ref().map(|c| c.name.as_str()),
        Some("lookup")
    );
    let result = &followup.messages[2];
    assert_eq!(result.role, Role::Function);
    assert_eq!(result.name.as_deref(), Some("lookup"));
    assert_eq!(result.text().as_deref(), Some(r#"{"value":42}"#));
}

#[tokio::test]
async fn test_data_without_followup_is_returned_raw() {
    let provider = ScriptedProvider::new(vec![call("now", "")]);
    let mut registry = FunctionRegistry::new();
    registry
        .register_fn("now", "Current time", vec![], false, |_| async {
            Ok(FunctionOutput::Data(json!({"time": "12:00"})))
        })
        .expect("Should register");

    let answer = engine(provider.clone(), registry)
        .generate_answer_from_text("time?")
        .await
        .expect("Should succeed");
    assert_eq!(answer, Answer::Data(json!({"time": "12:00"})));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_unreachable_model_is_reported() {
    let provider = Arc::new(DownProvider {
        call_count: AtomicUsize::new(0),
    });
    let engine = engine(provider.clone(), FunctionRegistry::new());

    let err = engine
        .generate_answer_from_text("Hi")
        .await
        .expect_err("Should fail");
    assert!(err.to_string().contains("connection refused"));
    assert_eq!(provider.call_count.load(Ordering::SeqCst), 1);
}
