//! Function registry - local capabilities offered to the model
//!
//! Holds declarative descriptors for every callable function, renders them
//! as JSON schemas for the model and dispatches calls by name. The registry
//! is built once at startup and only read afterwards.

/// Functions registered by default
pub mod builtin;

use crate::llm::FunctionSchema;
use lazy_regex::regex_is_match;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Arguments passed to a function, always a JSON object
pub type Arguments = Map<String, Value>;

/// Boxed future returned by a function handler
pub type FunctionFuture =
    Pin<Box<dyn Future<Output = Result<FunctionOutput, FunctionError>> + Send>>;

/// Owned async callable behind a descriptor
pub type FunctionHandler = Arc<dyn Fn(Arguments) -> FunctionFuture + Send + Sync>;

/// Errors raised while registering or calling functions
#[derive(Debug, Error)]
pub enum FunctionError {
    /// A function with this name is already registered
    #[error("Function already registered: {0}")]
    DuplicateName(String),
    /// The name does not match `^[A-Za-z0-9_-]{1,64}$`
    #[error("Invalid function name: {0:?}")]
    InvalidName(String),
    /// No function with this name is registered
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    /// The model sent arguments that are not a JSON object
    #[error("Malformed arguments for {name}: {reason}")]
    MalformedArguments {
        /// Function the arguments were meant for
        name: String,
        /// Parser message
        reason: String,
    },
    /// Arguments parsed but do not fit the function's parameters
    #[error("Invalid arguments for {name}: {reason}")]
    InvalidArguments {
        /// Function the arguments were meant for
        name: String,
        /// What did not fit
        reason: String,
    },
    /// The function itself failed
    #[error("Function {name} failed: {reason}")]
    Execution {
        /// Function that failed
        name: String,
        /// Failure description
        reason: String,
    },
}

/// Semantic type of a parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    /// JSON string
    String,
    /// JSON number
    Number,
    /// Integral JSON number
    Integer,
    /// JSON boolean
    Boolean,
    /// JSON array of the inner type
    Array(Box<ParamType>),
    /// Any other type, sent under its declared name
    Named(String),
}

impl ParamType {
    /// Array of strings, the most common list parameter
    #[must_use]
    pub fn string_list() -> Self {
        Self::Array(Box::new(Self::String))
    }

    /// JSON schema fragment for this type
    #[must_use]
    pub fn schema(&self) -> Value {
        match self {
            Self::String => json!({"type": "string"}),
            Self::Number => json!({"type": "number"}),
            Self::Integer => json!({"type": "integer"}),
            Self::Boolean => json!({"type": "boolean"}),
            Self::Array(items) => json!({"type": "array", "items": items.schema()}),
            Self::Named(name) => json!({"type": name}),
        }
    }
}

/// Declared parameter of a function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    /// Parameter name as the model must send it
    pub name: String,
    /// Semantic type
    pub kind: ParamType,
    /// Human-readable description for the model
    pub description: String,
}

impl ParamSpec {
    /// Create a new parameter spec
    #[must_use]
    pub fn new(name: &str, kind: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
        }
    }
}

/// Structured UI action that ends the answer cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Ask the user a clarifying question with suggested answers
    Clarify {
        /// The question
        question: String,
        /// Suggested answers
        options: Vec<String>,
    },
    /// Remember a fact about the user, or forget it when `None`
    Memory {
        /// Fact to remember
        memory: Option<String>,
    },
}

/// Result of a function call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FunctionOutput {
    /// Plain data to forward back into the model
    Data(Value),
    /// Terminal action rendered by the platform
    Action(Action),
}

/// Outcome of [`FunctionRegistry::invoke`]
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Whether the model must see the output to produce the final answer
    pub needs_followup: bool,
    /// What the function returned
    pub output: FunctionOutput,
}

/// A registered function
pub struct FunctionDescriptor {
    /// Unique name
    pub name: String,
    /// What the function does, for the model
    pub description: String,
    /// Parameters in declaration order, all required
    pub params: Vec<ParamSpec>,
    /// Whether the result goes back to the model
    pub needs_followup: bool,
    handler: FunctionHandler,
}

impl std::fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("needs_followup", &self.needs_followup)
            .finish_non_exhaustive()
    }
}

impl FunctionDescriptor {
    /// Build a descriptor around an async callable
    pub fn new<F, Fut>(
        name: &str,
        description: &str,
        params: Vec<ParamSpec>,
        needs_followup: bool,
        callable: F,
    ) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FunctionOutput, FunctionError>> + Send + 'static,
    {
        let handler: FunctionHandler =
            Arc::new(move |args| Box::pin(callable(args)) as FunctionFuture);
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params,
            needs_followup,
            handler,
        }
    }

    /// Schema sent to the model
    #[must_use]
    pub fn schema(&self) -> FunctionSchema {
        let mut properties = Map::new();
        for param in &self.params {
            let mut property = param.kind.schema();
            property["description"] = json!(param.description);
            properties.insert(param.name.clone(), property);
        }
        let required: Vec<&str> = self.params.iter().map(|p| p.name.as_str()).collect();

        FunctionSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

/// Registry of functions the model may call
#[derive(Default)]
pub struct FunctionRegistry {
    functions: Vec<FunctionDescriptor>,
    index: HashMap<String, usize>,
}

impl FunctionRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function.
    ///
    /// # Errors
    ///
    /// Returns `FunctionError::InvalidName` if the name is not 1-64 characters of
    /// `[A-Za-z0-9_-]`, `FunctionError::DuplicateName` if it is already taken.
    /// A failed registration leaves the registry unchanged.
    pub fn register(&mut self, descriptor: FunctionDescriptor) -> Result<(), FunctionError> {
        if !regex_is_match!(r"^[A-Za-z0-9_-]{1,64}$", &descriptor.name) {
            return Err(FunctionError::InvalidName(descriptor.name));
        }
        if self.index.contains_key(&descriptor.name) {
            return Err(FunctionError::DuplicateName(descriptor.name));
        }
        info!(
            function = %descriptor.name,
            params = descriptor.params.len(),
            needs_followup = descriptor.needs_followup,
            "Registered function"
        );
        self.index.insert(descriptor.name.clone(), self.functions.len());
        self.functions.push(descriptor);
        Ok(())
    }

    /// Shorthand for [`FunctionDescriptor::new`] followed by [`Self::register`].
    ///
    /// # Errors
    ///
    /// Same as [`Self::register`].
    pub fn register_fn<F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        params: Vec<ParamSpec>,
        needs_followup: bool,
        callable: F,
    ) -> Result<(), FunctionError>
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FunctionOutput, FunctionError>> + Send + 'static,
    {
        self.register(FunctionDescriptor::new(
            name,
            description,
            params,
            needs_followup,
            callable,
        ))
    }

    /// Schemas of all functions, in registration order
    #[must_use]
    pub fn describe_all(&self) -> Vec<FunctionSchema> {
        self.functions.iter().map(FunctionDescriptor::schema).collect()
    }

    /// Look up a descriptor by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.index.get(name).map(|&i| &self.functions[i])
    }

    /// Number of registered functions
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// True when nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Call a function by name.
    ///
    /// # Errors
    ///
    /// Returns `FunctionError::UnknownFunction` without running anything if the
    /// name is not registered, or whatever the function itself returns.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: Arguments,
    ) -> Result<Invocation, FunctionError> {
        let Some(descriptor) = self.get(name) else {
            warn!(function = name, "Model called an unknown function");
            return Err(FunctionError::UnknownFunction(name.to_string()));
        };

        debug!(function = name, args = arguments.len(), "Invoking function");
        let output = (descriptor.handler)(arguments).await?;

        Ok(Invocation {
            needs_followup: descriptor.needs_followup,
            output,
        })
    }
}

/// Parse the model's argument string into an argument map.
///
/// Blank input means no arguments.
///
/// # Errors
///
/// Returns `FunctionError::MalformedArguments` if the string is not valid JSON
/// or not a JSON object.
pub fn parse_arguments(name: &str, raw: &str) -> Result<Arguments, FunctionError> {
    if raw.trim().is_empty() {
        return Ok(Arguments::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(FunctionError::MalformedArguments {
            name: name.to_string(),
            reason: format!("expected a JSON object, got {other}"),
        }),
        Err(e) => Err(FunctionError::MalformedArguments {
            name: name.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Deserialize arguments into a typed struct.
///
/// # Errors
///
/// Returns `FunctionError::InvalidArguments` if a field is missing or has the
/// wrong type.
pub fn typed_arguments<T: serde::de::DeserializeOwned>(
    name: &str,
    arguments: Arguments,
) -> Result<T, FunctionError> {
    serde_json::from_value(Value::Object(arguments)).map_err(|e| FunctionError::InvalidArguments {
        name: name.to_string(),
        reason: e.to_string(),
    })
}
