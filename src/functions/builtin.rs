//! Functions every bot instance offers to the model.
//!
//! All of them end the answer cycle with an [`Action`] that the platform
//! renders, so none needs a followup call.

use super::{
    typed_arguments, Action, FunctionError, FunctionOutput, FunctionRegistry, ParamSpec, ParamType,
};
use serde::Deserialize;

#[derive(Deserialize)]
struct ClarifyArgs {
    question: String,
    #[serde(default)]
    options: Vec<String>,
}

#[derive(Deserialize)]
struct MemoryArgs {
    memory: String,
}

/// Register `clarify`, `set_memory` and `clear_memory`.
///
/// # Errors
///
/// Fails with `FunctionError::DuplicateName` if any of the names is already taken.
pub fn register_defaults(registry: &mut FunctionRegistry) -> Result<(), FunctionError> {
    registry.register_fn(
        "clarify",
        "Ask the user a clarifying question when the request is ambiguous. \
         Offer a few short answer options.",
        vec![
            ParamSpec::new("question", ParamType::String, "Question to ask the user"),
            ParamSpec::new(
                "options",
                ParamType::string_list(),
                "Suggested answers, shown as buttons",
            ),
        ],
        false,
        |args| async move {
            let ClarifyArgs { question, options } = typed_arguments("clarify", args)?;
            if question.trim().is_empty() {
                return Err(FunctionError::InvalidArguments {
                    name: "clarify".to_string(),
                    reason: "question must not be blank".to_string(),
                });
            }
            Ok(FunctionOutput::Action(Action::Clarify { question, options }))
        },
    )?;

    registry.register_fn(
        "set_memory",
        "Remember a fact about the user for future conversations. \
         Replaces anything remembered before.",
        vec![ParamSpec::new(
            "memory",
            ParamType::String,
            "Everything worth remembering about the user",
        )],
        false,
        |args| async move {
            let MemoryArgs { memory } = typed_arguments("set_memory", args)?;
            Ok(FunctionOutput::Action(Action::Memory {
                memory: Some(memory),
            }))
        },
    )?;

    registry.register_fn(
        "clear_memory",
        "Forget everything remembered about the user.",
        Vec::new(),
        false,
        |_| async { Ok(FunctionOutput::Action(Action::Memory { memory: None })) },
    )
}
