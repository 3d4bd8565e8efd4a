#![deny(missing_docs)]
//! GPT Bridge library.
//!
//! Telegram chat bot over an OpenAI-compatible model with function calling
//! and per-user conversation history.

/// Telegram handlers and rendering.
pub mod bot;
/// Answer cycle against the model.
pub mod chat;
/// Configuration management.
pub mod config;
/// Functions offered to the model.
pub mod functions;
/// Operator log channel.
pub mod log_sink;
/// LLM provider interface and message model.
pub mod llm;
/// Per-user conversation storage.
pub mod storage;
/// Utility functions.
pub mod utils;
