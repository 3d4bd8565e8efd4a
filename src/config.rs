//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines
//! the constants shared by the context store, the engine and the bot.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Application settings loaded from config files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// API key for the OpenAI-compatible endpoint
    pub openai_api_key: String,
    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_openai_api_base")]
    pub openai_api_base: String,
    /// Chat model identifier
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Directory holding one `<user_id>.json` record per user
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Estimated token budget for a stored history
    #[serde(default = "default_history_token_budget")]
    pub history_token_budget: usize,
    /// Eviction never goes below this many messages
    #[serde(default = "default_history_min_messages")]
    pub history_min_messages: usize,
    /// Instruction placed at the top of every system message
    #[serde(default = "default_instruction")]
    pub default_instruction: String,

    /// Timeout for a single model call, in seconds (0 disables it)
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    /// Total attempts for a model call on transient errors
    #[serde(default = "default_llm_max_attempts")]
    pub llm_max_attempts: usize,

    /// Comma-separated list of allowed user IDs (empty means everyone)
    #[serde(rename = "allowed_users")]
    pub allowed_users_str: Option<String>,

    /// Bot token used by the operator log channel
    pub logger_token: Option<String>,
    /// Chat receiving operator logs
    pub logger_chat_id: Option<i64>,
    /// Name printed in front of every operator log
    #[serde(default = "default_logger_name")]
    pub logger_name: String,
}

fn default_openai_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

const fn default_temperature() -> f32 {
    0.4
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("db")
}

const fn default_history_token_budget() -> usize {
    HISTORY_TOKEN_BUDGET
}

const fn default_history_min_messages() -> usize {
    HISTORY_MIN_MESSAGES
}

fn default_instruction() -> String {
    DEFAULT_INSTRUCTION.to_string()
}

const fn default_llm_timeout_secs() -> u64 {
    60
}

const fn default_llm_max_attempts() -> usize {
    2
}

fn default_logger_name() -> String {
    "Test Logger".to_string()
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use gpt_bridge::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Local overrides, not checked into git
            .add_source(File::with_name("config/local").required(false))
            // `APP_DEBUG=1 ./target/app` sets the `debug` key
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Plain UPPER_SNAKE_CASE variables; empty ones count as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Returns a set of Telegram IDs that are allowed to use the bot
    #[must_use]
    pub fn allowed_users(&self) -> HashSet<i64> {
        self.allowed_users_str
            .as_ref()
            .map(|s| {
                s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .filter(|token| !token.is_empty())
                    .filter_map(|id| id.parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the given user may talk to the bot.
    ///
    /// An empty allow-list lets everyone in.
    #[must_use]
    pub fn is_allowed(&self, user_id: i64) -> bool {
        let allowed = self.allowed_users();
        allowed.is_empty() || allowed.contains(&user_id)
    }

    /// Per-call model timeout, `None` when disabled
    #[must_use]
    pub const fn llm_timeout(&self) -> Option<Duration> {
        if self.llm_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.llm_timeout_secs))
        }
    }
}

/// Instruction every system message starts with
pub const DEFAULT_INSTRUCTION: &str = "Use only MarkdownV2 formatting.\n";

/// Default estimated token budget of a stored history
pub const HISTORY_TOKEN_BUDGET: usize = 1024;
/// Eviction keeps at least this many messages
pub const HISTORY_MIN_MESSAGES: usize = 3;
/// Estimated token cost of one attached image
pub const IMAGE_TOKEN_SURCHARGE: usize = 85;

/// Detail level requested for images sent to the model
pub const IMAGE_DETAIL: &str = "low";

/// HTTP timeout for the model endpoint
pub const LLM_HTTP_TIMEOUT_SECS: u64 = 120;

/// Telegram message length used when splitting long answers
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4000;
/// Chunk size for operator log messages
pub const LOG_SINK_CHUNK_LEN: usize = 1990;

/// Retries for Telegram API operations
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;
/// Initial backoff between Telegram retries
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Upper bound for Telegram retry backoff
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 5000;
