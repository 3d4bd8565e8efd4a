//! Operator log channel
//!
//! Errors worth a human's attention go to a Telegram chat owned by the
//! operator. Delivery is best-effort: failures end up in a local file and
//! in the tracing output, never in the caller.

use crate::config::LOG_SINK_CHUNK_LEN;
use crate::utils::{escape_markdown_v2, slice_text};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const FALLBACK_FILE: &str = "log.txt";

/// Destination for operator-facing diagnostics
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Deliver a text message
    async fn log(&self, text: &str);

    /// Report an error with its source chain and an optional note
    async fn err(&self, error: &(dyn std::error::Error + Send + Sync), note: &str) {
        self.log(&format_error(error, note)).await;
    }

    /// Wait until everything sent so far is delivered
    async fn flush(&self) {}
}

/// Render an error and its sources as a note followed by a code block
#[must_use]
pub fn format_error(error: &(dyn std::error::Error + Send + Sync), note: &str) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push_str("\nCaused by: ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    format!("{note}\n```\n{chain}\n```")
}

/// Sink writing to the tracing output only
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn log(&self, text: &str) {
        info!(target: "operator", "{text}");
    }

    async fn err(&self, error: &(dyn std::error::Error + Send + Sync), note: &str) {
        error!(target: "operator", error = %error, "{note}");
    }
}

/// Sink posting to a Telegram chat through the Bot API
pub struct TelegramLogSink {
    http_client: HttpClient,
    api_base: String,
    token: String,
    chat_id: i64,
    name: String,
    fallback_path: PathBuf,
    send_lock: Mutex<()>,
}

impl TelegramLogSink {
    /// Create a sink for the given bot token and chat
    #[must_use]
    pub fn new(token: String, chat_id: i64, name: String) -> Self {
        Self {
            http_client: HttpClient::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| HttpClient::new()),
            api_base: TELEGRAM_API_BASE.to_string(),
            token,
            chat_id,
            name,
            fallback_path: PathBuf::from(FALLBACK_FILE),
            send_lock: Mutex::new(()),
        }
    }

    /// Use a different Bot API server
    #[must_use]
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Where undeliverable messages are appended
    #[must_use]
    pub fn with_fallback_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_path = path.into();
        self
    }

    /// Chunks sent for one log call: prefixed, escaped and sliced
    #[must_use]
    pub fn render(&self, text: &str) -> Vec<String> {
        let text = escape_markdown_v2(&format!("From {}:\n\n{text}", self.name));
        slice_text(&text, LOG_SINK_CHUNK_LEN)
    }

    async fn send(&self, text: &str, markdown: bool) -> Result<(), String> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let mut body = json!({
            "chat_id": self.chat_id,
            "text": text,
        });
        if markdown {
            body["parse_mode"] = json!("MarkdownV2");
        }

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("network error: {}", e.without_url()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(format!("{} {text}", status.as_u16()))
        }
    }

    async fn save_fallback(&self, failure: &str, chunk: &str) {
        let entry = format!("{failure}\n\n{chunk}\n\n");
        let written = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.fallback_path)
                .await?;
            file.write_all(entry.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            error!(
                path = %self.fallback_path.display(),
                error = %e,
                "Failed to write log fallback file"
            );
        }
    }
}

#[async_trait]
impl LogSink for TelegramLogSink {
    async fn log(&self, text: &str) {
        let _guard = self.send_lock.lock().await;

        for chunk in self.render(text) {
            let Err(failure) = self.send(&chunk, true).await else {
                continue;
            };
            warn!(chat_id = self.chat_id, failure = %failure, "Failed to deliver operator log");
            self.save_fallback(&failure, &chunk).await;

            let notice = format!(
                "Error sending message to Telegram:\n{failure}\nLog saved to {}",
                self.fallback_path.display()
            );
            if let Err(e) = self.send(&notice, false).await {
                warn!(error = %e, "Failed to deliver operator log notice");
            }
        }
    }

    async fn flush(&self) {
        let _guard = self.send_lock.lock().await;
    }
}
