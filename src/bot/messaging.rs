//! Sending answers to Telegram.
//!
//! Answers go out as MarkdownV2. When Telegram refuses the markup the same
//! part is re-sent as plain text, so a badly formatted answer still arrives.

use crate::config::TELEGRAM_MESSAGE_LIMIT;
use crate::log_sink::LogSink;
use crate::utils::{self, escape_characters, ANSWER_ESCAPED};
use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatId, KeyboardMarkup, ParseMode, ReplyMarkup};
use teloxide::{ApiError, RequestError};
use thiserror::Error;
use tracing::warn;

/// Failure to deliver a rendered message
#[derive(Debug, Error)]
pub enum RenderError {
    /// Telegram could not parse the MarkdownV2 entities
    #[error("Telegram rejected the formatting: {0}")]
    Format(String),
    /// Any other Bot API failure
    #[error("Telegram request failed: {0}")]
    Request(RequestError),
}

impl From<RequestError> for RenderError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Api(ApiError::CantParseEntities(reason)) => Self::Format(reason),
            other => Self::Request(other),
        }
    }
}

/// Send a message with automatic retry on network failures.
///
/// # Errors
///
/// Returns the last error after all retries are exhausted.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    reply_markup: Option<ReplyMarkup>,
) -> Result<Message> {
    let text = text.into();
    utils::retry_telegram_operation(|| async {
        let mut req = bot.send_message(chat_id, text.clone());
        if let Some(markup) = reply_markup.clone() {
            req = req.reply_markup(markup);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Send one part as MarkdownV2.
///
/// # Errors
///
/// Returns `RenderError::Format` when Telegram cannot parse the markup and
/// `RenderError::Request` for any other failure.
pub async fn send_markdown(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    reply_markup: Option<ReplyMarkup>,
) -> Result<(), RenderError> {
    let mut req = bot
        .send_message(chat_id, text)
        .parse_mode(ParseMode::MarkdownV2);
    if let Some(markup) = reply_markup {
        req = req.reply_markup(markup);
    }
    req.await?;
    Ok(())
}

/// Split an answer into `(plain, escaped)` pairs that both fit one message.
///
/// A part whose escaped form outgrows the limit is split again at half the
/// limit; escaping at most doubles the length, so the second split fits.
#[must_use]
pub fn answer_parts(text: &str) -> Vec<(String, String)> {
    let mut parts = Vec::new();
    for part in utils::split_long_message(text, TELEGRAM_MESSAGE_LIMIT) {
        let escaped = escape_characters(&part, ANSWER_ESCAPED);
        if escaped.chars().count() <= TELEGRAM_MESSAGE_LIMIT {
            parts.push((part, escaped));
            continue;
        }
        for piece in utils::split_long_message(&part, TELEGRAM_MESSAGE_LIMIT / 2) {
            let escaped = escape_characters(&piece, ANSWER_ESCAPED);
            parts.push((piece, escaped));
        }
    }
    parts
}

/// Send a model answer, split at the Telegram limit.
///
/// Each part is escaped on `!.-` and sent as MarkdownV2. A part Telegram
/// refuses for any reason is reported to the sink and re-sent as plain text.
///
/// # Errors
///
/// Returns an error if a part cannot be delivered even as plain text.
pub async fn send_answer(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    reply_markup: Option<ReplyMarkup>,
    sink: &dyn LogSink,
) -> Result<()> {
    let parts = answer_parts(text);
    let last = parts.len().saturating_sub(1);

    for (i, (plain, escaped)) in parts.into_iter().enumerate() {
        // the keyboard goes with the last part only
        let markup = if i == last { reply_markup.clone() } else { None };

        if let Err(e) = send_markdown(bot, chat_id, &escaped, markup.clone()).await {
            warn!(chat_id = chat_id.0, error = %e, "Falling back to plain text");
            sink.log(&format!("Error while sending message to Telegram: {e}")).await;
            send_message_resilient(bot, chat_id, plain, markup).await?;
        }
    }
    Ok(())
}

/// One-time reply keyboard with one option per row
#[must_use]
pub fn options_keyboard(options: &[String]) -> KeyboardMarkup {
    let rows = options
        .iter()
        .map(|option| vec![teloxide::types::KeyboardButton::new(option.clone())])
        .collect::<Vec<_>>();
    KeyboardMarkup::new(rows).resize_keyboard().one_time_keyboard()
}
