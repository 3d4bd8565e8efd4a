//! Utility functions for text processing and message formatting.
//!
//! Regex patterns use the `lazy-regex` crate so they are validated at
//! compile time and built on first use.

// lazy_regex! uses once_cell internally
#![allow(clippy::non_std_lazy_statics)]

use anyhow::Result;
use lazy_regex::lazy_regex;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

/// Match fenced code blocks: ```...```
static RE_CODE_BLOCK: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"```[\s\S]*?```");

/// Characters reserved by Telegram MarkdownV2
pub const MARKDOWN_V2_RESERVED: &str = "_*[]()~>#+-=|{}.!";

/// Characters escaped in model answers before sending them as MarkdownV2.
///
/// The model is asked to produce MarkdownV2 itself, so only the characters
/// it routinely forgets are escaped.
pub const ANSWER_ESCAPED: &str = "!.-";

/// Prefix every occurrence of the given characters with a backslash.
///
/// # Examples
///
/// ```
/// use gpt_bridge::utils::escape_characters;
/// assert_eq!(escape_characters("1.5 - ok!", "!.-"), "1\\.5 \\- ok\\!");
/// ```
#[must_use]
pub fn escape_characters(text: &str, characters: &str) -> String {
    let mut result = String::with_capacity(text.len());
    for c in text.chars() {
        if characters.contains(c) {
            result.push('\\');
        }
        result.push(c);
    }
    result
}

/// Escape every MarkdownV2 reserved character
#[must_use]
pub fn escape_markdown_v2(text: &str) -> String {
    escape_characters(text, MARKDOWN_V2_RESERVED)
}

/// Split text into chunks of at most `length` characters.
///
/// Fenced code blocks are split separately and every piece of a code block
/// is re-fenced, so each chunk renders on its own.
///
/// # Examples
///
/// ```
/// use gpt_bridge::utils::slice_text;
/// assert_eq!(slice_text("short", 10), vec!["short".to_string()]);
/// assert_eq!(slice_text("", 10), vec![String::new()]);
/// ```
#[must_use]
pub fn slice_text(text: &str, length: usize) -> Vec<String> {
    if text.chars().count() <= length {
        return vec![text.to_string()];
    }

    let mut result = Vec::new();
    let mut last = 0;
    for block in RE_CODE_BLOCK.find_iter(text) {
        push_chunks(&mut result, &text[last..block.start()], length, None);
        let inner = &block.as_str()[3..block.as_str().len() - 3];
        push_chunks(&mut result, inner, length, Some("```"));
        last = block.end();
    }
    push_chunks(&mut result, &text[last..], length, None);
    result
}

fn push_chunks(out: &mut Vec<String>, text: &str, length: usize, fence: Option<&str>) {
    let mut chunk = String::new();
    let mut count = 0;
    for grapheme in text.graphemes(true) {
        if count == length {
            out.push(fenced(&chunk, fence));
            chunk.clear();
            count = 0;
        }
        chunk.push_str(grapheme);
        count += 1;
    }
    if !chunk.is_empty() {
        out.push(fenced(&chunk, fence));
    }
}

fn fenced(chunk: &str, fence: Option<&str>) -> String {
    fence.map_or_else(|| chunk.to_string(), |f| format!("{f}\n{chunk}{f}"))
}

/// Split a long message into parts that fit the Telegram limit.
///
/// Splits on line boundaries and keeps code fences balanced across parts.
///
/// # Examples
///
/// ```
/// use gpt_bridge::utils::split_long_message;
/// let long_msg = "A very long message...\n".repeat(300);
/// let parts = split_long_message(&long_msg, 4000);
/// assert!(parts.len() > 1);
/// ```
#[must_use]
pub fn split_long_message(message: &str, max_length: usize) -> Vec<String> {
    const FENCE: &str = "```";

    if message.len() <= max_length {
        return if message.is_empty() {
            Vec::new()
        } else {
            vec![message.to_string()]
        };
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_code = false;

    for line in message.lines() {
        let pieces: Vec<String> = if line.len() > max_length {
            // One oversized line: cut it on grapheme boundaries
            let mut pieces = Vec::new();
            let mut piece = String::new();
            for grapheme in line.graphemes(true) {
                if piece.len() + grapheme.len() > max_length / 2 {
                    pieces.push(std::mem::take(&mut piece));
                }
                piece.push_str(grapheme);
            }
            pieces.push(piece);
            pieces
        } else {
            vec![line.to_string()]
        };

        for piece in pieces {
            if !current.is_empty() && current.len() + piece.len() + FENCE.len() + 2 > max_length {
                if in_code {
                    current.push_str(FENCE);
                }
                parts.push(current.trim_end().to_string());
                current.clear();
                if in_code {
                    current.push_str(FENCE);
                    current.push('\n');
                }
            }
            if piece.starts_with(FENCE) {
                in_code = !in_code;
            }
            current.push_str(&piece);
            current.push('\n');
        }
    }

    if !current.trim().is_empty() {
        parts.push(current.trim_end().to_string());
    }
    parts
}

/// Safely truncates a string to a maximum character length (not bytes).
///
/// # Examples
///
/// ```
/// use gpt_bridge::utils::truncate_str;
/// let s = "Привет, мир!";
/// assert_eq!(truncate_str(s, 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}

/// Retry a Telegram API operation with exponential backoff and jitter.
///
/// # Errors
///
/// Returns the last error if all attempts fail.
pub async fn retry_telegram_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    use crate::config::{
        TELEGRAM_API_INITIAL_BACKOFF_MS, TELEGRAM_API_MAX_BACKOFF_MS, TELEGRAM_API_MAX_RETRIES,
    };

    let retry_strategy = ExponentialBackoff::from_millis(TELEGRAM_API_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TELEGRAM_API_MAX_BACKOFF_MS))
        .map(jitter)
        .take(TELEGRAM_API_MAX_RETRIES);

    Retry::spawn(retry_strategy, operation).await.map_err(|e| {
        warn!(
            "Telegram API operation failed after {} attempts: {}",
            TELEGRAM_API_MAX_RETRIES, e
        );
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str_unicode() {
        let s = "Привет, мир!";
        assert_eq!(truncate_str(s, 6), "Привет");
        assert_eq!(truncate_str(s, 50), "Привет, мир!");
    }

    #[test]
    fn test_escape_markdown_v2() {
        assert_eq!(escape_markdown_v2("a_b (c)"), "a\\_b \\(c\\)");
        assert_eq!(escape_characters("no change", "!"), "no change");
    }

    #[test]
    fn test_slice_text_plain() {
        let text = "x".repeat(25);
        let parts = slice_text(&text, 10);
        assert_eq!(parts, vec!["x".repeat(10), "x".repeat(10), "x".repeat(5)]);
    }

    #[test]
    fn test_slice_text_refences_code_blocks() {
        let text = format!("intro\n```{}```tail", "c".repeat(12));
        let parts = slice_text(&text, 10);
        assert_eq!(parts[0], "intro\n");
        assert_eq!(parts[1], format!("```\n{}```", "c".repeat(10)));
        assert_eq!(parts[2], "```\ncc```");
        assert_eq!(parts[3], "tail");
    }

    #[test]
    fn test_split_long_message_respects_limit() {
        let long_msg = "line of text\n".repeat(50);
        let parts = split_long_message(&long_msg, 100);
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.len() <= 100));
        assert_eq!(parts.concat().matches("line of text").count(), 50);
    }

    #[test]
    fn test_split_long_message_keeps_fences_balanced() {
        let body = "let x = 1;\n".repeat(30);
        let msg = format!("```rust\n{body}```");
        let parts = split_long_message(&msg, 120);
        assert!(parts.len() > 1);
        for part in &parts {
            assert_eq!(part.matches("```").count() % 2, 0, "unbalanced: {part}");
        }
    }

    #[test]
    fn test_split_short_and_empty() {
        assert_eq!(split_long_message("hi", 10), vec!["hi".to_string()]);
        assert!(split_long_message("", 10).is_empty());
    }
}
