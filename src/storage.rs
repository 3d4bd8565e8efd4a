//! Per-user conversation storage
//!
//! Each user gets one pretty-printed JSON record under the data directory
//! holding free-text settings and the chronological message history.
//! Every operation is a read-modify-write under the user's async mutex and
//! lands on disk through a temp file rename.

use crate::config::{
    Settings, DEFAULT_INSTRUCTION, HISTORY_MIN_MESSAGES, HISTORY_TOKEN_BUDGET,
    IMAGE_TOKEN_SURCHARGE,
};
use crate::llm::{Message, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Errors raised by the context store
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem failure other than a missing record
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The record on disk is not valid JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// A user or assistant message with neither text nor image
    #[error("Refusing to store an empty {0} message")]
    EmptyMessage(Role),
}

/// One persisted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Author
    pub role: Role,
    /// Text, if any
    #[serde(default)]
    pub text: Option<String>,
    /// Attached image URL, if any
    #[serde(default)]
    pub image_url: Option<String>,
}

impl StoredMessage {
    /// Rebuild the model-facing message
    #[must_use]
    pub fn to_message(&self) -> Message {
        Message::pack(
            self.text.as_deref(),
            &[self.image_url.as_deref()],
            self.role,
        )
    }
}

/// Everything stored for one user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Free-text settings appended to the system message
    #[serde(default)]
    pub settings: Option<String>,
    /// History, oldest first
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

/// Rough token estimate of one message.
///
/// A quarter of the character count, plus a flat surcharge for an image.
/// This is an approximation, not a tokenizer.
#[must_use]
pub fn estimate_tokens(message: &StoredMessage) -> usize {
    let text = message.text.as_deref().map_or(0, |t| t.chars().count() / 4);
    let image = if message.image_url.as_deref().is_some_and(|u| !u.is_empty()) {
        IMAGE_TOKEN_SURCHARGE
    } else {
        0
    };
    text + image
}

/// Estimated token sum of a history
#[must_use]
pub fn history_tokens(messages: &[StoredMessage]) -> usize {
    messages.iter().map(estimate_tokens).sum()
}

/// Drop the oldest messages while the history is over budget and longer
/// than `min_messages`. Returns how many were dropped.
pub fn evict_oldest(
    messages: &mut Vec<StoredMessage>,
    budget: usize,
    min_messages: usize,
) -> usize {
    let mut total = history_tokens(messages);
    let mut dropped = 0;
    while total > budget && messages.len() - dropped > min_messages {
        total -= estimate_tokens(&messages[dropped]);
        dropped += 1;
    }
    messages.drain(..dropped);
    dropped
}

/// Per-user async mutexes.
///
/// Entries are created on first use and never removed, one per user seen.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl UserLocks {
    /// Create an empty lock map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the user's lock and hold it until the guard is dropped
    pub async fn lock(&self, user_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(user_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Tunables of the context store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Text every system message starts with
    pub default_instruction: String,
    /// Estimated token budget of a history
    pub token_budget: usize,
    /// Eviction never goes below this many messages
    pub min_messages: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            default_instruction: DEFAULT_INSTRUCTION.to_string(),
            token_budget: HISTORY_TOKEN_BUDGET,
            min_messages: HISTORY_MIN_MESSAGES,
        }
    }
}

impl From<&Settings> for StoreOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            default_instruction: settings.default_instruction.clone(),
            token_budget: settings.history_token_budget,
            min_messages: settings.history_min_messages,
        }
    }
}

/// File-backed store of conversation records keyed by user id
pub struct ContextStore {
    data_dir: PathBuf,
    options: StoreOptions,
    locks: UserLocks,
}

impl ContextStore {
    /// Create a store rooted at `data_dir`. The directory is created on first write.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self {
            data_dir: data_dir.into(),
            options,
            locks: UserLocks::new(),
        }
    }

    /// Store configured from application settings
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.data_dir.clone(), StoreOptions::from(settings))
    }

    /// Path of the user's record
    #[must_use]
    pub fn record_path(&self, user_id: i64) -> PathBuf {
        self.data_dir.join(format!("{user_id}.json"))
    }

    /// System message followed by the stored history, one message per entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read or parsed.
    pub async fn get_full_context(&self, user_id: i64) -> Result<Vec<Message>, StorageError> {
        let _guard = self.locks.lock(user_id).await;
        let record = self.load(user_id).await?.unwrap_or_default();

        let mut system = self.options.default_instruction.clone();
        if let Some(settings) = record.settings.as_deref().filter(|s| !s.is_empty()) {
            system.push_str(settings);
        }

        let mut context = Vec::with_capacity(record.messages.len() + 1);
        context.push(Message::system(&system));
        context.extend(record.messages.iter().map(StoredMessage::to_message));

        debug!(
            user_id,
            messages = record.messages.len(),
            tokens = history_tokens(&record.messages),
            "Loaded context"
        );
        Ok(context)
    }

    /// Append one message and evict the oldest ones while over budget.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::EmptyMessage` for a user or assistant message
    /// with neither text nor image, or an I/O or JSON error.
    pub async fn add_to_history(
        &self,
        user_id: i64,
        role: Role,
        text: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<(), StorageError> {
        let text = text.filter(|t| !t.is_empty());
        let image_url = image_url.filter(|u| !u.is_empty());
        if matches!(role, Role::User | Role::Assistant) && text.is_none() && image_url.is_none() {
            return Err(StorageError::EmptyMessage(role));
        }

        let _guard = self.locks.lock(user_id).await;
        let mut record = self.load(user_id).await?.unwrap_or_default();
        record.messages.push(StoredMessage {
            role,
            text: text.map(ToString::to_string),
            image_url: image_url.map(ToString::to_string),
        });

        let dropped = evict_oldest(
            &mut record.messages,
            self.options.token_budget,
            self.options.min_messages,
        );
        if dropped > 0 {
            info!(user_id, dropped, "Evicted old messages from history");
        }

        self.save(user_id, &record).await
    }

    /// Current settings, `None` when unset or no record exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read or parsed.
    pub async fn get_settings(&self, user_id: i64) -> Result<Option<String>, StorageError> {
        let _guard = self.locks.lock(user_id).await;
        Ok(self.load(user_id).await?.and_then(|r| r.settings))
    }

    /// Replace the settings, creating the record if needed. History is untouched.
    ///
    /// # Errors
    ///
    /// Returns an I/O or JSON error.
    pub async fn set_settings(&self, user_id: i64, settings: &str) -> Result<(), StorageError> {
        self.modify(user_id, true, |record| {
            record.settings = Some(settings.to_string());
        })
        .await
    }

    /// Clear the settings. History is untouched; no-op without a record.
    ///
    /// # Errors
    ///
    /// Returns an I/O or JSON error.
    pub async fn drop_settings(&self, user_id: i64) -> Result<(), StorageError> {
        self.modify(user_id, false, |record| record.settings = None)
            .await
    }

    /// Clear the history. Settings are untouched; no-op without a record.
    ///
    /// # Errors
    ///
    /// Returns an I/O or JSON error.
    pub async fn drop_history(&self, user_id: i64) -> Result<(), StorageError> {
        self.modify(user_id, false, |record| record.messages.clear())
            .await
    }

    async fn modify<F>(&self, user_id: i64, create: bool, modifier: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut ConversationRecord),
    {
        let _guard = self.locks.lock(user_id).await;
        let record = match self.load(user_id).await? {
            Some(record) => Some(record),
            None if create => Some(ConversationRecord::default()),
            None => None,
        };
        if let Some(mut record) = record {
            modifier(&mut record);
            self.save(user_id, &record).await?;
        }
        Ok(())
    }

    async fn load(&self, user_id: i64) -> Result<Option<ConversationRecord>, StorageError> {
        match tokio::fs::read(self.record_path(user_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, user_id: i64, record: &ConversationRecord) -> Result<(), StorageError> {
        let body = serde_json::to_string_pretty(record)?;
        tokio::fs::create_dir_all(&self.data_dir).await?;

        let path = self.record_path(user_id);
        let tmp = tmp_path(&path);
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn text_message(role: Role, text: &str) -> StoredMessage {
        StoredMessage {
            role,
            text: Some(text.to_string()),
            image_url: None,
        }
    }

    fn store(dir: &Path) -> ContextStore {
        ContextStore::new(dir, StoreOptions::default())
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(&text_message(Role::User, "abcdefg")), 1);
        let with_image = StoredMessage {
            role: Role::User,
            text: Some("абвгдеёж".to_string()),
            image_url: Some("https://x/1.jpg".to_string()),
        };
        assert_eq!(estimate_tokens(&with_image), 2 + IMAGE_TOKEN_SURCHARGE);
    }

    #[test]
    fn test_eviction_keeps_minimum() {
        let big = "x".repeat(4000);
        let mut messages: Vec<StoredMessage> =
            (0..5).map(|_| text_message(Role::User, &big)).collect();
        let dropped = evict_oldest(&mut messages, 1024, 3);
        assert_eq!(dropped, 2);
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn test_record_defaults_and_unknown_fields() -> Result<(), serde_json::Error> {
        let record: ConversationRecord =
            serde_json::from_str(r#"{"messages": [{"role": "user", "text": "hi"}], "extra": 1}"#)?;
        assert_eq!(record.settings, None);
        assert_eq!(record.messages[0].image_url, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_history_round_trip() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());

        store.add_to_history(1, Role::User, Some("hello"), None).await?;
        store
            .add_to_history(1, Role::Assistant, Some("hi there"), None)
            .await?;

        let context = store.get_full_context(1).await?;
        assert_eq!(context.len(), 3);
        assert_eq!(context[0].role, Role::System);
        assert_eq!(context[0].text().as_deref(), Some(DEFAULT_INSTRUCTION));
        assert_eq!(context[1].text().as_deref(), Some("hello"));
        assert_eq!(context[2].role, Role::Assistant);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_record_gives_system_only() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());
        assert_eq!(store.get_full_context(7).await?.len(), 1);
        assert_eq!(store.get_settings(7).await?, None);
        store.drop_history(7).await?;
        store.drop_settings(7).await?;
        assert!(!store.record_path(7).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_settings_do_not_touch_history() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());
        store.add_to_history(2, Role::User, Some("q"), None).await?;

        store.set_settings(2, "Call me Sam.").await?;
        store.set_settings(2, "Call me Sam.").await?;
        assert_eq!(store.get_settings(2).await?.as_deref(), Some("Call me Sam."));

        let context = store.get_full_context(2).await?;
        assert_eq!(
            context[0].text(),
            Some(format!("{DEFAULT_INSTRUCTION}Call me Sam."))
        );
        assert_eq!(context.len(), 2);

        store.drop_settings(2).await?;
        store.drop_settings(2).await?;
        assert_eq!(store.get_settings(2).await?, None);
        assert_eq!(store.get_full_context(2).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_drop_history_keeps_settings() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());
        store.set_settings(3, "short answers").await?;
        store.add_to_history(3, Role::User, None, Some("https://x/p.jpg")).await?;

        store.drop_history(3).await?;
        assert_eq!(store.get_full_context(3).await?.len(), 1);
        assert_eq!(store.get_settings(3).await?.as_deref(), Some("short answers"));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_message_rejected() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());
        let res = store.add_to_history(4, Role::User, Some(""), None).await;
        assert!(matches!(res, Err(StorageError::EmptyMessage(Role::User))));
        assert!(!store.record_path(4).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_record_is_readable_json() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());
        store.add_to_history(5, Role::User, Some("привет"), None).await?;

        let raw = std::fs::read_to_string(store.record_path(5))?;
        assert!(raw.contains("привет"));
        assert!(raw.contains("\"settings\": null"));
        assert!(!tmp_path(&store.record_path(5)).exists());
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_eviction_bounds(
            lengths in proptest::collection::vec(0usize..3000, 0..20),
            budget in 0usize..4000,
            min in 0usize..5,
        ) {
            let mut messages: Vec<StoredMessage> = lengths
                .iter()
                .map(|&n| text_message(Role::User, &"y".repeat(n)))
                .collect();
            let before = messages.len();
            let last = messages.last().cloned();
            let dropped = evict_oldest(&mut messages, budget, min);

            prop_assert_eq!(messages.len(), before - dropped);
            prop_assert!(messages.len() >= min.min(before));
            prop_assert!(history_tokens(&messages) <= budget || messages.len() <= min);
            if dropped > 0 {
                // the last dropped message was still needed to get under budget
                let previous: usize = lengths[dropped - 1..].iter().map(|n| n / 4).sum();
                prop_assert!(previous > budget);
            }
            prop_assert_eq!(messages.last().cloned(), last);
        }
    }
}
