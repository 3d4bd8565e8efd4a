use futures_util::future::join_all;
use gpt_bridge::llm::Role;
use gpt_bridge::storage::{ContextStore, ConversationRecord, StoreOptions};
use std::sync::Arc;

fn roomy_options() -> StoreOptions {
    StoreOptions {
        token_budget: usize::MAX,
        ..StoreOptions::default()
    }
}

#[tokio::test]
async fn test_concurrent_appends_are_not_lost() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(ContextStore::new(dir.path(), roomy_options()));

    let tasks = (0..100).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .add_to_history(42, Role::User, Some(&format!("message {i}")), None)
                .await
        })
    });
    for result in join_all(tasks).await {
        result.expect("task panicked").expect("append failed");
    }

    let raw = tokio::fs::read_to_string(store.record_path(42))
        .await
        .expect("record exists");
    let record: ConversationRecord = serde_json::from_str(&raw).expect("valid record");
    assert_eq!(record.messages.len(), 100);

    let context = store.get_full_context(42).await.expect("context");
    assert_eq!(context.len(), 101);
}

#[tokio::test]
async fn test_users_are_isolated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ContextStore::new(dir.path(), StoreOptions::default());

    store
        .add_to_history(1, Role::User, Some("from one"), None)
        .await
        .expect("append");
    store.set_settings(2, "two's settings").await.expect("settings");

    assert_eq!(store.get_full_context(1).await.expect("context").len(), 2);
    assert_eq!(store.get_full_context(2).await.expect("context").len(), 1);
    assert_eq!(store.get_settings(1).await.expect("settings"), None);
}

#[tokio::test]
async fn test_photo_turn_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ContextStore::new(dir.path(), StoreOptions::default());

    store
        .add_to_history(5, Role::User, Some("what is this?"), Some("https://x/cat.jpg"))
        .await
        .expect("append");
    store
        .add_to_history(5, Role::Assistant, Some("A cat."), None)
        .await
        .expect("append");

    let context = store.get_full_context(5).await.expect("context");
    assert_eq!(context[1].role, Role::User);
    assert_eq!(context[1].text().as_deref(), Some("what is this?"));
    assert_eq!(context[1].image_urls(), vec!["https://x/cat.jpg"]);
    assert_eq!(context[2].text().as_deref(), Some("A cat."));
    assert!(context[2].image_urls().is_empty());
}

#[tokio::test]
async fn test_long_history_is_trimmed_oldest_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ContextStore::new(dir.path(), StoreOptions::default());
    let long = "word ".repeat(400);

    for i in 0..6 {
        store
            .add_to_history(9, Role::User, Some(&format!("{i}: {long}")), None)
            .await
            .expect("append");
    }

    let context = store.get_full_context(9).await.expect("context");
    // each message is ~500 estimated tokens, so only the minimum of 3 fits
    assert_eq!(context.len(), 4);
    assert!(context[1]
        .text()
        .is_some_and(|t| t.starts_with("3: ")));
    assert!(context[3]
        .text()
        .is_some_and(|t| t.starts_with("5: ")));
}

#[tokio::test]
async fn test_corrupt_record_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ContextStore::new(dir.path(), StoreOptions::default());
    tokio::fs::write(store.record_path(3), "not json")
        .await
        .expect("write");

    assert!(store.get_full_context(3).await.is_err());
}
