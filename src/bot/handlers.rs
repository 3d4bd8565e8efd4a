use crate::bot::messaging::{options_keyboard, send_answer, send_message_resilient};
use crate::bot::state::{BotDialogue, State};
use crate::chat::{Answer, ChatEngine};
use crate::config::Settings;
use crate::functions::Action;
use crate::llm::{Message as LlmMessage, Role};
use crate::log_sink::LogSink;
use crate::storage::ContextStore;
use crate::utils::escape_characters;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use teloxide::{
    prelude::*,
    types::{ChatAction, ParseMode, ReplyMarkup},
    utils::command::BotCommands,
};
use tracing::{info, warn};

/// Prompt sent to the model on `/start`
pub const GREETING_PROMPT: &str = "Hi";
/// Shown when the model could not answer
pub const APOLOGY: &str = "An unknown error occurred, please try again later.";
const SETTINGS_PROMPT: &str = "Send the new settings (for example: Answer only in English)";

/// Supported commands:
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "snake_case")]
pub enum Command {
    /// Start the conversation.
    Start,
    /// Clear the chat history.
    DropHistory,
    /// Show the current settings.
    Settings,
    /// Change the settings.
    SetSettings,
    /// Clear the settings.
    DropSettings,
}

/// Safely extract user ID from a message, 0 when it has no sender
#[must_use]
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

fn get_user_name(msg: &Message) -> String {
    msg.from
        .as_ref()
        .map_or_else(|| "Unknown".to_string(), |u| u.first_name.clone())
}

/// Text shown to the user for an answer, also stored as the assistant turn
#[must_use]
pub fn answer_text(answer: &Answer) -> String {
    match answer {
        Answer::Text(text) => text.clone(),
        Answer::Data(value) => {
            let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
            format!("```json\n{pretty}\n```")
        }
        Answer::Action(Action::Clarify { question, .. }) => question.clone(),
        Answer::Action(Action::Memory { memory: Some(_) }) => {
            "Got it, I will remember that.".to_string()
        }
        Answer::Action(Action::Memory { memory: None }) => {
            "Done, I forgot everything about you.".to_string()
        }
    }
}

/// Text shown by `/settings`
#[must_use]
pub fn settings_text(settings: Option<&str>) -> String {
    let body = settings.map_or_else(|| "None".to_string(), |s| escape_characters(s, "`\\"));
    format!("Current settings:\n```text\n{body}\n```")
}

/// Apply the side effect of an action and return the keyboard to show with it
async fn apply_action(
    action: &Action,
    user_id: i64,
    store: &ContextStore,
) -> Result<Option<ReplyMarkup>> {
    match action {
        Action::Clarify { options, .. } if !options.is_empty() => {
            Ok(Some(ReplyMarkup::Keyboard(options_keyboard(options))))
        }
        Action::Clarify { .. } => Ok(None),
        Action::Memory { memory: Some(memory) } => {
            info!(user_id, "Model updated user memory");
            store.set_settings(user_id, memory).await?;
            Ok(None)
        }
        Action::Memory { memory: None } => {
            info!(user_id, "Model cleared user memory");
            store.drop_settings(user_id).await?;
            Ok(None)
        }
    }
}

/// Run the engine over the context and deliver whatever it produced.
///
/// Returns the text to store as the assistant turn. A failed delivery is
/// reported to the sink and does not prevent the turn from being stored.
async fn answer_and_render(
    bot: &Bot,
    chat_id: ChatId,
    user_id: i64,
    context: &[LlmMessage],
    engine: &ChatEngine,
    store: &ContextStore,
    sink: &dyn LogSink,
) -> Result<String> {
    let answer = match engine.generate_answer(context).await {
        Ok(answer) => answer,
        Err(e) => {
            sink.err(&e, &format!("Failed to answer user {user_id}")).await;
            send_message_resilient(bot, chat_id, APOLOGY, None).await?;
            return Ok(APOLOGY.to_string());
        }
    };

    let markup = match &answer {
        Answer::Action(action) => apply_action(action, user_id, store).await?,
        Answer::Text(_) | Answer::Data(_) => None,
    };
    let text = answer_text(&answer);
    if let Err(e) = send_answer(bot, chat_id, &text, markup, sink).await {
        warn!(user_id, error = %e, "Answer was not delivered");
        sink.err(&*e, &format!("Failed to deliver answer to user {user_id}")).await;
    }
    Ok(text)
}

/// Greet the user through the model
///
/// # Errors
///
/// Returns an error if the reply cannot be sent or the history cannot be saved.
pub async fn start(
    bot: Bot,
    msg: Message,
    engine: Arc<ChatEngine>,
    store: Arc<ContextStore>,
    sink: Arc<dyn LogSink>,
    dialogue: BotDialogue,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    dialogue
        .update(State::Start)
        .await
        .map_err(|e| anyhow!(e.to_string()))?;

    let context = [LlmMessage::user(GREETING_PROMPT)];
    let reply =
        answer_and_render(&bot, msg.chat.id, user_id, &context, &engine, &store, &*sink).await?;

    store
        .add_to_history(user_id, Role::User, Some(GREETING_PROMPT), None)
        .await?;
    store
        .add_to_history(user_id, Role::Assistant, Some(&reply), None)
        .await?;
    Ok(())
}

/// `/drop_history`
///
/// # Errors
///
/// Returns an error if the record cannot be updated or the reply cannot be sent.
pub async fn drop_history(bot: Bot, msg: Message, store: Arc<ContextStore>) -> Result<()> {
    store.drop_history(get_user_id_safe(&msg)).await?;
    send_message_resilient(&bot, msg.chat.id, "History cleared", None).await?;
    Ok(())
}

/// `/settings`
///
/// # Errors
///
/// Returns an error if the record cannot be read or the reply cannot be sent.
pub async fn show_settings(bot: Bot, msg: Message, store: Arc<ContextStore>) -> Result<()> {
    let settings = store.get_settings(get_user_id_safe(&msg)).await?;
    bot.send_message(msg.chat.id, settings_text(settings.as_deref()))
        .parse_mode(ParseMode::MarkdownV2)
        .await?;
    Ok(())
}

/// `/set_settings`: wait for the next text message
///
/// # Errors
///
/// Returns an error if the dialogue cannot be updated or the reply cannot be sent.
pub async fn set_settings(bot: Bot, msg: Message, dialogue: BotDialogue) -> Result<()> {
    dialogue
        .update(State::WaitingForSettings)
        .await
        .map_err(|e| anyhow!(e.to_string()))?;
    send_message_resilient(&bot, msg.chat.id, SETTINGS_PROMPT, None).await?;
    Ok(())
}

/// `/drop_settings`
///
/// # Errors
///
/// Returns an error if the record cannot be updated or the reply cannot be sent.
pub async fn drop_settings(bot: Bot, msg: Message, store: Arc<ContextStore>) -> Result<()> {
    store.drop_settings(get_user_id_safe(&msg)).await?;
    send_message_resilient(&bot, msg.chat.id, "Settings cleared", None).await?;
    Ok(())
}

/// Message received while waiting for new settings
///
/// # Errors
///
/// Returns an error if the settings cannot be saved or the reply cannot be sent.
pub async fn handle_waiting_settings(
    bot: Bot,
    msg: Message,
    store: Arc<ContextStore>,
    dialogue: BotDialogue,
) -> Result<()> {
    let Some(text) = msg.text().filter(|t| !t.is_empty()) else {
        send_message_resilient(&bot, msg.chat.id, SETTINGS_PROMPT, None).await?;
        return Ok(());
    };

    store.set_settings(get_user_id_safe(&msg), text).await?;
    dialogue.exit().await.map_err(|e| anyhow!(e.to_string()))?;
    send_message_resilient(&bot, msg.chat.id, "Settings saved", None).await?;
    Ok(())
}

/// Regular text or photo message: answer it with the full context
///
/// # Errors
///
/// Returns an error if Telegram or the context store fail.
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    engine: Arc<ChatEngine>,
    store: Arc<ContextStore>,
    settings: Arc<Settings>,
    sink: Arc<dyn LogSink>,
) -> Result<()> {
    if msg.from.as_ref().is_some_and(|u| u.is_bot) {
        return Ok(());
    }
    let photo = msg.photo().and_then(|sizes| sizes.last());
    let text = msg.text().or_else(|| msg.caption());
    if text.is_none() && photo.is_none() {
        return Ok(());
    }

    let user_id = get_user_id_safe(&msg);
    info!(
        user_id,
        user_name = %get_user_name(&msg),
        text_len = text.map_or(0, str::len),
        has_photo = photo.is_some(),
        "Incoming message"
    );

    bot.send_chat_action(msg.chat.id, ChatAction::Typing).await?;

    let file_url = match photo {
        Some(photo) => {
            let file = bot.get_file(photo.file.id.clone()).await?;
            Some(format!(
                "https://api.telegram.org/file/bot{}/{}",
                settings.telegram_token, file.path
            ))
        }
        None => None,
    };

    let mut context = store.get_full_context(user_id).await?;
    context.push(LlmMessage::pack(text, &[file_url.as_deref()], Role::User));

    let reply =
        answer_and_render(&bot, msg.chat.id, user_id, &context, &engine, &store, &*sink).await?;

    store
        .add_to_history(user_id, Role::User, text, file_url.as_deref())
        .await?;
    store
        .add_to_history(user_id, Role::Assistant, Some(&reply), None)
        .await?;
    Ok(())
}
