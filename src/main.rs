use dotenvy::dotenv;
use gpt_bridge::bot::handlers::{self, get_user_id_safe, Command};
use gpt_bridge::bot::state::{BotDialogue, State};
use gpt_bridge::chat::{ChatEngine, EngineOptions};
use gpt_bridge::config::Settings;
use gpt_bridge::functions::{builtin, FunctionRegistry};
use gpt_bridge::llm::OpenAiProvider;
use gpt_bridge::log_sink::{LogSink, TelegramLogSink, TracingLogSink};
use gpt_bridge::storage::ContextStore;
use lazy_regex::regex_replace_all;
use std::io::{self, Write};
use std::sync::Arc;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Hide Telegram bot tokens and OpenAI keys in a log line
fn mask_secrets(line: &str) -> String {
    let line = regex_replace_all!(
        r"\b(bot)?[0-9]{8,10}:[A-Za-z0-9_-]{30,}",
        line,
        |_, bot| format!("{bot}[TELEGRAM_TOKEN]")
    );
    regex_replace_all!(r"sk-[A-Za-z0-9_-]{16,}", &line, "sk-[MASKED]").into_owned()
}

/// Stderr sink for tracing that masks secrets on the way out
#[derive(Clone, Copy)]
struct MaskedStderr;

impl Write for MaskedStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        io::stderr().write_all(mask_secrets(&line).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    init_logging();

    info!("Starting GPT Bridge bot...");

    let settings = init_settings();
    let sink = init_log_sink(&settings);
    let registry = init_registry()?;

    let provider = Arc::new(OpenAiProvider::new(
        settings.openai_api_key.clone(),
        settings.openai_api_base.clone(),
    ));
    let engine = Arc::new(ChatEngine::new(
        provider,
        registry,
        EngineOptions::from(settings.as_ref()),
    ));
    info!(model = %settings.model, "Chat engine initialized.");

    let store = Arc::new(ContextStore::from_settings(&settings));
    info!(data_dir = %settings.data_dir.display(), "Context store initialized.");

    let bot = Bot::new(settings.telegram_token.clone());
    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![
            engine,
            store,
            settings,
            sink.clone(),
            InMemStorage::<State>::new()
        ])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    sink.flush().await;
    info!("Bot stopped.");
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(|| MaskedStderr))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_log_sink(settings: &Settings) -> Arc<dyn LogSink> {
    match (&settings.logger_token, settings.logger_chat_id) {
        (Some(token), Some(chat_id)) => {
            info!(chat_id, name = %settings.logger_name, "Operator log channel enabled.");
            Arc::new(TelegramLogSink::new(
                token.clone(),
                chat_id,
                settings.logger_name.clone(),
            ))
        }
        _ => {
            warn!("LOGGER_TOKEN or LOGGER_CHAT_ID not set, operator logs go to tracing only.");
            Arc::new(TracingLogSink)
        }
    }
}

fn init_registry() -> Result<Arc<FunctionRegistry>, gpt_bridge::functions::FunctionError> {
    let mut registry = FunctionRegistry::new();
    builtin::register_defaults(&mut registry)?;
    info!(functions = registry.len(), "Function registry initialized.");
    Ok(Arc::new(registry))
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry().branch(
        Update::filter_message()
            .branch(
                dptree::filter(|msg: Message, settings: Arc<Settings>| {
                    settings.is_allowed(get_user_id_safe(&msg))
                })
                .enter_dialogue::<Message, InMemStorage<State>, State>()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(handle_command),
                )
                .branch(dptree::case![State::WaitingForSettings].endpoint(handle_waiting_settings))
                .branch(dptree::case![State::Start].endpoint(handle_message)),
            )
            // Everyone the filter above rejected
            .branch(dptree::endpoint(handle_unauthorized)),
    )
}

async fn handle_unauthorized(bot: Bot, msg: Message) -> Result<(), teloxide::RequestError> {
    let user_id = get_user_id_safe(&msg);
    info!(user_id, "⛔️ Unauthorized access. Sending denial message.");

    if let Err(e) = bot.send_message(msg.chat.id, "⛔️ Access denied").await {
        error!("Failed to send access denied message to {}: {}", user_id, e);
    }
    respond(())
}

async fn report(sink: &dyn LogSink, context: &str, e: &anyhow::Error) {
    error!("{context}: {e:#}");
    sink.err(&**e, context).await;
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    engine: Arc<ChatEngine>,
    store: Arc<ContextStore>,
    sink: Arc<dyn LogSink>,
    dialogue: BotDialogue,
) -> Result<(), teloxide::RequestError> {
    let res = match cmd {
        Command::Start => {
            handlers::start(bot, msg, engine, store, sink.clone(), dialogue).await
        }
        Command::DropHistory => handlers::drop_history(bot, msg, store).await,
        Command::Settings => handlers::show_settings(bot, msg, store).await,
        Command::SetSettings => handlers::set_settings(bot, msg, dialogue).await,
        Command::DropSettings => handlers::drop_settings(bot, msg, store).await,
    };
    if let Err(e) = res {
        report(&*sink, "Command error", &e).await;
    }
    respond(())
}

async fn handle_waiting_settings(
    bot: Bot,
    msg: Message,
    store: Arc<ContextStore>,
    sink: Arc<dyn LogSink>,
    dialogue: BotDialogue,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_waiting_settings(bot, msg, store, dialogue).await {
        report(&*sink, "Settings handler error", &e).await;
    }
    respond(())
}

async fn handle_message(
    bot: Bot,
    msg: Message,
    engine: Arc<ChatEngine>,
    store: Arc<ContextStore>,
    settings: Arc<Settings>,
    sink: Arc<dyn LogSink>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = Box::pin(handlers::handle_message(
        bot,
        msg,
        engine,
        store,
        settings,
        sink.clone(),
    ))
    .await
    {
        report(&*sink, "Message handler error", &e).await;
    }
    respond(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_bot_tokens() {
        let token = format!("123456789:{}", "A".repeat(35));

        let url = format!("https://api.telegram.org/file/bot{token}/photos/1.jpg");
        assert_eq!(
            mask_secrets(&url),
            "https://api.telegram.org/file/bot[TELEGRAM_TOKEN]/photos/1.jpg"
        );
        assert_eq!(mask_secrets(&format!("token={token}")), "token=[TELEGRAM_TOKEN]");
    }

    #[test]
    fn test_masks_api_keys() {
        assert_eq!(
            mask_secrets("key=sk-abcdefghijklmnopqrstuvwxyz"),
            "key=sk-[MASKED]"
        );
        assert_eq!(mask_secrets("chat 123456789: hello"), "chat 123456789: hello");
    }
}
