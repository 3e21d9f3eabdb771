use ai_models_bot::bot::handlers::{self, get_user_id_safe, Command};
use ai_models_bot::config::{get_debug_mode, Settings};
use ai_models_bot::conversation::ConversationManager;
use ai_models_bot::llm::LlmClient;
use ai_models_bot::storage::JsonFileStorage;
use dotenvy::dotenv;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::utils::command::BotCommands;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Secrets masked in every log line
struct RedactionPatterns {
    rules: Vec<(Regex, &'static str)>,
}

impl RedactionPatterns {
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        const RULES: &[(&str, &str)] = &[
            // Telegram bot token inside API URLs
            (r"(/bot)[0-9]{6,12}:[A-Za-z0-9_-]{30,}", "$1[TELEGRAM_TOKEN]"),
            (r"\b[0-9]{8,10}:[A-Za-z0-9_-]{35}\b", "[TELEGRAM_TOKEN]"),
            // OpenAI / Anthropic / DeepSeek
            (r"\bsk-[A-Za-z0-9_-]{16,}", "[API_KEY]"),
            // xAI
            (r"\bxai-[A-Za-z0-9_-]{16,}", "[API_KEY]"),
            // Google
            (r"\bAIza[0-9A-Za-z_-]{35}", "[API_KEY]"),
            (r"([?&]key=)[^&\s'\x22]+", "$1[API_KEY]"),
            (r"(?i)(bearer\s+)[A-Za-z0-9._-]{16,}", "$1[API_KEY]"),
        ];

        let rules = RULES
            .iter()
            .map(|(pattern, replacement)| Ok((Regex::new(pattern)?, *replacement)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    fn redact(&self, input: &str) -> String {
        self.rules
            .iter()
            .fold(input.to_string(), |text, (re, replacement)| {
                re.replace_all(&text, *replacement).into_owned()
            })
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let redacted = self.patterns.redact(&String::from_utf8_lossy(buf));
        self.inner.write_all(redacted.as_bytes())?;
        // Report the caller's length; the redacted text may differ in size
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: (self.make_inner)(),
            patterns: self.patterns.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);
    init_logging(patterns);

    info!("Starting AI models bot...");

    let settings = init_settings();
    let storage = init_storage(&settings).await;

    let shutdown = CancellationToken::new();
    let flush_task = storage.clone().spawn_flush_task(
        Duration::from_secs(settings.state_flush_interval_secs.max(1)),
        shutdown.clone(),
    );

    let llm_client = Arc::new(LlmClient::new(&settings));
    let available = llm_client.available_models();
    if available.is_empty() {
        warn!("No provider API keys configured; every model will be unavailable.");
    } else {
        info!(models = ?available, "LLM client initialized.");
    }

    let manager = Arc::new(ConversationManager::from_settings(
        &settings,
        storage.clone(),
        llm_client,
    ));

    let bot = Bot::new(settings.telegram_token.clone());
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!(error = %e, "Failed to register bot commands");
    }

    info!("Bot is running...");

    Dispatcher::builder(bot, setup_handler())
        .dependencies(dptree::deps![manager, settings])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Dispatcher stopped, saving user state...");
    shutdown.cancel();
    if let Err(e) = flush_task.await {
        error!("State flush task failed: {}", e);
    }

    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let default_filter = if get_debug_mode() {
        "ai_models_bot=debug,teloxide=info,reqwest=info,hyper=warn"
    } else {
        "ai_models_bot=info,teloxide=warn,reqwest=warn,hyper=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let make_writer = RedactingMakeWriter {
        make_inner: io::stderr,
        patterns,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!(
                allowed_users = s.allowed_users().len(),
                state_file = %s.state_file,
                "Configuration loaded successfully."
            );
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

async fn init_storage(settings: &Settings) -> Arc<JsonFileStorage> {
    match JsonFileStorage::open(&settings.state_file).await {
        Ok(s) => {
            info!(users = s.user_count().await, "User state storage initialized.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to open user state storage: {}", e);
            std::process::exit(1);
        }
    }
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(
            Update::filter_callback_query()
                .branch(
                    dptree::filter(|q: CallbackQuery, settings: Arc<Settings>| {
                        settings.is_user_allowed(q.from.id.0.cast_signed())
                    })
                    .endpoint(handle_callback),
                )
                .branch(dptree::endpoint(|q: CallbackQuery| async move {
                    handlers::log_unauthorized(q.from.id.0.cast_signed(), &q.from.first_name);
                    respond(())
                })),
        )
        .branch(
            Update::filter_message()
                .branch(
                    dptree::filter(|msg: Message, settings: Arc<Settings>| {
                        settings.is_user_allowed(get_user_id_safe(&msg))
                    })
                    .branch(
                        dptree::entry()
                            .filter_command::<Command>()
                            .endpoint(handle_command),
                    )
                    .branch(
                        dptree::filter(|msg: Message| {
                            msg.text().is_some_and(|t| !t.starts_with('/'))
                        })
                        .endpoint(handle_text),
                    )
                    .branch(
                        dptree::filter(|msg: Message| msg.text().is_some())
                            .endpoint(handle_unknown_command),
                    )
                    .branch(
                        dptree::filter(|msg: Message| msg.photo().is_some())
                            .endpoint(handle_photo),
                    )
                    .branch(dptree::endpoint(handle_other)),
                )
                .branch(dptree::endpoint(handle_unauthorized)),
        )
}

async fn handle_unauthorized(msg: Message) -> Result<(), teloxide::RequestError> {
    let user_name = msg
        .from
        .as_ref()
        .map_or_else(|| "Unknown".to_string(), |u| u.first_name.clone());
    handlers::log_unauthorized(get_user_id_safe(&msg), &user_name);
    respond(())
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    manager: Arc<ConversationManager>,
) -> Result<(), teloxide::RequestError> {
    let res = match cmd {
        Command::Start => handlers::start(bot, msg, manager).await,
        Command::Help => handlers::help(bot, msg).await,
        Command::Model => handlers::choose_model(bot, msg).await,
        Command::Clear => handlers::clear(bot, msg, manager).await,
        Command::Reset => handlers::reset(bot, msg, manager).await,
        Command::Status => handlers::status(bot, msg, manager).await,
    };
    if let Err(e) = res {
        error!("Command error: {}", e);
    }
    respond(())
}

async fn handle_unknown_command(bot: Bot, msg: Message) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::help(bot, msg).await {
        error!("Help handler error: {}", e);
    }
    respond(())
}

async fn handle_text(
    bot: Bot,
    msg: Message,
    manager: Arc<ConversationManager>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = Box::pin(handlers::handle_text(bot, msg, manager)).await {
        error!("Text handler error: {}", e);
    }
    respond(())
}

async fn handle_photo(
    bot: Bot,
    msg: Message,
    manager: Arc<ConversationManager>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = Box::pin(handlers::handle_photo(bot, msg, manager)).await {
        error!("Photo handler error: {}", e);
    }
    respond(())
}

async fn handle_other(bot: Bot, msg: Message) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_other(bot, msg).await {
        error!("Fallback handler error: {}", e);
    }
    respond(())
}

async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    manager: Arc<ConversationManager>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_callback(bot, q, manager).await {
        error!("Callback handler error: {}", e);
    }
    respond(())
}
