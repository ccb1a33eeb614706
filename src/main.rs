use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{BotCommand, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use gptgram::bot::{
    ChatPipeline, CompletionClient, Profile, Store, TelegramClient, Transport, UserInput,
};
use gptgram::config::Config;

const HELP_MESSAGE: &str = "<b>📚 Commands:</b>\n\n\
⚪ /retry – Regenerate the last answer\n\
⚪ /new – Start a new dialog\n\
⚪ /cancel – Cancel the current generation\n\
⚪ /mode – Select a chat mode\n\
⚪ /settings – Show settings\n\
⚪ /balance – Show balance\n\
⚪ /help – Show help\n\n\
<b>🎨 Image generation:</b> switch to the <b>👩‍🎨 Artist</b> mode and describe a picture\n\
<b>🎤 Voice messages:</b> send one and I'll transcribe and answer it";

const START_MESSAGE: &str = "👋 Hi! I'm an AI assistant bot.\n\n\
I can answer questions, help with code, edit text and more.\n\n\
Pick a chat mode below to get started 👇";

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
    Help,
    New,
    Cancel,
    Retry,
    Mode,
    Settings,
    Balance,
}

struct BotState {
    config: Arc<Config>,
    store: Arc<Store>,
    client: Arc<CompletionClient>,
    telegram: Arc<TelegramClient>,
    pipeline: ChatPipeline,
}

impl BotState {
    fn new(config: Config, bot: &Bot) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(Store::load_or_new(&config.data_dir.join("gptgram.db")));
        let client = Arc::new(CompletionClient::new(
            config.openai_api_key.clone(),
            config.openai_api_base.clone(),
        ));
        let telegram = Arc::new(TelegramClient::new(bot.clone()));

        let pipeline = ChatPipeline::new(
            config.clone(),
            store.clone(),
            client.clone(),
            telegram.clone() as Arc<dyn Transport>,
        );

        Self {
            config,
            store,
            client,
            telegram,
            pipeline,
        }
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "gptgram.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    // Setup logging: stdout plus a non-blocking file appender
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("gptgram.log"))
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting gptgram...");
    info!("Loaded config from {config_path}");

    let bot = Bot::new(&config.telegram_bot_token);
    let state = Arc::new(BotState::new(config, &bot));

    if let Err(e) = set_commands(&bot).await {
        warn!("Failed to register bot commands: {e}");
    }

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn set_commands(bot: &Bot) -> ResponseResult<()> {
    bot.set_my_commands(vec![
        BotCommand::new("new", "Start a new dialog"),
        BotCommand::new("mode", "Select a chat mode"),
        BotCommand::new("retry", "Regenerate the last answer"),
        BotCommand::new("cancel", "Cancel the current generation"),
        BotCommand::new("settings", "Show settings"),
        BotCommand::new("balance", "Show balance"),
        BotCommand::new("help", "Show help"),
    ])
    .await?;
    Ok(())
}

fn profile_from(user: &teloxide::types::User, chat_id: ChatId) -> Profile {
    Profile {
        user_id: user.id.0 as i64,
        chat_id: chat_id.0,
        username: user.username.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
    }
}

/// Escape user-derived text for inclusion in HTML-formatted messages.
fn html_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            _ => result.push(c),
        }
    }
    result
}

// ==========================================
// COMMAND HANDLERS
// ==========================================

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: Arc<BotState>,
) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    let profile = profile_from(&user, msg.chat.id);

    if let Err(e) = state.pipeline.ensure_registered(&profile) {
        error!("Failed to register user {}: {e}", profile.user_id);
        return Ok(());
    }

    match cmd {
        Command::Start => {
            if let Err(e) = state.store.start_new_dialog(profile.user_id) {
                error!("Failed to start dialog: {e}");
            }
            bot.send_message(msg.chat.id, START_MESSAGE).await?;
            show_chat_modes(&bot, msg.chat.id, &state, 0).await?;
        }
        Command::Help => {
            bot.send_message(msg.chat.id, HELP_MESSAGE)
                .parse_mode(ParseMode::Html)
                .await?;
        }
        Command::New => {
            if state.pipeline.is_busy(profile.user_id) {
                bot.send_message(
                    msg.chat.id,
                    "⏳ Please wait for a reply to the previous message, or send /cancel",
                )
                .await?;
                return Ok(());
            }
            match state.store.start_new_dialog(profile.user_id) {
                Ok(_) => {
                    bot.send_message(msg.chat.id, "✅ New dialog started").await?;
                    if let Ok(record) = state.store.get_user(profile.user_id)
                        && let Some(mode) =
                            state.config.registry.chat_mode(&record.current_chat_mode)
                    {
                        bot.send_message(msg.chat.id, &mode.welcome_message)
                            .parse_mode(ParseMode::Html)
                            .await?;
                    }
                }
                Err(e) => {
                    error!("Failed to start dialog: {e}");
                    bot.send_message(msg.chat.id, "❌ Something went wrong").await?;
                }
            }
        }
        Command::Cancel => {
            // The cancelled task itself reports "Canceled" on termination
            if !state.pipeline.cancel(profile.user_id).await {
                bot.send_message(msg.chat.id, "❌ Nothing to cancel 🤷‍♂️").await?;
            }
        }
        Command::Retry => {
            state.pipeline.retry_last(&profile).await;
        }
        Command::Mode => {
            show_chat_modes(&bot, msg.chat.id, &state, 0).await?;
        }
        Command::Settings => {
            match settings_menu(&state, profile.user_id) {
                Ok((text, markup)) => {
                    bot.send_message(msg.chat.id, text)
                        .parse_mode(ParseMode::Html)
                        .reply_markup(markup)
                        .await?;
                }
                Err(e) => error!("Failed to render settings: {e}"),
            }
        }
        Command::Balance => {
            match balance_text(&state, profile.user_id) {
                Ok(text) => {
                    bot.send_message(msg.chat.id, text)
                        .parse_mode(ParseMode::Html)
                        .await?;
                }
                Err(e) => error!("Failed to render balance: {e}"),
            }
        }
    }

    Ok(())
}

// ==========================================
// MENUS
// ==========================================

fn chat_mode_menu(state: &BotState, page: usize) -> (String, InlineKeyboardMarkup) {
    let registry = &state.config.registry;
    let per_page = state.config.n_chat_modes_per_page;
    let text = format!(
        "<b>🎭 Select a chat mode</b> ({} modes available):",
        registry.n_chat_modes()
    );

    let keys: Vec<&str> = registry.chat_mode_keys().collect();
    let mut keyboard: Vec<Vec<InlineKeyboardButton>> = keys
        .iter()
        .skip(page * per_page)
        .take(per_page)
        .filter_map(|key| {
            registry.chat_mode(key).map(|mode| {
                vec![InlineKeyboardButton::callback(
                    mode.name.clone(),
                    format!("mode:{key}"),
                )]
            })
        })
        .collect();

    if keys.len() > per_page {
        let is_first = page == 0;
        let is_last = (page + 1) * per_page >= keys.len();
        let mut nav = Vec::new();
        if !is_first {
            nav.push(InlineKeyboardButton::callback("⬅️", format!("modes:{}", page - 1)));
        }
        if !is_last {
            nav.push(InlineKeyboardButton::callback("➡️", format!("modes:{}", page + 1)));
        }
        if !nav.is_empty() {
            keyboard.push(nav);
        }
    }

    (text, InlineKeyboardMarkup::new(keyboard))
}

async fn show_chat_modes(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    page: usize,
) -> ResponseResult<()> {
    let (text, markup) = chat_mode_menu(state, page);
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(markup)
        .await?;
    Ok(())
}

fn settings_menu(
    state: &BotState,
    user_id: i64,
) -> Result<(String, InlineKeyboardMarkup), gptgram::bot::StoreError> {
    let registry = &state.config.registry;
    let record = state.store.get_user(user_id)?;

    let mut text = String::from("<b>⚙️ Settings</b>\n\n");
    if let Some(model) = registry.model(&record.current_model) {
        text.push_str(&format!("<b>Current model:</b> {}\n\n", model.name));
        text.push_str(&format!("<i>{}</i>\n\n", model.description));
        for (score_key, score) in &model.scores {
            let score = (*score).min(5);
            text.push_str(&"🟢".repeat(score as usize));
            text.push_str(&"⚪️".repeat(5 - score as usize));
            text.push_str(&format!(" – {score_key}\n"));
        }
    }
    text.push_str("\n<b>Select a model:</b>");

    let buttons: Vec<Vec<InlineKeyboardButton>> = registry
        .available_text_models()
        .iter()
        .filter_map(|key| {
            registry.model(key).map(|model| {
                let mut title = model.name.clone();
                if *key == record.current_model {
                    title = format!("✅ {title}");
                }
                vec![InlineKeyboardButton::callback(title, format!("model:{key}"))]
            })
        })
        .collect();

    Ok((text, InlineKeyboardMarkup::new(buttons)))
}

fn balance_text(state: &BotState, user_id: i64) -> Result<String, gptgram::bot::StoreError> {
    use gptgram::bot::usage::{image_cost_usd, token_cost_usd, transcription_cost_usd};

    let registry = &state.config.registry;
    let record = state.store.get_user(user_id)?;
    let summary = state.store.usage_summary(user_id)?;

    let mut total_spent = 0.0f64;
    let mut total_tokens = 0u64;
    let mut details = String::from("<b>📊 Details:</b>\n");

    for (model_key, usage) in &summary {
        let cost = token_cost_usd(registry, model_key, *usage);
        total_spent += cost;
        total_tokens += usage.total();
        details.push_str(&format!(
            "• {model_key}: <b>${cost:.3}</b> / {} tokens\n",
            usage.total()
        ));
    }

    if record.n_generated_images > 0 {
        let cost = image_cost_usd(registry, record.n_generated_images);
        total_spent += cost;
        details.push_str(&format!(
            "• Images: <b>${cost:.3}</b> / {} generated\n",
            record.n_generated_images
        ));
    }

    if record.n_transcribed_seconds > 0.0 {
        let cost = transcription_cost_usd(registry, record.n_transcribed_seconds);
        total_spent += cost;
        details.push_str(&format!(
            "• Voice: <b>${cost:.3}</b> / {:.0} seconds\n",
            record.n_transcribed_seconds
        ));
    }

    Ok(format!(
        "<b>💰 Balance</b>\n\n<b>Total spent:</b> ${total_spent:.3}\n\
         <b>Total tokens:</b> {total_tokens}\n\n{details}"
    ))
}

// ==========================================
// MESSAGE HANDLERS
// ==========================================

async fn handle_message(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    let profile = profile_from(&user, msg.chat.id);

    if let Some(voice) = msg.voice() {
        handle_voice(&profile, voice, &state).await;
        return Ok(());
    }

    if let Some(photos) = msg.photo() {
        let Some(photo) = photos.last() else {
            return Ok(());
        };
        let caption = msg.caption().unwrap_or("What's in this picture?").to_string();
        match state.telegram.download_file(&photo.file.id.0).await {
            Ok(data) => {
                state
                    .pipeline
                    .handle_message(&profile, UserInput::with_image(caption, data))
                    .await;
            }
            Err(e) => error!("Failed to download photo: {e}"),
        }
        return Ok(());
    }

    let Some(text) = msg.text() else {
        return Ok(());
    };
    if text.starts_with('/') || text.is_empty() {
        return Ok(());
    }

    // Artist mode goes to image generation instead of the chat pipeline
    if let Err(e) = state.pipeline.ensure_registered(&profile) {
        error!("Failed to register user {}: {e}", profile.user_id);
        return Ok(());
    }
    let chat_mode = state
        .store
        .get_user(profile.user_id)
        .map(|r| r.current_chat_mode)
        .unwrap_or_default();
    if chat_mode == "artist" {
        generate_images_flow(&profile, text, &state).await;
        return Ok(());
    }

    state
        .pipeline
        .handle_message(&profile, UserInput::text(text))
        .await;
    Ok(())
}

async fn handle_voice(profile: &Profile, voice: &teloxide::types::Voice, state: &Arc<BotState>) {
    if let Err(e) = state.pipeline.ensure_registered(profile) {
        error!("Failed to register user {}: {e}", profile.user_id);
        return;
    }

    let data = match state.telegram.download_file(&voice.file.id.0).await {
        Ok(data) => data,
        Err(e) => {
            error!("Failed to download voice message: {e}");
            return;
        }
    };

    let transcription = match state.client.transcribe_audio(data, "voice.oga").await {
        Ok(text) if !text.is_empty() => text,
        Ok(_) => {
            state
                .telegram
                .deliver(
                    profile.chat_id,
                    "❌ I couldn't hear anything in that voice message",
                    gptgram::bot::OutputFormat::Plain,
                )
                .await
                .ok();
            return;
        }
        Err(e) => {
            error!("Transcription failed: {e}");
            state
                .telegram
                .deliver(
                    profile.chat_id,
                    "❌ Something went wrong. Please try again later",
                    gptgram::bot::OutputFormat::Plain,
                )
                .await
                .ok();
            return;
        }
    };

    state
        .telegram
        .deliver(
            profile.chat_id,
            &format!("🎤 <i>{}</i>", html_escape(&transcription)),
            gptgram::bot::OutputFormat::Html,
        )
        .await
        .ok();

    if let Err(e) = state
        .store
        .add_transcribed_seconds(profile.user_id, voice.duration.seconds() as f64)
    {
        error!("Failed to record transcription seconds: {e}");
    }

    state
        .pipeline
        .handle_message(profile, UserInput::text(transcription))
        .await;
}

async fn generate_images_flow(profile: &Profile, prompt: &str, state: &Arc<BotState>) {
    use gptgram::bot::OutputFormat;

    state
        .telegram
        .deliver(profile.chat_id, "🎨 Generating images...", OutputFormat::Plain)
        .await
        .ok();
    state.telegram.upload_photo_action(profile.chat_id).await;

    let images = match state
        .client
        .generate_images(
            prompt,
            state.config.return_n_generated_images,
            &state.config.image_size,
        )
        .await
    {
        Ok(images) => images,
        Err(e) if e.is_safety_refusal() => {
            state
                .telegram
                .deliver(
                    profile.chat_id,
                    "❌ Your request doesn't comply with the safety system, try rephrasing it",
                    OutputFormat::Plain,
                )
                .await
                .ok();
            return;
        }
        Err(e) => {
            error!("Image generation failed: {e}");
            state
                .telegram
                .deliver(
                    profile.chat_id,
                    "❌ Something went wrong. Please try again later",
                    OutputFormat::Plain,
                )
                .await
                .ok();
            return;
        }
    };

    if let Err(e) = state
        .store
        .add_generated_images(profile.user_id, images.len() as u64)
    {
        // Accounting failures must be loud, not silent
        error!("Failed to record generated images: {e}");
    }

    for image in images {
        if let Err(e) = state.telegram.send_photo(profile.chat_id, image).await {
            warn!("Failed to send generated image: {e}");
        }
    }
}

// ==========================================
// CALLBACK HANDLER
// ==========================================

async fn handle_callback(bot: Bot, q: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    bot.answer_callback_query(q.id.clone()).await.ok();

    let Some(data) = q.data.clone() else {
        return Ok(());
    };
    let Some(message) = q.message.as_ref() else {
        return Ok(());
    };
    let chat_id = message.chat().id;
    let message_id = message.id();

    let profile = profile_from(&q.from, chat_id);
    if let Err(e) = state.pipeline.ensure_registered(&profile) {
        error!("Failed to register user {}: {e}", profile.user_id);
        return Ok(());
    }

    if let Some(page) = data.strip_prefix("modes:") {
        if let Ok(page) = page.parse::<usize>() {
            let (text, markup) = chat_mode_menu(&state, page);
            if let Err(e) = bot
                .edit_message_text(chat_id, message_id, text)
                .parse_mode(ParseMode::Html)
                .reply_markup(markup)
                .await
            {
                warn!("Failed to edit chat mode menu: {e}");
            }
        }
    } else if let Some(mode_key) = data.strip_prefix("mode:") {
        let Some(mode) = state.config.registry.chat_mode(mode_key) else {
            warn!("Unknown chat mode selected: {mode_key}");
            return Ok(());
        };
        if let Err(e) = state
            .store
            .set_chat_mode(profile.user_id, mode_key)
            .and_then(|_| state.store.start_new_dialog(profile.user_id))
        {
            error!("Failed to switch chat mode: {e}");
            return Ok(());
        }
        let text = format!(
            "✅ <b>{}</b> mode selected!\n\n{}",
            mode.name, mode.welcome_message
        );
        bot.send_message(chat_id, text)
            .parse_mode(ParseMode::Html)
            .await?;
    } else if let Some(model_key) = data.strip_prefix("model:") {
        if !state
            .config
            .registry
            .available_text_models()
            .iter()
            .any(|k| k == model_key)
        {
            warn!("Unknown model selected: {model_key}");
            return Ok(());
        }
        if let Err(e) = state
            .store
            .set_model(profile.user_id, model_key)
            .and_then(|_| state.store.start_new_dialog(profile.user_id))
        {
            error!("Failed to switch model: {e}");
            return Ok(());
        }
        match settings_menu(&state, profile.user_id) {
            Ok((text, markup)) => {
                if let Err(e) = bot
                    .edit_message_text(chat_id, message_id, text)
                    .parse_mode(ParseMode::Html)
                    .reply_markup(markup)
                    .await
                {
                    warn!("Failed to edit settings menu: {e}");
                }
            }
            Err(e) => error!("Failed to render settings: {e}"),
        }
    }

    Ok(())
}
