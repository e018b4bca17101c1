use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use busbuddy::bot::{
    BotSettings, BusBot, CacheSettings, DataMallClient, ReminderStore, Scheduler, TelegramClient,
    TransitData,
};
use busbuddy::config::Config;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct BotState {
    engine: Arc<BusBot>,
    telegram: Arc<TelegramClient>,
}

fn spawn_session_sweeper(engine: Arc<BusBot>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            engine.sweep_sessions().await;
        }
    });
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("busbuddy.log"))
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

    info!("🚌 Starting busbuddy...");
    match &config.config_path {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => info!("No config file given, using defaults and environment"),
    }
    info!("Timezone: {}, table: {}", config.timezone, config.table_name);

    let store = match ReminderStore::open(&config.database_path(), &config.table_name) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open reminder store: {e}");
            std::process::exit(1);
        }
    };

    let datamall = match DataMallClient::new(
        &config.lta_base_url,
        &config.lta_api_key,
        config.upstream_timeout,
        config.upstream_retries,
    ) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build DataMall client: {e}");
            std::process::exit(1);
        }
    };
    let transit = Arc::new(TransitData::new(
        Arc::new(datamall),
        CacheSettings {
            ttl: config.cache_ttl,
            max_routes: config.cache_max_routes,
        },
    ));
    match transit.warm_up().await {
        Ok(count) => info!("Stop directory ready ({count} stops)"),
        Err(e) => warn!("Stop directory warm-up failed, will load on demand: {e}"),
    }

    let bot = Bot::new(&config.telegram_bot_token);
    let bot_username = match bot.get_me().await {
        Ok(me) => {
            info!("Bot user ID: {}, username: @{}", me.id, me.username());
            me.username().to_string()
        }
        Err(e) => {
            warn!("Failed to get bot info: {e}");
            String::new()
        }
    };

    let telegram = Arc::new(TelegramClient::new(bot.clone()));
    telegram.register_commands().await.ok();

    let engine = Arc::new(BusBot::new(
        store.clone(),
        transit.clone(),
        BotSettings {
            bot_username,
            session_ttl: config.session_ttl,
            page_size: config.buslist_page_size,
        },
    ));
    spawn_session_sweeper(engine.clone());

    let scheduler = Arc::new(Scheduler::new(
        store,
        transit,
        telegram.clone(),
        config.timezone,
        config.upstream_timeout,
    ));
    scheduler.spawn(config.tick_interval);
    info!("Reminder scheduler running every {:?}", config.tick_interval);

    let state = Arc::new(BotState { engine, telegram });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_message(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let first_name = msg.from.as_ref().map(|u| u.first_name.as_str());

    if let Some(reply) = state.engine.handle_text(msg.chat.id.0, first_name, text).await {
        // Send failures are already logged
        state.telegram.send_message(msg.chat.id.0, &reply).await.ok();
    }
    Ok(())
}

/// Inline buttons carry the reply they stand for.
async fn handle_callback(bot: Bot, q: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    if let Err(e) = bot.answer_callback_query(q.id.clone()).await {
        warn!("Failed to answer callback query: {e}");
    }
    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    let chat_id = q
        .message
        .as_ref()
        .map(|m| m.chat().id)
        .unwrap_or(ChatId(q.from.id.0 as i64));

    if let Some(reply) = state
        .engine
        .handle_text(chat_id.0, Some(q.from.first_name.as_str()), data)
        .await
    {
        state.telegram.send_message(chat_id.0, &reply).await.ok();
    }
    Ok(())
}
