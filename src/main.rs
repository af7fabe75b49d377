use anyhow::{Context, Result};
use log::info;
use rusqlite::Connection;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ChatMemberUpdated;
use tokio::sync::Mutex;

use openrouter_telegram_bot::bot::{self, BotDeps, BotIdentity};
use openrouter_telegram_bot::config::BotConfig;
use openrouter_telegram_bot::db;
use openrouter_telegram_bot::openrouter::OpenRouterClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    info!("Starting OpenRouter Telegram bot...");

    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = BotConfig::from_env()?;

    info!("Initializing database at: {}", config.database_url);

    // Create database connection
    let conn = Connection::open(&config.database_url)
        .with_context(|| format!("Failed to open database at {}", config.database_url))?;

    // Initialize database schema
    db::init_database_schema(&conn)?;

    // Wrap connection in Arc<Mutex> for sharing across async tasks
    let shared_conn = Arc::new(Mutex::new(conn));

    // Initialize the bot and fetch its own identity
    let bot = Bot::new(&config.telegram_token);
    let me = bot
        .get_me()
        .await
        .context("Failed to fetch bot identity from Telegram")?;

    info!("Bot connected successfully. Listening as @{}", me.username());

    let deps = Arc::new(BotDeps {
        conn: shared_conn,
        client: OpenRouterClient::new(config.openrouter_api_key.clone(), config.app_url.clone()),
        me: BotIdentity {
            id: me.user.id.0,
            username: me.username().to_string(),
        },
        model: config.model.clone(),
    });

    info!("Bot initialized, starting dispatcher");

    // Set up the dispatcher: text messages plus the bot's own membership updates
    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint({
            let deps = Arc::clone(&deps);
            move |bot: Bot, msg: Message| {
                let deps = Arc::clone(&deps);
                async move { bot::message_handler(bot, msg, deps).await }
            }
        }))
        .branch(Update::filter_my_chat_member().endpoint({
            let deps = Arc::clone(&deps);
            move |bot: Bot, update: ChatMemberUpdated| {
                let deps = Arc::clone(&deps);
                async move { bot::chat_member_handler(bot, update, deps).await }
            }
        }));

    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
