use anyhow::{Context, Result};
use std::env;

use crate::openrouter::DEFAULT_MODEL;

/// Fallback HTTP-Referer sent to OpenRouter when APP_URL is not set.
pub const DEFAULT_APP_URL: &str = "http://localhost:3000";

/// Process configuration, loaded once at startup and passed explicitly to the
/// orchestrator instead of living in process-wide mutable state.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub telegram_token: String,
    pub openrouter_api_key: String,
    /// Path to the SQLite database file.
    pub database_url: String,
    /// Application URL sent as the HTTP-Referer header to OpenRouter.
    pub app_url: String,
    /// Model identifier forwarded to the completion endpoint.
    pub model: String,
}

impl BotConfig {
    /// Load configuration from the environment. Missing required variables
    /// abort startup with a descriptive error.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            telegram_token: env::var("TELEGRAM_BOT_TOKEN")
                .context("TELEGRAM_BOT_TOKEN must be set")?,
            openrouter_api_key: env::var("OPENROUTER_API_KEY")
                .context("OPENROUTER_API_KEY must be set")?,
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            app_url: env::var("APP_URL").unwrap_or_else(|_| DEFAULT_APP_URL.to_string()),
            model: env::var("OPENROUTER_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
        })
    }
}
