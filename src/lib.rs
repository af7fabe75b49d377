//! # OpenRouter Telegram Bot
//!
//! A Telegram bot that relays directed messages to the OpenRouter
//! chat-completion API and stores each exchange in SQLite so replies
//! carry short-term conversational context.

pub mod bot;
pub mod config;
pub mod db;
pub mod openrouter;
