//! Bot orchestrator: decides which incoming updates deserve an answer,
//! assembles the completion prompt from stored history, and maps provider
//! outcomes into replies.
//!
//! Classification is kept as pure functions over [`IncomingMessage`] and
//! [`BotIdentity`] so the filtering logic is unit-testable without a live
//! transport.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error, info, warn};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::sync::Arc;
use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::*;
use teloxide::types::{
    Chat, ChatMemberStatus, ChatMemberUpdated, MessageEntity, MessageEntityKind, MessageId,
    ReplyParameters,
};
use tokio::sync::Mutex;

use crate::db;
use crate::openrouter::{ChatMessage, CompletionOutcome, OpenRouterClient};

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const DEBUG_HEADER: &str = "Debug Information:";
pub const FALLBACK_REPLY: &str = "I'm sorry, I couldn't process that request.";
pub const ERROR_REPLY: &str = "An error occurred while processing your message.";
pub const WELCOME_MESSAGE: &str =
    "Hello! I'm an AI assistant. Feel free to ask me any questions!";

/// The bot's own identity, fetched once from `getMe` at startup.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: u64,
    pub username: String,
}

impl BotIdentity {
    /// The `@username` form that marks a message as directed at the bot.
    pub fn handle(&self) -> String {
        format!("@{}", self.username)
    }
}

/// Shared handler dependencies, built once in `main` and threaded into every
/// update instead of living in process-wide state.
pub struct BotDeps {
    pub conn: Arc<Mutex<Connection>>,
    pub client: OpenRouterClient,
    pub me: BotIdentity,
    pub model: String,
}

/// Plain view of one inbound text message, decoupled from transport types so
/// classification can be tested without constructing Telegram updates.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub chat_type: &'static str,
    pub message_id: i32,
    pub date: DateTime<Utc>,
    pub text: String,
    pub user_id: u64,
    pub username: Option<String>,
    pub first_name: String,
    /// Sender of the message this one replies to, if any.
    pub reply_to_from_id: Option<u64>,
    /// Texts of the `@mention` entities carried by the message.
    pub mentions: Vec<String>,
}

impl IncomingMessage {
    /// Extract a view from a Telegram message. Updates without text or
    /// without an attributable sender yield `None` and are ignored upstream.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let text = msg.text()?;
        let from = msg.from.as_ref()?;
        let reply_to_from_id = msg
            .reply_to_message()
            .and_then(|reply| reply.from.as_ref())
            .map(|user| user.id.0);
        let mentions = msg
            .entities()
            .map(|entities| mention_texts(text, entities))
            .unwrap_or_default();

        Some(Self {
            chat_id: msg.chat.id.0,
            chat_type: chat_type_str(&msg.chat),
            message_id: msg.id.0,
            date: msg.date,
            text: text.to_string(),
            user_id: from.id.0,
            username: from.username.clone(),
            first_name: from.first_name.clone(),
            reply_to_from_id,
            mentions,
        })
    }

    /// Username with first-name fallback, as stored alongside exchanges.
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.first_name)
    }
}

/// What the orchestrator intends to do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageAction {
    /// No reply, no store write.
    Ignore,
    /// Reply with a diagnostic snapshot; touches neither store nor client.
    Debug,
    /// Run the full history + completion + persist + reply turn.
    Answer,
}

/// Decide how to treat an inbound message.
pub fn classify(msg: &IncomingMessage, me: &BotIdentity) -> MessageAction {
    if msg.text.is_empty() {
        return MessageAction::Ignore;
    }
    if msg.text.contains("!debug") {
        return MessageAction::Debug;
    }
    if is_directed_at_bot(msg, me) {
        MessageAction::Answer
    } else {
        MessageAction::Ignore
    }
}

/// A message is directed at the bot when it replies to one of the bot's own
/// messages, spells out the bot's `@handle` in its text, or carries a mention
/// entity equal to that handle.
pub fn is_directed_at_bot(msg: &IncomingMessage, me: &BotIdentity) -> bool {
    let handle = me.handle();
    msg.reply_to_from_id == Some(me.id)
        || msg.text.contains(&handle)
        || msg.mentions.iter().any(|mention| mention == &handle)
}

/// Extract the text of each `@mention` entity. Telegram entity offsets count
/// UTF-16 code units, not bytes or chars.
pub fn mention_texts(text: &str, entities: &[MessageEntity]) -> Vec<String> {
    let units: Vec<u16> = text.encode_utf16().collect();
    entities
        .iter()
        .filter(|entity| entity.kind == MessageEntityKind::Mention)
        .filter_map(|entity| {
            let end = entity.offset.checked_add(entity.length)?;
            let slice = units.get(entity.offset..end)?;
            String::from_utf16(slice).ok()
        })
        .collect()
}

/// System prompt, then stored history oldest-first, then the new message
/// with its text left exactly as the user sent it.
pub fn build_messages(history: Vec<ChatMessage>, user_text: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(SYSTEM_PROMPT));
    messages.extend(history);
    messages.push(ChatMessage::user(user_text, None));
    messages
}

/// Pull the reply text out of a completion body. `None` when the body has no
/// usable `choices[0].message.content`.
pub fn reply_text(body: &Value) -> Option<&str> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .filter(|content| !content.is_empty())
}

/// Pretty-printed snapshot for the `!debug` command.
pub fn debug_snapshot(msg: &IncomingMessage, me: &BotIdentity) -> String {
    let info = json!({
        "chat_id": msg.chat_id,
        "chat_type": msg.chat_type,
        "user_id": msg.user_id,
        "username": msg.username,
        "first_name": msg.first_name,
        "bot_info": {
            "username": me.username,
            "id": me.id,
        },
        "message_id": msg.message_id,
        "date": msg.date.to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    let body = serde_json::to_string_pretty(&info).unwrap_or_default();
    format!("{DEBUG_HEADER}\n{body}")
}

/// Decide the reply for a completed turn: `Some` carries the model's text and
/// means persist-then-reply, `None` means send the fixed fallback and store
/// nothing. Only a `Success` body with usable content earns a real reply.
pub fn decide_reply(outcome: &CompletionOutcome) -> Option<String> {
    match outcome {
        CompletionOutcome::Success(body) => match reply_text(body) {
            Some(content) => Some(content.to_string()),
            None => {
                warn!("OpenRouter returned a response without usable choices");
                None
            }
        },
        CompletionOutcome::ProviderError { code, message } => {
            warn!("OpenRouter returned error {code}: {message}");
            None
        }
        CompletionOutcome::TransportFailure => {
            warn!("OpenRouter request failed with no response");
            None
        }
    }
}

/// The bot is welcomed into a chat on a transition to member or administrator.
pub fn is_welcome_status(status: ChatMemberStatus) -> bool {
    matches!(
        status,
        ChatMemberStatus::Member | ChatMemberStatus::Administrator
    )
}

fn chat_type_str(chat: &Chat) -> &'static str {
    if chat.is_private() {
        "private"
    } else if chat.is_group() {
        "group"
    } else if chat.is_supergroup() {
        "supergroup"
    } else {
        "channel"
    }
}

/// Entry point for message updates. Internal faults are logged and turned
/// into a fixed apology; nothing propagates to the dispatcher.
pub async fn message_handler(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> Result<()> {
    let Some(view) = IncomingMessage::from_message(&msg) else {
        debug!("Ignoring update without text or sender in chat {}", msg.chat.id);
        return Ok(());
    };

    debug!(
        "Received message from user {} ({}) in chat {}",
        view.user_id,
        view.display_name(),
        view.chat_id
    );

    match classify(&view, &deps.me) {
        MessageAction::Ignore => {
            debug!("Message in chat {} not directed at bot, ignoring", view.chat_id);
        }
        MessageAction::Debug => {
            let snapshot = debug_snapshot(&view, &deps.me);
            if let Err(e) = reply_in_chat(&bot, &view, snapshot).await {
                error!("Failed to send debug reply to chat {}: {e}", view.chat_id);
            }
        }
        MessageAction::Answer => {
            if let Err(e) = answer(&bot, &view, &deps).await {
                error!(
                    "Error processing message {} from user {} in chat {}: {e:#}",
                    view.message_id, view.user_id, view.chat_id
                );
                if let Err(send_err) = reply_in_chat(&bot, &view, ERROR_REPLY.to_string()).await {
                    error!("Failed to send error reply to chat {}: {send_err}", view.chat_id);
                }
            }
        }
    }

    Ok(())
}

/// One full answer turn: history fetch, completion call, store write, reply.
async fn answer(bot: &Bot, view: &IncomingMessage, deps: &BotDeps) -> Result<()> {
    info!(
        "Received message from user {} ({}): {}",
        view.user_id,
        view.display_name(),
        view.text
    );

    let history = {
        let conn = deps.conn.lock().await;
        db::recent_history(&conn, view.chat_id, db::DEFAULT_HISTORY_LIMIT)?
    };
    let messages = build_messages(history, &view.text);

    info!(
        "Sending completion request to OpenRouter with {} messages",
        messages.len()
    );
    let outcome = deps.client.complete(&messages, &deps.model).await;

    match decide_reply(&outcome) {
        Some(content) => {
            let context = json!({
                "timestamp": Utc::now().timestamp(),
                "chat_type": view.chat_type,
                "message_id": view.message_id,
            });
            {
                let conn = deps.conn.lock().await;
                db::record_exchange(
                    &conn,
                    view.chat_id,
                    &view.user_id.to_string(),
                    view.display_name(),
                    &view.text,
                    &content,
                    &context,
                )?;
            }
            reply_in_chat(bot, view, content).await?;
            info!("Reply sent to chat {}", view.chat_id);
        }
        None => {
            reply_in_chat(bot, view, FALLBACK_REPLY.to_string()).await?;
        }
    }

    Ok(())
}

async fn reply_in_chat(bot: &Bot, view: &IncomingMessage, text: String) -> Result<()> {
    bot.send_message(ChatId(view.chat_id), text)
        .reply_parameters(ReplyParameters::new(MessageId(view.message_id)))
        .await?;
    Ok(())
}

/// Entry point for the bot's own membership updates: greet the chat when the
/// bot is added as a member or administrator, ignore everything else.
pub async fn chat_member_handler(
    bot: Bot,
    update: ChatMemberUpdated,
    deps: Arc<BotDeps>,
) -> Result<()> {
    let member = &update.new_chat_member;

    if member.user.id.0 == deps.me.id && is_welcome_status(member.kind.status()) {
        info!(
            "Bot was added to chat: {}",
            update.chat.title().unwrap_or("<unnamed>")
        );
        if let Err(e) = bot.send_message(update.chat.id, WELCOME_MESSAGE).await {
            error!("Failed to send welcome message to chat {}: {e}", update.chat.id);
        }
    } else {
        debug!(
            "Ignoring chat member transition in chat {}",
            update.chat.id
        );
    }

    Ok(())
}
