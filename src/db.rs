use anyhow::{Context, Result};
use log::info;
use rusqlite::{params, Connection};
use serde_json::Value;

use crate::openrouter::ChatMessage;

/// Number of exchanges included in the completion context by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 5;

/// One stored user/assistant exchange. Rows are written once and never
/// updated or deleted by the running bot.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub id: i64,
    pub chat_id: i64,
    pub user_id: String,
    pub username: String,
    pub user_message: String,
    pub assistant_message: String,
    pub context: Value,
    pub created_at: String,
}

/// Store-level failures, rejected before anything touches the database.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    Validation(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Validation(msg) => write!(f, "Validation error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Initialize the database schema
pub fn init_database_schema(conn: &Connection) -> Result<()> {
    info!("Initializing database schema...");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id INTEGER NOT NULL,
            user_id TEXT,
            username TEXT,
            user_message TEXT NOT NULL,
            assistant_message TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT '{}',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )
    .context("Failed to create conversations table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS index_conversations_on_chat_id
         ON conversations (chat_id)",
        [],
    )
    .context("Failed to create chat_id index")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS index_conversations_on_chat_id_and_created_at
         ON conversations (chat_id, created_at)",
        [],
    )
    .context("Failed to create chat_id/created_at index")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS index_conversations_on_user_id
         ON conversations (user_id)",
        [],
    )
    .context("Failed to create user_id index")?;

    info!("Database schema initialized successfully");
    Ok(())
}

/// Record one completed exchange. Both message fields must be non-blank;
/// validation failures surface as [`StoreError::Validation`] and write
/// nothing.
pub fn record_exchange(
    conn: &Connection,
    chat_id: i64,
    user_id: &str,
    username: &str,
    user_message: &str,
    assistant_message: &str,
    context: &Value,
) -> Result<Exchange> {
    if user_message.trim().is_empty() {
        return Err(StoreError::Validation("user_message must not be empty".to_string()).into());
    }
    if assistant_message.trim().is_empty() {
        return Err(
            StoreError::Validation("assistant_message must not be empty".to_string()).into(),
        );
    }

    info!("Recording exchange for chat_id: {chat_id}");

    conn.execute(
        "INSERT INTO conversations
            (chat_id, user_id, username, user_message, assistant_message, context)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            chat_id,
            user_id,
            username,
            user_message,
            assistant_message,
            context.to_string()
        ],
    )
    .context("Failed to insert exchange")?;

    let id = conn.last_insert_rowid();
    let created_at: String = conn
        .query_row(
            "SELECT created_at FROM conversations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .context("Failed to read back inserted exchange")?;

    info!("Exchange recorded with ID: {id}");

    Ok(Exchange {
        id,
        chat_id,
        user_id: user_id.to_string(),
        username: username.to_string(),
        user_message: user_message.to_string(),
        assistant_message: assistant_message.to_string(),
        context: context.clone(),
        created_at,
    })
}

/// Fetch the last `limit` exchanges for a chat, oldest first, flattened into
/// alternating user/assistant messages ready to send as completion context.
///
/// `created_at` has one-second resolution in SQLite, so ties are broken by
/// insertion order.
pub fn recent_history(conn: &Connection, chat_id: i64, limit: usize) -> Result<Vec<ChatMessage>> {
    let mut stmt = conn
        .prepare(
            "SELECT user_message, assistant_message, username
             FROM conversations
             WHERE chat_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )
        .context("Failed to prepare history statement")?;

    let rows = stmt
        .query_map(params![chat_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })
        .context("Failed to query conversation history")?;

    let mut exchanges = Vec::new();
    for row in rows {
        exchanges.push(row.context("Failed to read history row")?);
    }
    exchanges.reverse();

    let mut turns = Vec::with_capacity(exchanges.len() * 2);
    for (user_message, assistant_message, username) in exchanges {
        turns.push(ChatMessage::user(user_message, username));
        turns.push(ChatMessage::assistant(assistant_message));
    }

    Ok(turns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn setup_test_db() -> Result<(Connection, NamedTempFile)> {
        let temp_file = NamedTempFile::new()?;
        let conn = Connection::open(temp_file.path())?;
        init_database_schema(&conn)?;
        Ok((conn, temp_file))
    }

    fn exchange_count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        Ok(count)
    }

    #[test]
    fn test_record_exchange_basic() -> Result<()> {
        let (conn, _temp_file) = setup_test_db()?;

        let context = json!({"timestamp": 1742094956, "chat_type": "group", "message_id": 42});
        let exchange = record_exchange(
            &conn,
            -100123,
            "12345",
            "alice",
            "@bot what is 2+2?",
            "2+2 is 4.",
            &context,
        )?;

        assert!(exchange.id > 0);
        assert_eq!(exchange.chat_id, -100123);
        assert_eq!(exchange.user_id, "12345");
        assert_eq!(exchange.username, "alice");
        assert!(!exchange.created_at.is_empty());

        // Verify the row landed in the table
        let (db_chat_id, db_user_message, db_context): (i64, String, String) = conn.query_row(
            "SELECT chat_id, user_message, context FROM conversations WHERE id = ?1",
            params![exchange.id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        assert_eq!(db_chat_id, -100123);
        assert_eq!(db_user_message, "@bot what is 2+2?");
        assert_eq!(serde_json::from_str::<Value>(&db_context)?, context);

        Ok(())
    }

    #[test]
    fn test_record_exchange_empty_user_message_fails() -> Result<()> {
        let (conn, _temp_file) = setup_test_db()?;

        let result = record_exchange(&conn, 1, "1", "alice", "", "reply", &json!({}));

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Validation(_))
        ));
        assert_eq!(exchange_count(&conn)?, 0);

        Ok(())
    }

    #[test]
    fn test_record_exchange_empty_assistant_message_fails() -> Result<()> {
        let (conn, _temp_file) = setup_test_db()?;

        let result = record_exchange(&conn, 1, "1", "alice", "question", "", &json!({}));

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Validation(_))
        ));
        assert_eq!(exchange_count(&conn)?, 0);

        Ok(())
    }

    #[test]
    fn test_record_exchange_blank_message_fails() -> Result<()> {
        let (conn, _temp_file) = setup_test_db()?;

        let result = record_exchange(&conn, 1, "1", "alice", "   \n\t", "reply", &json!({}));

        assert!(result.is_err());
        assert_eq!(exchange_count(&conn)?, 0);

        Ok(())
    }

    #[test]
    fn test_recent_history_empty_chat() -> Result<()> {
        let (conn, _temp_file) = setup_test_db()?;

        let history = recent_history(&conn, 999, DEFAULT_HISTORY_LIMIT)?;
        assert!(history.is_empty());

        Ok(())
    }

    #[test]
    fn test_recent_history_includes_recorded_exchange() -> Result<()> {
        let (conn, _temp_file) = setup_test_db()?;

        record_exchange(&conn, 7, "1", "alice", "hello", "hi!", &json!({}))?;

        let history = recent_history(&conn, 7, DEFAULT_HISTORY_LIMIT)?;
        assert_eq!(
            history,
            vec![
                ChatMessage::user("hello", Some("alice".to_string())),
                ChatMessage::assistant("hi!"),
            ]
        );

        Ok(())
    }

    #[test]
    fn test_recent_history_alternates_and_orders_oldest_first() -> Result<()> {
        let (conn, _temp_file) = setup_test_db()?;

        for i in 1..=3 {
            record_exchange(
                &conn,
                7,
                "1",
                "alice",
                &format!("question {i}"),
                &format!("answer {i}"),
                &json!({}),
            )?;
        }

        let history = recent_history(&conn, 7, DEFAULT_HISTORY_LIMIT)?;
        assert_eq!(history.len(), 6);
        for (i, turn) in history.iter().enumerate() {
            let expected_role = if i % 2 == 0 { "user" } else { "assistant" };
            assert_eq!(turn.role, expected_role);
        }
        assert_eq!(history[0].content, "question 1");
        assert_eq!(history[5].content, "answer 3");

        Ok(())
    }

    #[test]
    fn test_recent_history_limit_keeps_newest() -> Result<()> {
        let (conn, _temp_file) = setup_test_db()?;

        for i in 1..=3 {
            record_exchange(
                &conn,
                7,
                "1",
                "alice",
                &format!("question {i}"),
                &format!("answer {i}"),
                &json!({}),
            )?;
        }

        let history = recent_history(&conn, 7, 2)?;
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "question 2");
        assert_eq!(history[1].content, "answer 2");
        assert_eq!(history[2].content, "question 3");
        assert_eq!(history[3].content, "answer 3");

        Ok(())
    }

    #[test]
    fn test_recent_history_orders_by_created_at_before_id() -> Result<()> {
        let (conn, _temp_file) = setup_test_db()?;

        let a = record_exchange(&conn, 7, "1", "alice", "exchange a", "ra", &json!({}))?;
        let b = record_exchange(&conn, 7, "1", "alice", "exchange b", "rb", &json!({}))?;
        let c = record_exchange(&conn, 7, "1", "alice", "exchange c", "rc", &json!({}))?;

        // Spread timestamps against insertion order so created_at decides:
        // b is oldest, c is middle, a is newest
        conn.execute(
            "UPDATE conversations SET created_at = '2025-03-16 00:00:03' WHERE id = ?1",
            params![a.id],
        )?;
        conn.execute(
            "UPDATE conversations SET created_at = '2025-03-16 00:00:01' WHERE id = ?1",
            params![b.id],
        )?;
        conn.execute(
            "UPDATE conversations SET created_at = '2025-03-16 00:00:02' WHERE id = ?1",
            params![c.id],
        )?;

        let history = recent_history(&conn, 7, 2)?;
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "exchange c");
        assert_eq!(history[2].content, "exchange a");

        Ok(())
    }

    #[test]
    fn test_recent_history_scoped_to_chat() -> Result<()> {
        let (conn, _temp_file) = setup_test_db()?;

        record_exchange(&conn, 7, "1", "alice", "for chat 7", "a", &json!({}))?;
        record_exchange(&conn, 8, "2", "bob", "for chat 8", "b", &json!({}))?;

        let history = recent_history(&conn, 7, DEFAULT_HISTORY_LIMIT)?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "for chat 7");
        assert_eq!(history[0].name, Some("alice".to_string()));

        Ok(())
    }
}
