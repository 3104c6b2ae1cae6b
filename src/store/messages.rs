//! Message persistence: append-only storage plus the cursor queries the
//! inbound pipeline and history views read from (§3 Message, §8 invariant 5).

use crate::error::Result;
use crate::{Message, MessageType, WorkspaceId};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_jid TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                display_name TEXT,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                is_from_me INTEGER NOT NULL,
                message_type TEXT NOT NULL,
                metadata TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create messages table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp)")
            .execute(&self.pool)
            .await
            .context("failed to create messages timestamp index")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_chat_ts ON messages(chat_jid, timestamp)")
            .execute(&self.pool)
            .await
            .context("failed to create messages chat/timestamp index")?;

        Ok(())
    }

    pub async fn append(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, chat_jid, sender_id, display_name, content, timestamp, is_from_me, message_type, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(message.chat_jid.as_ref())
        .bind(&message.sender_id)
        .bind(&message.display_name)
        .bind(&message.content)
        .bind(message.timestamp.to_rfc3339())
        .bind(message.is_from_me)
        .bind(message_type_str(message.message_type))
        .bind(message.metadata.as_ref().map(|v| v.to_string()))
        .execute(&self.pool)
        .await
        .context("failed to append message")?;
        Ok(())
    }

    /// Like `append`, but silently skips a row whose id already exists.
    /// Used by channel history reconciliation, which may re-offer a message
    /// the store already has (§4.2 "every ~10s, run channel history
    /// reconciliation").
    pub async fn append_if_absent(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages (id, chat_jid, sender_id, display_name, content, timestamp, is_from_me, message_type, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(message.chat_jid.as_ref())
        .bind(&message.sender_id)
        .bind(&message.display_name)
        .bind(&message.content)
        .bind(message.timestamp.to_rfc3339())
        .bind(message.is_from_me)
        .bind(message_type_str(message.message_type))
        .bind(message.metadata.as_ref().map(|v| v.to_string()))
        .execute(&self.pool)
        .await
        .context("failed to backfill message")?;
        Ok(())
    }

    /// New messages strictly newer than `last_timestamp`, across every
    /// canonical JID the caller scopes this to (§4.2 polling loop).
    /// Only user-origin senders are returned (§8 invariant 5).
    pub async fn new_messages_since(&self, since: DateTime<Utc>) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, chat_jid, sender_id, display_name, content, timestamp, is_from_me, message_type, metadata
            FROM messages
            WHERE timestamp > ? AND message_type = 'user'
            ORDER BY timestamp ASC
            "#,
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .context("failed to poll new messages")?;
        rows.iter().map(row_to_message).collect()
    }

    /// All messages for one chat since a per-workspace cursor, used once the
    /// pipeline decides to dispatch (§4.2 step 7). Includes non-user-origin
    /// rows so the agent sees its own prior turns and tool output.
    pub async fn messages_since(&self, chat_jid: &str, since: Option<DateTime<Utc>>) -> Result<Vec<Message>> {
        let rows = match since {
            Some(ts) => {
                sqlx::query(
                    r#"
                    SELECT id, chat_jid, sender_id, display_name, content, timestamp, is_from_me, message_type, metadata
                    FROM messages WHERE chat_jid = ? AND timestamp > ? ORDER BY timestamp ASC
                    "#,
                )
                .bind(chat_jid)
                .bind(ts.to_rfc3339())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, chat_jid, sender_id, display_name, content, timestamp, is_from_me, message_type, metadata
                    FROM messages WHERE chat_jid = ? ORDER BY timestamp ASC
                    "#,
                )
                .bind(chat_jid)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("failed to load messages since cursor")?;
        rows.iter().map(row_to_message).collect()
    }

    /// Full chat history, honoring the cleared-at marker (§8 invariant 6).
    /// Unlike `new_messages_since`, internal-sender rows are included.
    pub async fn chat_history(
        &self,
        chat_jid: &str,
        cleared_at: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let floor = cleared_at.unwrap_or_else(|| DateTime::<Utc>::MIN_UTC);
        let rows = sqlx::query(
            r#"
            SELECT id, chat_jid, sender_id, display_name, content, timestamp, is_from_me, message_type, metadata
            FROM messages
            WHERE chat_jid = ? AND timestamp > ?
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(chat_jid)
        .bind(floor.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to load chat history")?;
        let mut messages: Vec<Message> = rows.iter().map(row_to_message).collect::<Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }
}

fn message_type_str(t: MessageType) -> &'static str {
    match t {
        MessageType::User => "user",
        MessageType::Assistant => "assistant",
        MessageType::System => "system",
        MessageType::Host => "host",
        MessageType::ToolResult => "tool_result",
    }
}

fn message_type_from_str(s: &str) -> MessageType {
    match s {
        "user" => MessageType::User,
        "assistant" => MessageType::Assistant,
        "host" => MessageType::Host,
        "tool_result" => MessageType::ToolResult,
        _ => MessageType::System,
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
    let timestamp_raw: String = row.try_get("timestamp")?;
    let metadata_raw: Option<String> = row.try_get("metadata")?;
    Ok(Message {
        id: row.try_get("id")?,
        chat_jid: WorkspaceId::from(row.try_get::<String, _>("chat_jid")?),
        sender_id: row.try_get("sender_id")?,
        display_name: row.try_get("display_name")?,
        content: row.try_get("content")?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp_raw)
            .context("corrupt message timestamp")?
            .with_timezone(&Utc),
        is_from_me: row.try_get::<i64, _>("is_from_me")? != 0,
        message_type: message_type_from_str(&row.try_get::<String, _>("message_type")?),
        metadata: metadata_raw.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: DateTime<Utc>, kind: MessageType) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            chat_jid: WorkspaceId::from("w1"),
            sender_id: "alice@wa".into(),
            display_name: Some("Alice".into()),
            content: "hi".into(),
            timestamp: ts,
            is_from_me: false,
            message_type: kind,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn internal_senders_excluded_from_new_messages_but_present_in_history() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = MessageStore::new(pool);
        store.initialize().await.unwrap();

        let t0 = Utc::now();
        store.append(&sample(t0, MessageType::User)).await.unwrap();
        store
            .append(&sample(t0 + chrono::Duration::seconds(1), MessageType::Assistant))
            .await
            .unwrap();

        let polled = store.new_messages_since(t0 - chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].message_type, MessageType::User);

        let history = store.chat_history("w1", None, 100).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn cleared_at_hides_older_messages() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = MessageStore::new(pool);
        store.initialize().await.unwrap();

        let t0 = Utc::now();
        store.append(&sample(t0, MessageType::User)).await.unwrap();
        store
            .append(&sample(t0 + chrono::Duration::seconds(10), MessageType::User))
            .await
            .unwrap();

        let history = store
            .chat_history("w1", Some(t0 + chrono::Duration::seconds(5)), 100)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }
}
