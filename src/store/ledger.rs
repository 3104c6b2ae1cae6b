//! Outbound delivery ledger (§3 Outbound ledger entry). Records every
//! broadcast of agent output so a channel reconnect can retry what it
//! missed (§4.8, §7 retries).

use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone)]
pub struct OutboundLedgerEntry {
    pub id: String,
    pub chat_jid: String,
    pub content: String,
    pub source: String,
    pub intended_channels: Vec<String>,
    pub delivered_channels: Vec<String>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl OutboundLedgerEntry {
    pub fn is_delivered_to(&self, channel: &str) -> bool {
        self.delivered_channels.iter().any(|c| c == channel)
    }

    pub fn is_fully_delivered(&self) -> bool {
        self.intended_channels
            .iter()
            .all(|c| self.is_delivered_to(c))
    }
}

#[derive(Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbound_ledger (
                id TEXT PRIMARY KEY,
                chat_jid TEXT NOT NULL,
                content TEXT NOT NULL,
                source TEXT NOT NULL,
                intended_channels TEXT NOT NULL,
                delivered_channels TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_attempt_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create outbound_ledger table")?;
        Ok(())
    }

    pub async fn record(&self, entry: &OutboundLedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbound_ledger (id, chat_jid, content, source, intended_channels, delivered_channels, attempt_count, created_at, last_attempt_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.chat_jid)
        .bind(&entry.content)
        .bind(&entry.source)
        .bind(serde_json::to_string(&entry.intended_channels).unwrap_or_default())
        .bind(serde_json::to_string(&entry.delivered_channels).unwrap_or_default())
        .bind(entry.attempt_count)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.last_attempt_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .context("failed to record outbound ledger entry")?;
        Ok(())
    }

    pub async fn mark_delivered(&self, id: &str, channel: &str, at: DateTime<Utc>) -> Result<()> {
        let row = sqlx::query("SELECT delivered_channels, attempt_count FROM outbound_ledger WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load ledger entry")?;
        let Some(row) = row else { return Ok(()) };

        let mut delivered: Vec<String> =
            serde_json::from_str(&row.try_get::<String, _>("delivered_channels")?).unwrap_or_default();
        if !delivered.iter().any(|c| c == channel) {
            delivered.push(channel.to_string());
        }
        let attempt_count: i64 = row.try_get("attempt_count")?;

        sqlx::query(
            "UPDATE outbound_ledger SET delivered_channels = ?, attempt_count = ?, last_attempt_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(&delivered).unwrap_or_default())
        .bind(attempt_count + 1)
        .bind(at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to mark ledger entry delivered")?;
        Ok(())
    }

    /// Entries a given channel still owes delivery on, used to retry after
    /// that channel reconnects (§4.8 Outbound ledger, §7 retries).
    pub async fn undelivered_for_channel(&self, channel: &str) -> Result<Vec<OutboundLedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, chat_jid, content, source, intended_channels, delivered_channels, attempt_count, created_at, last_attempt_at
            FROM outbound_ledger
            WHERE intended_channels LIKE '%' || ? || '%'
            "#,
        )
        .bind(channel)
        .fetch_all(&self.pool)
        .await
        .context("failed to query undelivered ledger entries")?;

        let mut out = Vec::new();
        for row in rows {
            let entry = row_to_entry(&row)?;
            if entry.intended_channels.iter().any(|c| c == channel) && !entry.is_delivered_to(channel) {
                out.push(entry);
            }
        }
        Ok(out)
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<OutboundLedgerEntry> {
    let created_at: String = row.try_get("created_at")?;
    let last_attempt_at: Option<String> = row.try_get("last_attempt_at")?;
    Ok(OutboundLedgerEntry {
        id: row.try_get("id")?,
        chat_jid: row.try_get("chat_jid")?,
        content: row.try_get("content")?,
        source: row.try_get("source")?,
        intended_channels: serde_json::from_str(&row.try_get::<String, _>("intended_channels")?)
            .unwrap_or_default(),
        delivered_channels: serde_json::from_str(&row.try_get::<String, _>("delivered_channels")?)
            .unwrap_or_default(),
        attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .context("corrupt ledger created_at")?
            .with_timezone(&Utc),
        last_attempt_at: last_attempt_at
            .map(|s| chrono::DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .context("corrupt ledger last_attempt_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn undelivered_tracks_per_channel_delivery() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = LedgerStore::new(pool);
        store.initialize().await.unwrap();

        let entry = OutboundLedgerEntry {
            id: "e1".into(),
            chat_jid: "w1".into(),
            content: "hello".into(),
            source: "agent".into(),
            intended_channels: vec!["slack".into(), "whatsapp".into()],
            delivered_channels: vec![],
            attempt_count: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
        };
        store.record(&entry).await.unwrap();

        let pending = store.undelivered_for_channel("slack").await.unwrap();
        assert_eq!(pending.len(), 1);

        store.mark_delivered("e1", "slack", Utc::now()).await.unwrap();
        let pending = store.undelivered_for_channel("slack").await.unwrap();
        assert!(pending.is_empty());
        let still_pending = store.undelivered_for_channel("whatsapp").await.unwrap();
        assert_eq!(still_pending.len(), 1);
    }
}
