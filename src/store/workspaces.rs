//! Workspace identity, JID aliasing, cursors, sessions, and the cleared-at
//! marker (§3: WorkspaceProfile, JID alias, Cursors, Session id,
//! Cleared-at marker).

use crate::config::TriggerMode;
use crate::error::Result;
use crate::WorkspaceId;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

/// Identity of a chat-bound agent sandbox (§3 WorkspaceProfile).
#[derive(Debug, Clone)]
pub struct WorkspaceProfile {
    pub canonical_jid: WorkspaceId,
    pub folder: String,
    pub display_name: String,
    pub trigger_pattern: String,
    pub is_admin: bool,
    pub added_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WorkspaceStore {
    pool: SqlitePool,
}

impl WorkspaceStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workspace_profiles (
                canonical_jid TEXT PRIMARY KEY,
                folder TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                trigger_pattern TEXT NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0,
                added_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create workspace_profiles table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jid_aliases (
                alias_jid TEXT PRIMARY KEY,
                canonical_jid TEXT NOT NULL,
                channel_name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create jid_aliases table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                folder TEXT PRIMARY KEY,
                session_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create sessions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chats (
                chat_jid TEXT PRIMARY KEY,
                cleared_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create chats table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS router_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create router_state table")?;

        Ok(())
    }

    /// Register or update a workspace profile. Matches IPC `register_group`
    /// semantics: a JID already registered updates name/folder/trigger but
    /// never creates a duplicate row (round-trip property, §8).
    pub async fn upsert_profile(&self, profile: &WorkspaceProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workspace_profiles (canonical_jid, folder, display_name, trigger_pattern, is_admin, added_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(canonical_jid) DO UPDATE SET
                folder = excluded.folder,
                display_name = excluded.display_name,
                trigger_pattern = excluded.trigger_pattern,
                is_admin = excluded.is_admin
            "#,
        )
        .bind(profile.canonical_jid.as_ref())
        .bind(&profile.folder)
        .bind(&profile.display_name)
        .bind(&profile.trigger_pattern)
        .bind(profile.is_admin)
        .bind(profile.added_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to upsert workspace profile")?;
        Ok(())
    }

    pub async fn get_profile(&self, canonical_jid: &str) -> Result<Option<WorkspaceProfile>> {
        let row = sqlx::query(
            "SELECT canonical_jid, folder, display_name, trigger_pattern, is_admin, added_at FROM workspace_profiles WHERE canonical_jid = ?",
        )
        .bind(canonical_jid)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load workspace profile")?;

        Ok(row.map(|r| row_to_profile(&r)))
    }

    pub async fn list_profiles(&self) -> Result<Vec<WorkspaceProfile>> {
        let rows = sqlx::query(
            "SELECT canonical_jid, folder, display_name, trigger_pattern, is_admin, added_at FROM workspace_profiles",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list workspace profiles")?;
        Ok(rows.iter().map(row_to_profile).collect())
    }

    /// Map a per-channel alias JID to its canonical JID, following the
    /// invariant that the canonical JID implicitly resolves to itself even
    /// if it has no alias row.
    pub async fn resolve_canonical(&self, jid: &str) -> Result<WorkspaceId> {
        let row = sqlx::query("SELECT canonical_jid FROM jid_aliases WHERE alias_jid = ?")
            .bind(jid)
            .fetch_optional(&self.pool)
            .await
            .context("failed to resolve alias")?;
        match row {
            Some(r) => Ok(WorkspaceId::from(r.try_get::<String, _>("canonical_jid")?)),
            None => Ok(WorkspaceId::from(jid)),
        }
    }

    /// Add or repoint an alias. Aliases form a function: re-adding the same
    /// alias with a different canonical JID repoints it rather than erroring,
    /// matching the upsert-not-duplicate idiom used for workspace profiles.
    pub async fn add_alias(&self, alias_jid: &str, canonical_jid: &str, channel_name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jid_aliases (alias_jid, canonical_jid, channel_name)
            VALUES (?, ?, ?)
            ON CONFLICT(alias_jid) DO UPDATE SET
                canonical_jid = excluded.canonical_jid,
                channel_name = excluded.channel_name
            "#,
        )
        .bind(alias_jid)
        .bind(canonical_jid)
        .bind(channel_name)
        .execute(&self.pool)
        .await
        .context("failed to add alias")?;
        Ok(())
    }

    /// `last_timestamp`: the process-global polled cursor.
    pub async fn last_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        self.get_router_state("last_timestamp").await
    }

    /// Persist `last_timestamp` before dispatching any message (§4.2).
    pub async fn set_last_timestamp(&self, ts: DateTime<Utc>) -> Result<()> {
        self.set_router_state("last_timestamp", ts).await
    }

    /// `last_agent_timestamp[jid]`: per-workspace dispatch cursor.
    pub async fn agent_timestamp(&self, jid: &str) -> Result<Option<DateTime<Utc>>> {
        self.get_router_state(&format!("agent_ts:{jid}")).await
    }

    /// Advance the per-workspace cursor. Callers are responsible for the
    /// rollback-on-dispatch-failure invariant: only call this after a
    /// successful dispatch or intercepted command.
    pub async fn advance_agent_timestamp(&self, jid: &str, ts: DateTime<Utc>) -> Result<()> {
        self.set_router_state(&format!("agent_ts:{jid}"), ts).await
    }

    async fn get_router_state(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT value FROM router_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read router_state")?;
        match row {
            Some(r) => {
                let raw: String = r.try_get("value")?;
                Ok(Some(
                    DateTime::parse_from_rfc3339(&raw)
                        .context("corrupt router_state timestamp")?
                        .with_timezone(&Utc),
                ))
            }
            None => Ok(None),
        }
    }

    async fn set_router_state(&self, key: &str, ts: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO router_state (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(ts.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to persist router_state")?;
        Ok(())
    }

    /// Opaque per-workspace session id, cleared on context-reset.
    pub async fn get_session(&self, folder: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT session_id FROM sessions WHERE folder = ?")
            .bind(folder)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read session")?;
        Ok(row.and_then(|r| r.try_get::<Option<String>, _>("session_id").ok().flatten()))
    }

    pub async fn set_session(&self, folder: &str, session_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (folder, session_id) VALUES (?, ?)
            ON CONFLICT(folder) DO UPDATE SET session_id = excluded.session_id
            "#,
        )
        .bind(folder)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("failed to persist session")?;
        Ok(())
    }

    pub async fn clear_session(&self, folder: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (folder, session_id) VALUES (?, NULL)
            ON CONFLICT(folder) DO UPDATE SET session_id = NULL
            "#,
        )
        .bind(folder)
        .execute(&self.pool)
        .await
        .context("failed to clear session")?;
        Ok(())
    }

    pub async fn cleared_at(&self, chat_jid: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT cleared_at FROM chats WHERE chat_jid = ?")
            .bind(chat_jid)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read cleared_at")?;
        match row.and_then(|r| r.try_get::<Option<String>, _>("cleared_at").ok().flatten()) {
            Some(raw) => Ok(Some(
                DateTime::parse_from_rfc3339(&raw)
                    .context("corrupt cleared_at timestamp")?
                    .with_timezone(&Utc),
            )),
            None => Ok(None),
        }
    }

    pub async fn set_cleared_at(&self, chat_jid: &str, ts: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chats (chat_jid, cleared_at) VALUES (?, ?)
            ON CONFLICT(chat_jid) DO UPDATE SET cleared_at = excluded.cleared_at
            "#,
        )
        .bind(chat_jid)
        .bind(ts.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to persist cleared_at")?;
        Ok(())
    }
}

fn row_to_profile(row: &sqlx::sqlite::SqliteRow) -> WorkspaceProfile {
    WorkspaceProfile {
        canonical_jid: WorkspaceId::from(row.try_get::<String, _>("canonical_jid").unwrap_or_default()),
        folder: row.try_get("folder").unwrap_or_default(),
        display_name: row.try_get("display_name").unwrap_or_default(),
        trigger_pattern: row.try_get("trigger_pattern").unwrap_or_default(),
        is_admin: row.try_get::<i64, _>("is_admin").unwrap_or(0) != 0,
        added_at: row
            .try_get::<String, _>("added_at")
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
    }
}

/// Helper used only by the pipeline to classify a trigger mode from a
/// workspace's stored pattern when the workspace config doesn't already
/// carry it explicitly (admin workspaces bypass the trigger check).
pub fn requires_trigger(is_admin: bool, mode: TriggerMode) -> bool {
    !is_admin && matches!(mode, TriggerMode::Mention)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alias_resolves_to_canonical_and_falls_back_to_self() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = WorkspaceStore::new(pool);
        store.initialize().await.unwrap();

        store.add_alias("slack:C123", "canonical-1", "slack").await.unwrap();
        assert_eq!(
            store.resolve_canonical("slack:C123").await.unwrap().as_ref(),
            "canonical-1"
        );
        // Unaliased JID resolves to itself.
        assert_eq!(
            store.resolve_canonical("canonical-1").await.unwrap().as_ref(),
            "canonical-1"
        );
    }

    #[tokio::test]
    async fn repointing_alias_does_not_duplicate() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = WorkspaceStore::new(pool);
        store.initialize().await.unwrap();

        store.add_alias("slack:C123", "canonical-1", "slack").await.unwrap();
        store.add_alias("slack:C123", "canonical-2", "slack").await.unwrap();
        assert_eq!(
            store.resolve_canonical("slack:C123").await.unwrap().as_ref(),
            "canonical-2"
        );
    }

    #[tokio::test]
    async fn register_workspace_upsert_does_not_duplicate() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = WorkspaceStore::new(pool);
        store.initialize().await.unwrap();

        let mut profile = WorkspaceProfile {
            canonical_jid: WorkspaceId::from("w1"),
            folder: "w1".into(),
            display_name: "Workspace One".into(),
            trigger_pattern: "@Bot".into(),
            is_admin: false,
            added_at: Utc::now(),
        };
        store.upsert_profile(&profile).await.unwrap();
        profile.display_name = "Renamed".into();
        store.upsert_profile(&profile).await.unwrap();

        let all = store.list_profiles().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].display_name, "Renamed");
    }
}
