//! The message store: durable append + cursor queries for messages, chats,
//! workspace profiles, sessions, scheduled tasks, host jobs, and the
//! outbound ledger (§3, §6).
//!
//! Table-per-concern, one `SqlitePool` shared across them, matching the
//! teacher's `HistoryStore`/`TaskStore` split rather than one monolithic
//! struct with every query inline.

mod ledger;
mod messages;
pub mod tasks;
mod workspaces;

pub use ledger::{LedgerStore, OutboundLedgerEntry};
pub use messages::MessageStore;
pub use tasks::{HostJob, ScheduledTask, ScheduleType, TaskRunLog, TaskStatus, TaskStore};
pub use workspaces::{requires_trigger, WorkspaceProfile, WorkspaceStore};

use crate::error::Result;
use anyhow::Context as _;
use sqlx::SqlitePool;

/// Aggregate handle to every table. Cheap to clone (all fields are
/// `SqlitePool`, itself an `Arc` internally).
#[derive(Clone)]
pub struct Store {
    pub messages: MessageStore,
    pub workspaces: WorkspaceStore,
    pub tasks: TaskStore,
    pub ledger: LedgerStore,
    pool: SqlitePool,
}

impl Store {
    /// Connect to (creating if absent) the SQLite database at `path` and
    /// run all table migrations.
    pub async fn connect(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory: {}", parent.display()))?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("failed to open store at {}", path.display()))?;

        let store = Self {
            messages: MessageStore::new(pool.clone()),
            workspaces: WorkspaceStore::new(pool.clone()),
            tasks: TaskStore::new(pool.clone()),
            ledger: LedgerStore::new(pool.clone()),
            pool,
        };
        store.initialize().await?;
        Ok(store)
    }

    /// Connect to an in-memory database, for tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .context("failed to open in-memory store")?;
        let store = Self {
            messages: MessageStore::new(pool.clone()),
            workspaces: WorkspaceStore::new(pool.clone()),
            tasks: TaskStore::new(pool.clone()),
            ledger: LedgerStore::new(pool.clone()),
            pool,
        };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        self.messages.initialize().await?;
        self.workspaces.initialize().await?;
        self.tasks.initialize().await?;
        self.ledger.initialize().await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
