//! Scheduled tasks, host jobs, and their run logs (§3 ScheduledTask,
//! HostJob, TaskRunLog).

use crate::error::{Result, StoreError};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleType {
    Cron,
    Interval,
    Once,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleType::Cron => "cron",
            ScheduleType::Interval => "interval",
            ScheduleType::Once => "once",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cron" => Some(ScheduleType::Cron),
            "interval" => Some(ScheduleType::Interval),
            "once" => Some(ScheduleType::Once),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TaskStatus::Active),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    Group,
    Isolated,
}

impl ContextMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextMode::Group => "group",
            ContextMode::Isolated => "isolated",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "isolated" => ContextMode::Isolated,
            _ => ContextMode::Group,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: String,
    pub workspace_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub status: TaskStatus,
    pub repo_access: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HostJob {
    pub id: String,
    pub name: String,
    pub schedule_value: String,
    pub command: String,
    pub working_dir: Option<String>,
    pub timeout_secs: u64,
    pub enabled: bool,
    pub status: TaskStatus,
}

#[derive(Debug, Clone)]
pub struct TaskRunLog {
    pub id: String,
    pub task_id: String,
    pub run_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

/// Partial-update input for a scheduled task. Mirrors the "explicit intent"
/// idiom for partial updates: `Option<T>` fields left `None` are
/// unchanged, and `clear_next_run` disambiguates "leave as-is" from
/// "explicitly set to null" the way a bare `Option<DateTime<Utc>>` cannot.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub next_run: Option<DateTime<Utc>>,
    pub clear_next_run: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub status: Option<TaskStatus>,
}

#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                workspace_folder TEXT NOT NULL,
                chat_jid TEXT NOT NULL,
                prompt TEXT NOT NULL,
                schedule_type TEXT NOT NULL,
                schedule_value TEXT NOT NULL,
                context_mode TEXT NOT NULL,
                next_run TEXT,
                last_run TEXT,
                last_result TEXT,
                status TEXT NOT NULL,
                repo_access INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create scheduled_tasks table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_due ON scheduled_tasks(next_run, status)")
            .execute(&self.pool)
            .await
            .context("failed to create scheduled_tasks due index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS host_jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                schedule_value TEXT NOT NULL,
                command TEXT NOT NULL,
                working_dir TEXT,
                timeout_secs INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'active'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create host_jobs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_run_logs (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                run_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create task_run_logs table")?;

        Ok(())
    }

    pub async fn create(&self, task: &ScheduledTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_tasks
                (id, workspace_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode, next_run, last_run, last_result, status, repo_access, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.workspace_folder)
        .bind(&task.chat_jid)
        .bind(&task.prompt)
        .bind(task.schedule_type.as_str())
        .bind(&task.schedule_value)
        .bind(task.context_mode.as_str())
        .bind(task.next_run.map(|t| t.to_rfc3339()))
        .bind(task.last_run.map(|t| t.to_rfc3339()))
        .bind(&task.last_result)
        .bind(task.status.as_str())
        .bind(task.repo_access)
        .bind(task.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to create scheduled task")?;
        Ok(())
    }

    /// Tasks due for execution: `status = 'active' AND next_run <= now` (§4.9).
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workspace_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode, next_run, last_run, last_result, status, repo_access, created_at
            FROM scheduled_tasks
            WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?
            ORDER BY next_run ASC
            "#,
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .context("failed to query due tasks")?;
        rows.iter().map(row_to_task).collect()
    }

    pub async fn get(&self, id: &str) -> Result<ScheduledTask> {
        let row = sqlx::query(
            r#"
            SELECT id, workspace_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode, next_run, last_run, last_result, status, repo_access, created_at
            FROM scheduled_tasks WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load scheduled task")?
        .ok_or_else(|| StoreError::TaskNotFound { id: id.to_string() })?;
        row_to_task(&row)
    }

    /// Apply a partial update. Used both to advance `next_run` before a run
    /// fires (§4.9, §8 invariant: advance before execute) and to record the
    /// result afterward.
    pub async fn update(&self, id: &str, update: &TaskUpdate) -> Result<()> {
        let mut task = self.get(id).await?;
        if update.clear_next_run {
            task.next_run = None;
        } else if let Some(next_run) = update.next_run {
            task.next_run = Some(next_run);
        }
        if let Some(last_run) = update.last_run {
            task.last_run = Some(last_run);
        }
        if let Some(last_result) = &update.last_result {
            task.last_result = Some(last_result.clone());
        }
        if let Some(status) = update.status {
            task.status = status;
        }

        sqlx::query(
            r#"
            UPDATE scheduled_tasks SET next_run = ?, last_run = ?, last_result = ?, status = ? WHERE id = ?
            "#,
        )
        .bind(task.next_run.map(|t| t.to_rfc3339()))
        .bind(task.last_run.map(|t| t.to_rfc3339()))
        .bind(&task.last_result)
        .bind(task.status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to update scheduled task")?;
        Ok(())
    }

    pub async fn log_run(&self, log: &TaskRunLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_run_logs (id, task_id, run_at, duration_ms, status, result, error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.task_id)
        .bind(log.run_at.to_rfc3339())
        .bind(log.duration_ms)
        .bind(log.status.as_str())
        .bind(&log.result)
        .bind(&log.error)
        .execute(&self.pool)
        .await
        .context("failed to log task run")?;
        Ok(())
    }

    /// Persist a host job created dynamically through IPC (`schedule_host_job`,
    /// admin-only). Jobs declared in config live only in `Config::cron_jobs`;
    /// this table holds the ones created at runtime.
    pub async fn create_host_job(&self, job: &HostJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO host_jobs (id, name, schedule_value, command, working_dir, timeout_secs, enabled, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.schedule_value)
        .bind(&job.command)
        .bind(&job.working_dir)
        .bind(job.timeout_secs as i64)
        .bind(job.enabled)
        .bind(job.status.as_str())
        .execute(&self.pool)
        .await
        .context("failed to create host job")?;
        Ok(())
    }

    /// Every scheduled task regardless of status, for the pre-launch
    /// `current_tasks.json` snapshot (§4.5 Snapshots).
    pub async fn list_all(&self) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workspace_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode, next_run, last_run, last_result, status, repo_access, created_at
            FROM scheduled_tasks
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list scheduled tasks")?;
        rows.iter().map(row_to_task).collect()
    }

    pub async fn list_host_jobs(&self) -> Result<Vec<HostJob>> {
        let rows = sqlx::query(
            "SELECT id, name, schedule_value, command, working_dir, timeout_secs, enabled, status FROM host_jobs",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list host jobs")?;
        Ok(rows
            .iter()
            .map(|r| HostJob {
                id: r.try_get("id").unwrap_or_default(),
                name: r.try_get("name").unwrap_or_default(),
                schedule_value: r.try_get("schedule_value").unwrap_or_default(),
                command: r.try_get("command").unwrap_or_default(),
                working_dir: r.try_get("working_dir").ok(),
                timeout_secs: r.try_get::<i64, _>("timeout_secs").unwrap_or(300) as u64,
                enabled: r.try_get::<i64, _>("enabled").unwrap_or(1) != 0,
                status: r
                    .try_get::<String, _>("status")
                    .ok()
                    .and_then(|s| TaskStatus::parse(&s))
                    .unwrap_or(TaskStatus::Active),
            })
            .collect())
    }
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<ScheduledTask> {
    let next_run: Option<String> = row.try_get("next_run")?;
    let last_run: Option<String> = row.try_get("last_run")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(ScheduledTask {
        id: row.try_get("id")?,
        workspace_folder: row.try_get("workspace_folder")?,
        chat_jid: row.try_get("chat_jid")?,
        prompt: row.try_get("prompt")?,
        schedule_type: ScheduleType::parse(&row.try_get::<String, _>("schedule_type")?)
            .context("corrupt schedule_type")?,
        schedule_value: row.try_get("schedule_value")?,
        context_mode: ContextMode::parse(&row.try_get::<String, _>("context_mode")?),
        next_run: next_run
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .context("corrupt next_run")?,
        last_run: last_run
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .context("corrupt last_run")?,
        last_result: row.try_get("last_result")?,
        status: TaskStatus::parse(&row.try_get::<String, _>("status")?).context("corrupt task status")?,
        repo_access: row.try_get::<i64, _>("repo_access")? != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .context("corrupt created_at")?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(next_run: Option<DateTime<Utc>>) -> ScheduledTask {
        ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_folder: "w1".into(),
            chat_jid: "w1@jid".into(),
            prompt: "check".into(),
            schedule_type: ScheduleType::Interval,
            schedule_value: "300000".into(),
            context_mode: ContextMode::Group,
            next_run,
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            repo_access: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn due_tasks_respects_status_and_next_run() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = TaskStore::new(pool);
        store.initialize().await.unwrap();

        let now = Utc::now();
        let due = sample_task(Some(now - chrono::Duration::seconds(1)));
        let not_due = sample_task(Some(now + chrono::Duration::seconds(60)));
        store.create(&due).await.unwrap();
        store.create(&not_due).await.unwrap();

        let found = store.due_tasks(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn clear_next_run_marks_completed() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = TaskStore::new(pool);
        store.initialize().await.unwrap();

        let task = sample_task(Some(Utc::now()));
        store.create(&task).await.unwrap();
        store
            .update(
                &task.id,
                &TaskUpdate {
                    clear_next_run: true,
                    status: Some(TaskStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let reloaded = store.get(&task.id).await.unwrap();
        assert!(reloaded.next_run.is_none());
        assert_eq!(reloaded.status, TaskStatus::Completed);
    }
}
