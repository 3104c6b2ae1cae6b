//! Scheduled tasks and host cron jobs (§4.9).
//!
//! A single poll loop over `due_tasks` rather than `cron::scheduler`'s
//! per-job timer task: tasks are created and cancelled dynamically through
//! IPC, so a row-driven poll is a better fit than a timer spawned per job.
//! Host jobs keep a lighter in-memory analogue of the same idea since their
//! definitions come from static config rather than the store.

use crate::agent_run::{self, AgentRunRequest, InputSource};
use crate::config::Config;
use crate::error::{Result, SchedulerError};
use crate::store::tasks::{RunStatus, ScheduleType, ScheduledTask, TaskRunLog, TaskUpdate};
use crate::PynchyDeps;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;

pub struct Scheduler {
    deps: PynchyDeps,
    host_last_checked: Mutex<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(deps: PynchyDeps) -> Self {
        Self {
            deps,
            host_last_checked: Mutex::new(Utc::now()),
        }
    }

    pub fn poll_interval(&self, config: &Config) -> StdDuration {
        StdDuration::from_secs(config.scheduler.poll_interval_secs)
    }

    /// One tick: advance and fire due scheduled tasks, then check host cron
    /// jobs against the same wall clock.
    pub async fn poll_once(&self, config: &Config) -> Result<()> {
        self.poll_scheduled_tasks().await?;
        self.poll_host_jobs(config).await?;
        Ok(())
    }

    async fn poll_scheduled_tasks(&self) -> Result<()> {
        let now = Utc::now();
        let due = self.deps.store.tasks.due_tasks(now).await?;
        for task in due {
            let next_run = compute_next_run(&task, now)?;
            let update = match next_run {
                Some(next) => TaskUpdate {
                    next_run: Some(next),
                    ..Default::default()
                },
                None => TaskUpdate {
                    clear_next_run: true,
                    status: Some(crate::store::tasks::TaskStatus::Completed),
                    ..Default::default()
                },
            };
            // Advance next_run before dispatch so a crash mid-run can never
            // cause the same task to fire twice.
            self.deps.store.tasks.update(&task.id, &update).await?;

            let deps = self.deps.clone();
            let jid: crate::WorkspaceId = Arc::from(task.chat_jid.as_str());
            let task_id = task.id.clone();
            self.deps
                .queue
                .enqueue_task(
                    &jid,
                    task_id,
                    Box::new(move || Box::pin(run_task(deps, task))),
                )
                .await;
        }
        Ok(())
    }

    /// Host cron jobs come from two sources: statically declared
    /// `[cron_jobs.*]` config tables and jobs created at runtime via the
    /// `schedule_host_job` IPC request. Both are evaluated against the same
    /// in-memory poll window since `host_jobs` has no `next_run` column of
    /// its own — the window itself is the schedule state.
    async fn poll_host_jobs(&self, config: &Config) -> Result<()> {
        let now = Utc::now();
        let mut last_checked = self.host_last_checked.lock().await;
        let window_start = *last_checked;
        *last_checked = now;
        drop(last_checked);

        for (name, job) in &config.cron_jobs {
            if !job.enabled {
                continue;
            }
            if is_due(&job.schedule, name, window_start, now) {
                run_host_job(name, &job.command, job.working_dir.as_deref(), job.timeout_secs).await;
            }
        }

        for job in self.deps.store.tasks.list_host_jobs().await? {
            if !job.enabled || job.status != crate::store::tasks::TaskStatus::Active {
                continue;
            }
            if is_due(&job.schedule_value, &job.name, window_start, now) {
                run_host_job(&job.name, &job.command, job.working_dir.as_deref(), job.timeout_secs).await;
            }
        }
        Ok(())
    }
}

fn is_due(schedule: &str, name: &str, window_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let Ok(schedule) = cron::Schedule::from_str(schedule) else {
        tracing::warn!(job = %name, schedule, "invalid host cron schedule");
        return false;
    };
    schedule.after(&window_start).take_while(|t| *t <= now).count() > 0
}

/// The next fire time per §4.9's schedule_type table: cron advances to the
/// next cron occurrence, interval advances by its millisecond value, once
/// clears to `None` (the task is marked completed by the caller).
fn compute_next_run(task: &ScheduledTask, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match task.schedule_type {
        ScheduleType::Cron => {
            let schedule = cron::Schedule::from_str(&task.schedule_value).map_err(|_| SchedulerError::InvalidSchedule {
                schedule_type: "cron".to_string(),
                value: task.schedule_value.clone(),
            })?;
            Ok(schedule.after(&now).next())
        }
        ScheduleType::Interval => {
            let millis: i64 = task.schedule_value.parse().map_err(|_| SchedulerError::InvalidSchedule {
                schedule_type: "interval".to_string(),
                value: task.schedule_value.clone(),
            })?;
            Ok(Some(now + chrono::Duration::milliseconds(millis)))
        }
        ScheduleType::Once => Ok(None),
    }
}

async fn run_task(deps: PynchyDeps, task: ScheduledTask) {
    let config = deps.config.current();
    let run_started = Utc::now();

    let outcome = run_task_inner(&deps, &config, &task).await;

    let duration_ms = (Utc::now() - run_started).num_milliseconds().max(0);
    let log = match &outcome {
        Ok(result) => TaskRunLog {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            run_at: run_started,
            duration_ms,
            status: if result.is_error { RunStatus::Error } else { RunStatus::Success },
            result: Some(format!("sent_output={}", result.sent_any_output)),
            error: None,
        },
        Err(e) => TaskRunLog {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            run_at: run_started,
            duration_ms,
            status: RunStatus::Error,
            result: None,
            error: Some(e.to_string()),
        },
    };
    if let Err(e) = deps.store.tasks.log_run(&log).await {
        tracing::error!(task_id = %task.id, error = %e, "failed to record task run log");
    }

    let jid: crate::WorkspaceId = Arc::from(task.chat_jid.as_str());
    deps.queue.finish_active(&jid).await;
}

async fn run_task_inner(deps: &PynchyDeps, config: &Config, task: &ScheduledTask) -> Result<agent_run::AgentRunOutcome> {
    let jid: crate::WorkspaceId = Arc::from(task.chat_jid.as_str());
    let Some(profile) = deps.store.workspaces.get_profile(&jid).await? else {
        return Err(SchedulerError::InvalidSchedule {
            schedule_type: task.schedule_type.as_str().to_string(),
            value: format!("unknown workspace for task {}", task.id),
        }
        .into());
    };

    let message = crate::Message {
        id: uuid::Uuid::new_v4().to_string(),
        chat_jid: jid.clone(),
        sender_id: "scheduler".to_string(),
        display_name: None,
        content: task.prompt.clone(),
        timestamp: Utc::now(),
        is_from_me: false,
        message_type: crate::MessageType::System,
        metadata: None,
    };

    let request = AgentRunRequest {
        workspace: profile,
        chat_jid: jid,
        messages: vec![message],
        is_scheduled_task: true,
        repo_access_override: Some(task.repo_access),
        input_source: InputSource::ScheduledTask,
        extra_system_notices: vec![format!("this turn was triggered by scheduled task {}", task.id)],
    };
    agent_run::run_agent(deps, config, request).await
}

async fn run_host_job(name: &str, command: &str, working_dir: Option<&str>, timeout_secs: u64) {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let result = timeout(StdDuration::from_secs(timeout_secs), cmd.output()).await;
    match result {
        Ok(Ok(output)) if output.status.success() => {
            tracing::info!(job = %name, "host cron job succeeded");
        }
        Ok(Ok(output)) => {
            tracing::warn!(
                job = %name,
                code = output.status.code().unwrap_or(-1),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "host cron job exited with non-zero status"
            );
        }
        Ok(Err(e)) => tracing::error!(job = %name, error = %e, "host cron job failed to spawn"),
        Err(_) => tracing::error!(job = %name, timeout_secs, "host cron job timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tasks::ContextMode;

    fn sample_task(schedule_type: ScheduleType, schedule_value: &str) -> ScheduledTask {
        ScheduledTask {
            id: "t1".into(),
            workspace_folder: "w1".into(),
            chat_jid: "w1@jid".into(),
            prompt: "check".into(),
            schedule_type,
            schedule_value: schedule_value.into(),
            context_mode: ContextMode::Group,
            next_run: None,
            last_run: None,
            last_result: None,
            status: crate::store::tasks::TaskStatus::Active,
            repo_access: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn interval_schedule_advances_by_milliseconds() {
        let now = Utc::now();
        let task = sample_task(ScheduleType::Interval, "60000");
        let next = compute_next_run(&task, now).unwrap().unwrap();
        assert!((next - now).num_seconds() >= 59);
    }

    #[test]
    fn once_schedule_has_no_next_run() {
        let task = sample_task(ScheduleType::Once, "");
        assert!(compute_next_run(&task, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn cron_schedule_parses_and_advances() {
        let now = Utc::now();
        let task = sample_task(ScheduleType::Cron, "0 0 * * * * *");
        let next = compute_next_run(&task, now).unwrap();
        assert!(next.is_some());
    }

    #[test]
    fn invalid_interval_value_is_rejected() {
        let task = sample_task(ScheduleType::Interval, "not-a-number");
        assert!(compute_next_run(&task, Utc::now()).is_err());
    }
}
