//! File-based IPC bus (§4.5): atomic write-then-rename discipline between
//! host and container, request dispatch with per-type authorization, and
//! pre-launch snapshot writing.
//!
//! No teacher analog ships a file IPC surface; this is built from the
//! atomic-write-then-rename idiom implied by `daemon.rs`'s careful pid-file
//! cleanup, generalized to a small directory-per-workspace protocol, and the
//! tagged-JSON dispatch shape of `daemon::handle_ipc_connection`'s
//! switch-on-`type` command handling.

use crate::error::{IpcError, Result};
use crate::store::tasks::{ContextMode, HostJob, ScheduleType, ScheduledTask, TaskStatus, TaskUpdate};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

/// One container→host IPC request. Deserialized from a file dropped in
/// `<workspace>/messages|tasks/`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundRequest {
    Message {
        text: String,
        #[serde(default)]
        sender_role: Option<String>,
    },
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        #[serde(default)]
        context_mode: Option<String>,
        #[serde(default)]
        repo_access: bool,
    },
    ScheduleHostJob {
        name: String,
        schedule_value: String,
        command: String,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default = "default_host_job_timeout")]
        timeout_secs: u64,
    },
    PauseTask {
        task_id: String,
    },
    ResumeTask {
        task_id: String,
    },
    CancelTask {
        task_id: String,
    },
    RegisterGroup {
        folder: String,
        channel: String,
        name: String,
    },
    ResetContext,
    FinishedWork,
    SyncWorktreeToMain {
        request_id: String,
    },
    Deploy,
}

fn default_host_job_timeout() -> u64 {
    300
}

impl InboundRequest {
    /// Admin-only request types (§4.5 Dispatcher authorization). Everything
    /// else is self-only: the requesting workspace may only affect its own
    /// tasks.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            InboundRequest::RegisterGroup { .. }
                | InboundRequest::Deploy
                | InboundRequest::ScheduleHostJob { .. }
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            InboundRequest::Message { .. } => "message",
            InboundRequest::ScheduleTask { .. } => "schedule_task",
            InboundRequest::ScheduleHostJob { .. } => "schedule_host_job",
            InboundRequest::PauseTask { .. } => "pause_task",
            InboundRequest::ResumeTask { .. } => "resume_task",
            InboundRequest::CancelTask { .. } => "cancel_task",
            InboundRequest::RegisterGroup { .. } => "register_group",
            InboundRequest::ResetContext => "reset_context",
            InboundRequest::FinishedWork => "finished_work",
            InboundRequest::SyncWorktreeToMain { .. } => "sync_worktree_to_main",
            InboundRequest::Deploy => "deploy",
        }
    }
}

/// Per-workspace directory layout under `data/ipc/<folder>/` (§4.5).
pub struct WorkspaceIpcDir {
    root: PathBuf,
}

impl WorkspaceIpcDir {
    pub fn new(ipc_root: &Path, folder: &str) -> Self {
        Self {
            root: ipc_root.join(folder),
        }
    }

    pub async fn ensure_layout(&self) -> Result<()> {
        for sub in ["messages", "tasks", "input", "merge_results"] {
            fs::create_dir_all(self.root.join(sub)).await?;
        }
        Ok(())
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.root.join("messages")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn merge_results_dir(&self) -> PathBuf {
        self.root.join("merge_results")
    }

    pub fn current_tasks_snapshot(&self) -> PathBuf {
        self.root.join("current_tasks.json")
    }

    pub fn available_groups_snapshot(&self) -> PathBuf {
        self.root.join("available_groups.json")
    }

    pub fn close_sentinel(&self) -> PathBuf {
        self.input_dir().join("_close")
    }

    /// Container-visible todo list (§4.1, §4.5). Host-mutated only; the
    /// container reads it, it never writes back through this file.
    pub fn todos_file(&self) -> PathBuf {
        self.root.join("todos.json")
    }
}

/// `<unix_ms>-<3-byte-hex>.json`, so lexical order equals creation order
/// (§4.5 write discipline).
pub fn ipc_filename() -> String {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let mut suffix = [0u8; 3];
    rand::thread_rng().fill(&mut suffix);
    format!("{ms}-{}.json", hex::encode(suffix))
}

/// Atomic write-then-rename: write to `<name>.tmp` in the same directory,
/// then rename over `<name>`. Readers therefore see either nothing or a
/// complete object, never a partial write (§4.5, §5 ordering guarantees).
pub async fn write_atomic(dir: &Path, filename: &str, body: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    let final_path = dir.join(filename);
    let tmp_path = dir.join(format!("{filename}.tmp"));
    fs::write(&tmp_path, body).await?;
    fs::rename(&tmp_path, &final_path).await?;
    Ok(final_path)
}

/// Write a new-format JSON request into `dir` under a fresh lexical filename.
pub async fn drop_request(dir: &Path, request: &InboundRequest) -> Result<PathBuf> {
    let body = serde_json::to_vec_pretty(request)
        .map_err(|e| IpcError::MalformedFile {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
    write_atomic(dir, &ipc_filename(), &body).await
}

/// Read and parse every request file in `dir`, in lexical (creation) order,
/// unlinking each as it is consumed.
pub async fn drain_requests(dir: &Path) -> Result<Vec<InboundRequest>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut requests = Vec::new();
    for path in paths {
        let raw = fs::read(&path).await?;
        match serde_json::from_slice::<InboundRequest>(&raw) {
            Ok(req) => requests.push(req),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "dropping malformed ipc file");
            }
        }
        let _ = fs::remove_file(&path).await;
    }
    Ok(requests)
}

/// Host→container: drain queued input files into one concatenated prompt
/// addendum. A `_close` sentinel (zero-byte) ends the session; its presence
/// is reported via the returned bool rather than concatenated.
pub async fn drain_input(input_dir: &Path) -> Result<(Vec<String>, bool)> {
    let mut entries = match fs::read_dir(input_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    paths.sort();

    let mut chunks = Vec::new();
    let mut close_requested = false;
    for path in paths {
        if path.file_name().and_then(|n| n.to_str()) == Some("_close") {
            close_requested = true;
            let _ = fs::remove_file(&path).await;
            continue;
        }
        if let Ok(text) = fs::read_to_string(&path).await {
            chunks.push(text);
        }
        let _ = fs::remove_file(&path).await;
    }
    Ok((chunks, close_requested))
}

/// Write the zero-byte `_close` sentinel that ends a container's session.
pub async fn write_close_sentinel(input_dir: &Path) -> Result<()> {
    write_atomic(input_dir, "_close", b"").await?;
    Ok(())
}

/// Authorization check for one dispatched request (§4.5 Dispatcher
/// authorization).
pub fn authorize(request: &InboundRequest, is_admin: bool, folder: &str) -> Result<()> {
    if request.requires_admin() && !is_admin {
        return Err(IpcError::Unauthorized {
            request_type: request.type_name().to_string(),
            folder: folder.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Route one drained request to its store mutation, outbound message, or
/// process-side effect (§4.5 Dispatcher). `folder`/`jid`/`is_admin` describe
/// the requesting workspace; `authorize` has not yet run when this is
/// called, so it runs first here.
pub async fn dispatch(
    deps: &crate::PynchyDeps,
    config: &crate::config::Config,
    folder: &str,
    jid: &crate::WorkspaceId,
    is_admin: bool,
    request: InboundRequest,
) -> Result<()> {
    authorize(&request, is_admin, folder)?;

    match request {
        InboundRequest::Message { text, sender_role } => {
            let record = crate::Message {
                id: uuid::Uuid::new_v4().to_string(),
                chat_jid: jid.clone(),
                sender_id: sender_role.unwrap_or_else(|| "container".to_string()),
                display_name: None,
                content: text.clone(),
                timestamp: chrono::Utc::now(),
                is_from_me: true,
                message_type: crate::MessageType::Assistant,
                metadata: None,
            };
            deps.store.messages.append(&record).await?;
            deps.channels.broadcast_to_channels(jid, &text).await?;
        }
        InboundRequest::ScheduleTask {
            prompt,
            schedule_type,
            schedule_value,
            context_mode,
            repo_access,
        } => {
            let schedule_type = ScheduleType::parse(&schedule_type).ok_or_else(|| IpcError::MissingField {
                request_type: "schedule_task".to_string(),
                field: "schedule_type".to_string(),
            })?;
            let now = chrono::Utc::now();
            let task = ScheduledTask {
                id: uuid::Uuid::new_v4().to_string(),
                workspace_folder: folder.to_string(),
                chat_jid: jid.to_string(),
                prompt,
                schedule_type,
                schedule_value,
                context_mode: context_mode.as_deref().map(ContextMode::parse).unwrap_or(ContextMode::Group),
                next_run: Some(now),
                last_run: None,
                last_result: None,
                status: TaskStatus::Active,
                repo_access,
                created_at: now,
            };
            deps.store.tasks.create(&task).await?;
        }
        InboundRequest::ScheduleHostJob {
            name,
            schedule_value,
            command,
            working_dir,
            timeout_secs,
        } => {
            let job = HostJob {
                id: uuid::Uuid::new_v4().to_string(),
                name,
                schedule_value,
                command,
                working_dir,
                timeout_secs,
                enabled: true,
                status: TaskStatus::Active,
            };
            deps.store.tasks.create_host_job(&job).await?;
        }
        InboundRequest::PauseTask { task_id } => {
            set_task_status(deps, folder, is_admin, &task_id, TaskStatus::Paused, "pause_task").await?;
        }
        InboundRequest::ResumeTask { task_id } => {
            set_task_status(deps, folder, is_admin, &task_id, TaskStatus::Active, "resume_task").await?;
        }
        InboundRequest::CancelTask { task_id } => {
            let task = deps.store.tasks.get(&task_id).await?;
            if !is_admin && task.workspace_folder != folder {
                return Err(IpcError::Unauthorized {
                    request_type: "cancel_task".to_string(),
                    folder: folder.to_string(),
                }
                .into());
            }
            deps.store
                .tasks
                .update(
                    &task_id,
                    &TaskUpdate {
                        clear_next_run: true,
                        status: Some(TaskStatus::Completed),
                        ..Default::default()
                    },
                )
                .await?;
            let task_jid: crate::WorkspaceId = std::sync::Arc::from(task.chat_jid.as_str());
            deps.queue.clear_pending_tasks(&task_jid).await;
        }
        InboundRequest::RegisterGroup {
            folder: new_folder,
            channel,
            name,
        } => {
            let Some(new_jid) = deps.channels.create_group(&name).await else {
                tracing::warn!(folder = %new_folder, channel, "register_group requested but no channel could create a group");
                return Ok(());
            };
            deps.store
                .workspaces
                .upsert_profile(&crate::store::WorkspaceProfile {
                    canonical_jid: std::sync::Arc::from(new_jid.as_str()),
                    folder: new_folder,
                    display_name: name,
                    trigger_pattern: config.agent.default_trigger_pattern.clone(),
                    is_admin: false,
                    added_at: chrono::Utc::now(),
                })
                .await?;
        }
        InboundRequest::ResetContext => {
            deps.store.workspaces.clear_session(folder).await?;
            deps.store.workspaces.set_cleared_at(jid, chrono::Utc::now()).await?;
            deps.queue.enqueue_message_check(jid).await;
        }
        InboundRequest::FinishedWork => {
            deps.queue.close_stdin(jid).await;
        }
        InboundRequest::SyncWorktreeToMain { request_id } => {
            let policy = config.resolve_workspace(folder).map(|r| r.git_policy).unwrap_or_default();
            crate::worktree::handle_sync_request(config, folder, policy, &request_id).await?;
        }
        InboundRequest::Deploy => {
            deps.channels.broadcast_host_message(jid, "deploy requested").await?;
        }
    }
    Ok(())
}

async fn set_task_status(
    deps: &crate::PynchyDeps,
    folder: &str,
    is_admin: bool,
    task_id: &str,
    status: TaskStatus,
    request_type: &str,
) -> Result<()> {
    let task = deps.store.tasks.get(task_id).await?;
    if !is_admin && task.workspace_folder != folder {
        return Err(IpcError::Unauthorized {
            request_type: request_type.to_string(),
            folder: folder.to_string(),
        }
        .into());
    }
    deps.store
        .tasks
        .update(
            task_id,
            &TaskUpdate {
                status: Some(status),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

/// One task entry in the pre-launch `current_tasks.json` snapshot (§4.5
/// Snapshots).
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshotEntry {
    pub id: String,
    pub group_folder: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub next_run: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostJobSnapshotEntry {
    pub id: String,
    pub name: String,
    pub schedule_value: String,
    pub enabled: bool,
}

/// Build and atomically write `current_tasks.json` for one workspace launch.
/// Admins see every task plus host jobs; non-admins see only their own
/// folder's tasks (§4.5 Snapshots).
pub async fn write_current_tasks_snapshot(
    ipc_dir: &WorkspaceIpcDir,
    folder: &str,
    is_admin: bool,
    all_tasks: &[TaskSnapshotEntry],
    host_jobs: &[HostJobSnapshotEntry],
) -> Result<()> {
    #[derive(Serialize)]
    struct Snapshot<'a> {
        tasks: Vec<&'a TaskSnapshotEntry>,
        host_jobs: Vec<&'a HostJobSnapshotEntry>,
    }

    let tasks: Vec<&TaskSnapshotEntry> = if is_admin {
        all_tasks.iter().collect()
    } else {
        all_tasks.iter().filter(|t| t.group_folder == folder).collect()
    };
    let host_jobs: Vec<&HostJobSnapshotEntry> = if is_admin { host_jobs.iter().collect() } else { Vec::new() };

    let body = serde_json::to_vec_pretty(&Snapshot { tasks, host_jobs })
        .map_err(|e| IpcError::MalformedFile {
            path: "current_tasks.json".to_string(),
            reason: e.to_string(),
        })?;
    write_atomic(&ipc_dir.root, "current_tasks.json", &body).await?;
    Ok(())
}

/// Build and atomically write `available_groups.json`. Admins see every
/// registered workspace folder; non-admins see an empty list (§4.5
/// Snapshots).
pub async fn write_available_groups_snapshot(
    ipc_dir: &WorkspaceIpcDir,
    is_admin: bool,
    all_folders: &[String],
) -> Result<()> {
    let groups: &[String] = if is_admin { all_folders } else { &[] };
    let body = serde_json::to_vec_pretty(groups).map_err(|e| IpcError::MalformedFile {
        path: "available_groups.json".to_string(),
        reason: e.to_string(),
    })?;
    write_atomic(&ipc_dir.root, "available_groups.json", &body).await?;
    Ok(())
}

/// One entry in the on-disk todo list the host maintains for a workspace
/// while its container is busy on a scheduled task (§4.1, §4.3). The agent
/// core has no external tool-invocation surface yet, so this is a host-side
/// bypass of the container's own tools rather than an MCP call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub text: String,
    pub done: bool,
    pub created_at: String,
}

/// Append one item to `todos.json`, creating it if absent. Corrupt or
/// missing files are treated as an empty list rather than failing the
/// interrupt that triggered this (§4.1).
pub async fn append_todo(ipc_dir: &WorkspaceIpcDir, text: &str) -> Result<TodoItem> {
    let path = ipc_dir.todos_file();
    let mut items: Vec<TodoItem> = match fs::read(&path).await {
        Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
        Err(_) => Vec::new(),
    };

    let item = TodoItem {
        id: uuid::Uuid::new_v4().to_string(),
        text: text.to_string(),
        done: false,
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    items.push(item.clone());

    let body = serde_json::to_vec_pretty(&items).map_err(|e| IpcError::MalformedFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    write_atomic(&ipc_dir.root, "todos.json", &body).await?;
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_todo_creates_and_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let ipc_dir = WorkspaceIpcDir::new(dir.path(), "team");

        append_todo(&ipc_dir, "check logs").await.unwrap();
        let second = append_todo(&ipc_dir, "rotate keys").await.unwrap();
        assert_eq!(second.text, "rotate keys");

        let raw = fs::read(ipc_dir.todos_file()).await.unwrap();
        let items: Vec<TodoItem> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(items.len(), 2);
        assert!(!items[1].done);
    }

    #[tokio::test]
    async fn write_then_drain_round_trips_in_lexical_order() {
        let dir = tempfile::tempdir().unwrap();
        let tasks_dir = dir.path().join("tasks");

        drop_request(&tasks_dir, &InboundRequest::ResetContext).await.unwrap();
        drop_request(
            &tasks_dir,
            &InboundRequest::ScheduleTask {
                prompt: "check logs".into(),
                schedule_type: "interval".into(),
                schedule_value: "60000".into(),
                context_mode: None,
                repo_access: false,
            },
        )
        .await
        .unwrap();

        let drained = drain_requests(&tasks_dir).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], InboundRequest::ResetContext));

        // Files are unlinked on consumption.
        let remaining = drain_requests(&tasks_dir).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn drain_input_reports_close_sentinel_separately() {
        let dir = tempfile::tempdir().unwrap();
        let input_dir = dir.path().join("input");
        write_atomic(&input_dir, "a.json", b"first chunk").await.unwrap();
        write_close_sentinel(&input_dir).await.unwrap();

        let (chunks, closed) = drain_input(&input_dir).await.unwrap();
        assert_eq!(chunks, vec!["first chunk".to_string()]);
        assert!(closed);
    }

    #[test]
    fn admin_only_requests_are_rejected_for_non_admin() {
        let request = InboundRequest::Deploy;
        let err = authorize(&request, false, "team").unwrap_err();
        assert!(matches!(err, crate::Error::Ipc(IpcError::Unauthorized { .. })));
        assert!(authorize(&request, true, "admin").is_ok());
    }

    #[test]
    fn self_only_requests_never_require_admin() {
        let request = InboundRequest::PauseTask {
            task_id: "t1".into(),
        };
        assert!(authorize(&request, false, "team").is_ok());
    }
}
