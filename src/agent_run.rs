//! Unified agent-run entry point (§4.6): the single path both the inbound
//! pipeline and the scheduler use to launch a container turn.
//!
//! Grounded on `main.rs`'s channel-event-loop wiring (`on_output` wrapped to
//! detect the session id, mark delivery, and call `handle_streamed_output`)
//! and `cron/scheduler.rs::run_cron_job`'s identical "build input, dispatch,
//! drain responses" shape — confirming the pipeline and scheduler share one
//! entry point rather than duplicating dispatch logic.

use crate::config::Config;
use crate::error::Result;
use crate::ipc::WorkspaceIpcDir;
use crate::queue::ActiveProcessHandle;
use crate::runner::{self, ContainerInput, LaunchSpec};
use crate::store::WorkspaceProfile;
use crate::{ContainerEvent, Message, PynchyDeps, WorkspaceId};
use tokio::sync::mpsc;

/// Where the messages driving this run originated, carried through so the
/// container input and logging can distinguish the three call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    User,
    ScheduledTask,
    ResetHandoff,
}

impl InputSource {
    fn as_str(self) -> &'static str {
        match self {
            InputSource::User => "user",
            InputSource::ScheduledTask => "scheduled_task",
            InputSource::ResetHandoff => "reset_handoff",
        }
    }
}

pub struct AgentRunRequest {
    pub workspace: WorkspaceProfile,
    pub chat_jid: WorkspaceId,
    pub messages: Vec<Message>,
    pub is_scheduled_task: bool,
    pub repo_access_override: Option<bool>,
    pub input_source: InputSource,
    pub extra_system_notices: Vec<String>,
}

pub struct AgentRunOutcome {
    pub is_error: bool,
    pub sent_any_output: bool,
    pub new_session_id: Option<String>,
}

/// Run one container turn end to end: resolve the worktree, build the
/// container input, serialize through the per-workspace queue, invoke the
/// runner, render streamed output, and persist the resulting session id.
pub async fn run_agent(deps: &PynchyDeps, config: &Config, request: AgentRunRequest) -> Result<AgentRunOutcome> {
    let folder = request.workspace.folder.clone();
    let resolved = config.resolve_workspace(&folder);
    let repo_access = request
        .repo_access_override
        .unwrap_or_else(|| resolved.as_ref().map(|r| r.repo_access.is_some()).unwrap_or(false));

    let mut system_notices = request.extra_system_notices.clone();
    let mut worktree_path = None;
    let mut main_git_dir = None;
    if repo_access {
        if let Ok(resolution) = crate::worktree::resolve(config, &folder).await {
            worktree_path = Some(resolution.worktree_path);
            main_git_dir = Some(resolution.git_dir);
            system_notices.extend(resolution.advisory_notices);
        }
    }

    let ipc_dir = WorkspaceIpcDir::new(&config.ipc_dir(), &folder);
    ipc_dir.ensure_layout().await?;
    write_launch_snapshots(deps, &ipc_dir, &folder, request.workspace.is_admin).await?;

    let session_id = deps.store.workspaces.get_session(&folder).await?;
    let input = ContainerInput {
        messages: request.messages.iter().map(message_to_json).collect(),
        group_folder: folder.clone(),
        chat_jid: request.chat_jid.to_string(),
        is_admin: request.workspace.is_admin,
        session_id,
        is_scheduled_task: request.is_scheduled_task,
        system_notices,
        repo_access: resolved.and_then(|r| r.repo_access.clone()),
        agent_core_module: config.agent.name.clone(),
        agent_core_class: "PrimaryCore".to_string(),
        agent_core_config: None,
        plugin_mcp_servers: std::collections::HashMap::new(),
    };

    let spec = LaunchSpec {
        folder: folder.clone(),
        is_admin: request.workspace.is_admin,
        repo_access,
        worktree_path,
        main_git_dir,
        additional_mounts: Vec::new(),
    };
    let mounts = runner::build_mounts(config, &spec);

    let (input_tx, _input_rx) = mpsc::unbounded_channel();
    let handle = ActiveProcessHandle {
        input_tx,
        close_tx: None,
        cancel: tokio_util::sync::CancellationToken::new(),
    };
    deps.queue.begin_active(&request.chat_jid, request.is_scheduled_task, handle).await?;

    let chat_jid = request.chat_jid.clone();
    let deps_for_output = deps.clone();
    let mut sent_any = false;
    let mut saw_error_result = false;

    let outcome_result = runner::run(config, &folder, &input, &mounts, |event: ContainerEvent| {
        if let ContainerEvent::Result { error, .. } = &event {
            if error.is_some() {
                saw_error_result = true;
            }
        }
        let deps = deps_for_output.clone();
        let jid = chat_jid.clone();
        tokio::spawn(async move {
            if let Ok(sent) = deps.channels.handle_streamed_output(&jid, &event).await {
                if sent {
                    tracing::debug!(jid = %jid, "delivered streamed output");
                }
            }
        });
        sent_any = true;
    })
    .await;

    deps.queue.finish_active(&request.chat_jid).await;

    let outcome = outcome_result?;
    if let Some(session_id) = &outcome.new_session_id {
        deps.store.workspaces.set_session(&folder, session_id).await?;
    }

    let is_error = matches!(outcome.status, runner::RunStatus::Error) || saw_error_result;
    tracing::info!(
        folder = %folder,
        input_source = request.input_source.as_str(),
        is_error,
        "agent run completed"
    );

    Ok(AgentRunOutcome {
        is_error,
        sent_any_output: sent_any,
        new_session_id: outcome.new_session_id,
    })
}

/// Write `current_tasks.json` and `available_groups.json` immediately before
/// handing control to the runner, so a container always sees a fresh view of
/// scheduling state and sibling workspaces (§4.5 Snapshots).
async fn write_launch_snapshots(
    deps: &PynchyDeps,
    ipc_dir: &WorkspaceIpcDir,
    folder: &str,
    is_admin: bool,
) -> Result<()> {
    use crate::ipc::{HostJobSnapshotEntry, TaskSnapshotEntry};

    let tasks: Vec<TaskSnapshotEntry> = deps
        .store
        .tasks
        .list_all()
        .await?
        .into_iter()
        .map(|t| TaskSnapshotEntry {
            id: t.id,
            group_folder: t.workspace_folder,
            prompt: t.prompt,
            schedule_type: t.schedule_type.as_str().to_string(),
            schedule_value: t.schedule_value,
            next_run: t.next_run.map(|d| d.to_rfc3339()),
            status: t.status.as_str().to_string(),
        })
        .collect();
    let host_jobs: Vec<HostJobSnapshotEntry> = deps
        .store
        .tasks
        .list_host_jobs()
        .await?
        .into_iter()
        .map(|h| HostJobSnapshotEntry {
            id: h.id,
            name: h.name,
            schedule_value: h.schedule_value,
            enabled: h.enabled,
        })
        .collect();
    crate::ipc::write_current_tasks_snapshot(ipc_dir, folder, is_admin, &tasks, &host_jobs).await?;

    let folders: Vec<String> = deps
        .store
        .workspaces
        .list_profiles()
        .await?
        .into_iter()
        .map(|p| p.folder)
        .collect();
    crate::ipc::write_available_groups_snapshot(ipc_dir, is_admin, &folders).await?;
    Ok(())
}

fn message_to_json(message: &Message) -> serde_json::Value {
    serde_json::json!({
        "id": message.id,
        "sender_id": message.sender_id,
        "display_name": message.display_name,
        "content": message.content,
        "timestamp": message.timestamp.to_rfc3339(),
        "is_from_me": message.is_from_me,
        "message_type": message.message_type,
    })
}
