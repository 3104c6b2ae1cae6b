//! Startup sequence, in-memory state ownership, and the main `tokio::select!`
//! loop tying the pipeline, scheduler, and IPC bus together (§4.10).
//!
//! Grounded on `main.rs::run`'s top-level wiring: load config, connect the
//! store, reconcile first-run state, then hand off to one event loop that
//! multiplexes poll timers instead of the teacher's channel-connection loop
//! (this core ships no concrete channel, so there's nothing to reconnect).

use crate::broadcast::BroadcastPlane;
use crate::config::{Config, RuntimeConfig};
use crate::pipeline::Pipeline;
use crate::queue::WorkspaceQueue;
use crate::scheduler::Scheduler;
use crate::store::{Store, WorkspaceProfile};
use crate::{PynchyDeps, Result, WorkspaceId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

const IPC_POLL: Duration = Duration::from_millis(500);
const GIT_SYNC_POLL: Duration = Duration::from_secs(300);
const HISTORY_RECONCILE_POLL: Duration = Duration::from_secs(10);

/// Owns every long-lived subsystem handle and runs the process main loop.
pub struct Orchestrator {
    deps: PynchyDeps,
    pipeline: Arc<Pipeline>,
    scheduler: Arc<Scheduler>,
    config_path: PathBuf,
}

impl Orchestrator {
    /// Startup sequence (§4.10 steps 3-4, 6-10, 12-13). Steps 1-2 and 5
    /// (channel credential loading and attachment) and 11 (deploy-continuation
    /// handoff) are out of scope here: no concrete channel adapter ships in
    /// this core, and deploy continuation needs a concrete deploy executor
    /// this core doesn't have.
    pub async fn bootstrap(config_path: PathBuf) -> Result<Self> {
        let config = RuntimeConfig::load(config_path.clone())?;
        let current = config.current();

        let store = Arc::new(Store::connect(&current.sqlite_path()).await?);
        let channels = Arc::new(BroadcastPlane::new(store.ledger.clone()));
        let queue = Arc::new(WorkspaceQueue::new());
        let deps = PynchyDeps {
            store,
            config,
            channels,
            queue,
        };

        bootstrap_admin_workspace(&deps, &current).await?;
        reconcile_workspace_profiles(&deps, &current).await?;
        reconcile_worktrees(&current).await;

        let pipeline = Arc::new(Pipeline::new(deps.clone()));
        let scheduler = Arc::new(Scheduler::new(deps.clone()));

        let recheck_pipeline = pipeline.clone();
        deps.queue
            .set_process_messages_fn(Arc::new(move |jid: WorkspaceId| {
                let pipeline = recheck_pipeline.clone();
                Box::pin(async move {
                    if let Err(e) = pipeline.poll_once().await {
                        tracing::error!(jid = %jid, error = %e, "recheck poll failed");
                    }
                })
            }))
            .await;

        // Recover pending messages (§4.10 step 12): any user-origin message
        // newer than last_agent_timestamp[jid] is picked up by the same
        // query the steady-state poll uses, so one extra poll_once before
        // entering the loop is sufficient.
        if let Err(e) = pipeline.poll_once().await {
            tracing::warn!(error = %e, "startup message recovery poll failed");
        }

        send_boot_notification(&deps, &current).await;

        Ok(Self {
            deps,
            pipeline,
            scheduler,
            config_path,
        })
    }

    /// Run until `shutdown_signal` resolves, then drain and return.
    pub async fn run<S>(self, shutdown_signal: S) -> Result<()>
    where
        S: std::future::Future<Output = ()>,
    {
        let Orchestrator {
            deps,
            pipeline,
            scheduler,
            config_path,
        } = self;

        spawn_config_watcher(deps.config.clone(), config_path);

        let current = deps.config.current();
        let mut pipeline_tick = interval(Duration::from_millis(current.intervals.message_poll_ms));
        let mut scheduler_tick = interval(Duration::from_secs(current.scheduler.poll_interval_secs));
        let mut ipc_tick = interval(IPC_POLL);
        let mut git_sync_tick = interval(GIT_SYNC_POLL);
        let mut history_tick = interval(HISTORY_RECONCILE_POLL);
        drop(current);

        tokio::pin!(shutdown_signal);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_signal => break,
                _ = pipeline_tick.tick() => {
                    if let Err(e) = pipeline.poll_once().await {
                        tracing::error!(error = %e, "pipeline poll failed");
                    }
                }
                _ = scheduler_tick.tick() => {
                    let config = deps.config.current();
                    if let Err(e) = scheduler.poll_once(&config).await {
                        tracing::error!(error = %e, "scheduler poll failed");
                    }
                }
                _ = ipc_tick.tick() => {
                    let config = deps.config.current();
                    if let Err(e) = poll_ipc(&deps, &config).await {
                        tracing::error!(error = %e, "ipc poll failed");
                    }
                }
                _ = git_sync_tick.tick() => {
                    let config = deps.config.current();
                    sync_main_repo(&config).await;
                }
                _ = history_tick.tick() => {
                    if let Err(e) = deps.channels.reconcile_history(&deps.store).await {
                        tracing::error!(error = %e, "channel history reconciliation failed");
                    }
                }
            }
        }

        shutdown_sequence(&deps).await;
        Ok(())
    }
}

/// §4.10 step 6: "First run: if no workspaces, create an admin workspace on
/// the default channel." No concrete channel ships in this core, so there is
/// no real JID to mint; a synthetic local one stands in until a channel
/// adapter registers an alias for it (§3 JID alias).
async fn bootstrap_admin_workspace(deps: &PynchyDeps, config: &Config) -> Result<()> {
    if !deps.store.workspaces.list_profiles().await?.is_empty() {
        return Ok(());
    }
    let Some(folder) = config.admin_folder() else {
        return Ok(());
    };
    let workspace = config.workspaces.get(folder);
    let display_name = workspace.map(|w| w.name.clone()).unwrap_or_else(|| folder.to_string());
    let trigger_pattern = workspace
        .map(|w| w.trigger_pattern.clone())
        .unwrap_or_else(|| config.agent.default_trigger_pattern.clone());

    deps.store
        .workspaces
        .upsert_profile(&WorkspaceProfile {
            canonical_jid: synthetic_jid(folder),
            folder: folder.to_string(),
            display_name,
            trigger_pattern,
            is_admin: true,
            added_at: chrono::Utc::now(),
        })
        .await?;
    tracing::info!(folder, "created admin workspace on first run");
    Ok(())
}

/// Seed a profile for every configured workspace that doesn't already have
/// one, so tasks and IPC requests have somewhere to resolve a JID against
/// even before a channel adapter ever attaches.
async fn reconcile_workspace_profiles(deps: &PynchyDeps, config: &Config) -> Result<()> {
    let existing: std::collections::HashSet<String> = deps
        .store
        .workspaces
        .list_profiles()
        .await?
        .into_iter()
        .map(|p| p.folder)
        .collect();

    for (folder, workspace) in &config.workspaces {
        if existing.contains(folder) {
            continue;
        }
        deps.store
            .workspaces
            .upsert_profile(&WorkspaceProfile {
                canonical_jid: synthetic_jid(folder),
                folder: folder.clone(),
                display_name: workspace.name.clone(),
                trigger_pattern: workspace.trigger_pattern.clone(),
                is_admin: workspace.is_admin,
                added_at: chrono::Utc::now(),
            })
            .await?;
        tracing::info!(folder, "seeded workspace profile from config");
    }
    Ok(())
}

fn synthetic_jid(folder: &str) -> WorkspaceId {
    Arc::from(format!("{folder}@pynchy.local").as_str())
}

/// §4.10 step 9: reconcile every repo-access workspace's worktree at startup
/// so a container never launches against a stale checkout.
async fn reconcile_worktrees(config: &Config) {
    for (folder, workspace) in &config.workspaces {
        if workspace.repo_access.is_none() {
            continue;
        }
        match crate::worktree::resolve(config, folder).await {
            Ok(resolution) => {
                for notice in resolution.advisory_notices {
                    tracing::warn!(folder, notice, "worktree advisory at startup");
                }
            }
            Err(e) => tracing::error!(folder, error = %e, "failed to reconcile worktree at startup"),
        }
    }
}

async fn send_boot_notification(deps: &PynchyDeps, config: &Config) {
    let Some(jid) = admin_jid(deps, config).await else {
        return;
    };
    let _ = deps.channels.broadcast_host_message(&jid, "online").await;
}

async fn admin_jid(deps: &PynchyDeps, config: &Config) -> Option<WorkspaceId> {
    let admin_folder = config.admin_folder()?;
    let profiles = deps.store.workspaces.list_profiles().await.ok()?;
    profiles
        .into_iter()
        .find(|p| p.folder == admin_folder)
        .map(|p| p.canonical_jid)
}

/// Drain every workspace's `tasks/` and `messages/` drop directories and
/// dispatch each request (§4.5 Dispatcher). Workspace profiles are the
/// authoritative list of known folders; an unregistered folder has no
/// directory to poll in the first place.
async fn poll_ipc(deps: &PynchyDeps, config: &Config) -> Result<()> {
    let profiles = deps.store.workspaces.list_profiles().await?;
    for profile in profiles {
        let ipc_dir = crate::ipc::WorkspaceIpcDir::new(&config.ipc_dir(), &profile.folder);
        for dir in [ipc_dir.tasks_dir(), ipc_dir.messages_dir()] {
            let requests = crate::ipc::drain_requests(&dir).await?;
            for request in requests {
                let request_type = request.type_name();
                if let Err(e) = crate::ipc::dispatch(
                    deps,
                    config,
                    &profile.folder,
                    &profile.canonical_jid,
                    profile.is_admin,
                    request,
                )
                .await
                {
                    tracing::warn!(
                        folder = %profile.folder,
                        request_type,
                        error = %e,
                        "ipc dispatch failed"
                    );
                }
            }
        }
    }
    Ok(())
}

/// §4.10 step 9's periodic host-side pull, keeping the main checkout current
/// so worktree rebases (§4.7) see upstream changes promptly.
async fn sync_main_repo(config: &Config) {
    let main_repo = config.data_dir.join("repo");
    if !main_repo.exists() {
        return;
    }
    let output = tokio::process::Command::new("git")
        .args(["pull", "--ff-only"])
        .current_dir(&main_repo)
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => tracing::debug!("host git sync pulled main"),
        Ok(out) => tracing::warn!(
            stderr = %String::from_utf8_lossy(&out.stderr),
            "host git sync failed"
        ),
        Err(e) => tracing::warn!(error = %e, "host git sync failed to spawn"),
    }
}

/// Watch the config file for changes and reload it in place, so
/// `[workspaces.*]`/`[cron_jobs.*]` edits take effect without a restart.
/// Runs on a blocking thread for the lifetime of the process; it ends when
/// the process exits, same as every other background task here.
fn spawn_config_watcher(config: Arc<RuntimeConfig>, path: PathBuf) {
    tokio::task::spawn_blocking(move || watch_config_blocking(config, path));
}

fn watch_config_blocking(config: Arc<RuntimeConfig>, path: PathBuf) {
    use notify::{RecursiveMode, Watcher};

    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = match notify::recommended_watcher(tx) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to start config file watcher");
            return;
        }
    };
    let watch_target: &Path = path.parent().unwrap_or(&path);
    if let Err(e) = watcher.watch(watch_target, RecursiveMode::NonRecursive) {
        tracing::error!(error = %e, path = %path.display(), "failed to watch config file");
        return;
    }

    for event in rx {
        let changed_this_file = match &event {
            Ok(event) => event.paths.iter().any(|p| p == &path),
            Err(_) => false,
        };
        if !changed_this_file {
            continue;
        }
        match config.reload() {
            Ok(()) => tracing::info!("configuration reloaded after file change"),
            Err(e) => tracing::error!(error = %e, "failed to reload configuration"),
        }
    }
}

/// §4.10 step 13 shutdown sequence: tell the admin workspace, drain the
/// queue (cancels active containers and clears pending tasks), and stop.
/// Channel suppression/disconnection is a no-op in this core for the same
/// reason channel attachment is: no concrete adapter ships here.
async fn shutdown_sequence(deps: &PynchyDeps) {
    let config = deps.config.current();
    if let Some(jid) = admin_jid(deps, &config).await {
        let _ = deps.channels.broadcast_host_message(&jid, "shutting down").await;
    }
    deps.queue.shutdown().await;
    tracing::info!("orchestrator shutdown sequence complete");
}
