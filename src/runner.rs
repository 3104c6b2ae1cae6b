//! Container runner (§4.4): spawns the per-turn agent container, streams its
//! marker-delimited stdout into parsed events, and applies the idle/hard
//! timeout and final-result policy.
//!
//! Grounded on `acp/process.rs`'s subprocess mechanics: `Stdio::piped()` +
//! `kill_on_drop`, a graceful-stop-then-kill shutdown, and a tail buffer for
//! stderr capture on failure. The ACP JSON-RPC framing itself is replaced by
//! the `---PYNCHY_OUTPUT_START---`/`---PYNCHY_OUTPUT_END---` marker protocol
//! §4.4/§6 specify.

use crate::config::Config;
use crate::error::{Result, RunnerError};
use crate::ContainerEvent;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout as tokio_timeout;

const OUTPUT_START: &str = "---PYNCHY_OUTPUT_START---";
const OUTPUT_END: &str = "---PYNCHY_OUTPUT_END---";
const GRACEFUL_STOP_BOUND: Duration = Duration::from_secs(15);

/// §4.4 input contract, serialized to the container's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInput {
    pub messages: Vec<serde_json::Value>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_admin: bool,
    pub session_id: Option<String>,
    pub is_scheduled_task: bool,
    pub system_notices: Vec<String>,
    pub repo_access: Option<String>,
    pub agent_core_module: String,
    pub agent_core_class: String,
    pub agent_core_config: Option<serde_json::Value>,
    pub plugin_mcp_servers: std::collections::HashMap<String, String>,
}

/// One bind mount in the volume-mount list §4.4 specifies.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeMount {
    fn rw(host: PathBuf, container: impl Into<String>) -> Self {
        Self {
            host_path: host,
            container_path: container.into(),
            read_only: false,
        }
    }

    fn ro(host: PathBuf, container: impl Into<String>) -> Self {
        Self {
            host_path: host,
            container_path: container.into(),
            read_only: true,
        }
    }
}

/// Parameters for one container launch, collected by the agent-run pipeline
/// before calling [`run`].
pub struct LaunchSpec {
    pub folder: String,
    pub is_admin: bool,
    pub repo_access: bool,
    pub worktree_path: Option<PathBuf>,
    pub main_git_dir: Option<PathBuf>,
    pub additional_mounts: Vec<String>,
}

/// Build the §4.4 volume-mount list for one launch.
pub fn build_mounts(config: &Config, spec: &LaunchSpec) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();
    let workspace_dir = config.data_dir.join("workspaces").join(&spec.folder);
    mounts.push(VolumeMount::rw(workspace_dir, "/workspace/group"));

    if !spec.is_admin {
        mounts.push(VolumeMount::ro(config.data_dir.join("global"), "/workspace/global"));
    }

    if spec.repo_access {
        if let Some(worktree) = &spec.worktree_path {
            mounts.push(VolumeMount::rw(worktree.clone(), "/workspace/project"));
        }
        if let Some(git_dir) = &spec.main_git_dir {
            mounts.push(VolumeMount::rw(git_dir.clone(), git_dir.to_string_lossy().into_owned()));
        }
    }

    let claude_dir = config.data_dir.join("workspaces").join(&spec.folder).join(".claude");
    mounts.push(VolumeMount::rw(claude_dir, "/home/agent/.claude"));

    let ipc_dir = config.ipc_dir().join(&spec.folder);
    mounts.push(VolumeMount::rw(ipc_dir, "/workspace/ipc"));

    mounts.push(VolumeMount::ro(config.data_dir.join("scripts"), "/workspace/scripts"));
    mounts.push(VolumeMount::ro(config.data_dir.join("env-dir"), "/workspace/env-dir"));
    mounts.push(VolumeMount::ro(config.data_dir.join("agent-src"), "/app/src"));

    if spec.is_admin {
        let repo_config = config.data_dir.join("config.toml");
        if repo_config.exists() {
            mounts.push(VolumeMount::rw(repo_config, "/workspace/config.toml"));
        }
    }

    for extra in &spec.additional_mounts {
        if let Some((host, container)) = extra.split_once(':') {
            mounts.push(VolumeMount::rw(PathBuf::from(host), container));
        }
    }

    mounts
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    status: String,
    #[serde(flatten)]
    event: ContainerEvent,
}

/// Outcome of a full container run.
pub struct RunOutcome {
    pub status: RunStatus,
    pub new_session_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RunStatus {
    Success,
    Error,
}

/// Spawn the container, stream parsed events to `on_output`, and apply the
/// timeout + final-result policy (§4.4).
pub async fn run(
    config: &Config,
    folder: &str,
    input: &ContainerInput,
    mounts: &[VolumeMount],
    mut on_output: impl FnMut(ContainerEvent) + Send,
) -> Result<RunOutcome> {
    let container_name = format!(
        "pynchy-{folder}-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    );

    let mut cmd = Command::new("docker");
    cmd.arg("run")
        .arg("--rm")
        .arg("-i")
        .arg("--name")
        .arg(&container_name);
    for mount in mounts {
        let mode = if mount.read_only { "ro" } else { "rw" };
        cmd.arg("-v").arg(format!(
            "{}:{}:{mode}",
            mount.host_path.display(),
            mount.container_path
        ));
    }
    cmd.arg("pynchy-agent-runner");
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child: Child = cmd
        .spawn()
        .map_err(|e| RunnerError::SpawnFailed(e.to_string()))?;

    let input_json = serde_json::to_vec(input).map_err(|e| RunnerError::SpawnFailed(e.to_string()))?;
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&input_json).await;
        let _ = stdin.shutdown().await;
    }

    let idle_timeout = Duration::from_secs(config.container.idle_timeout_secs);
    let hard_timeout = Duration::from_secs(
        config
            .container
            .container_timeout_secs
            .max(config.container.idle_timeout_secs + 30),
    );
    let max_output_size = config.container.max_output_size;

    let stdout = child.stdout.take().expect("stdout piped");
    let mut reader = BufReader::new(stdout).lines();

    let start = Instant::now();
    let mut buffer = String::new();
    let mut last_session_id: Option<String> = None;
    let mut saw_any_event = false;
    let mut timed_out = false;

    loop {
        if start.elapsed() >= hard_timeout {
            timed_out = true;
            break;
        }
        let remaining = hard_timeout.saturating_sub(start.elapsed()).min(idle_timeout);
        match tokio_timeout(remaining, reader.next_line()).await {
            Ok(Ok(Some(line))) => {
                if line == OUTPUT_START {
                    buffer.clear();
                    continue;
                }
                if line == OUTPUT_END {
                    if let Ok(raw) = serde_json::from_str::<RawEvent>(&buffer) {
                        saw_any_event = true;
                        if let ContainerEvent::System {
                            system_subtype,
                            system_data,
                        } = &raw.event
                        {
                            if system_subtype == "init" {
                                if let Some(sid) = system_data
                                    .as_ref()
                                    .and_then(|v| v.get("session_id"))
                                    .and_then(|v| v.as_str())
                                {
                                    last_session_id = Some(sid.to_string());
                                }
                            }
                        }
                        if let ContainerEvent::Result { new_session_id, .. } = &raw.event {
                            if new_session_id.is_some() {
                                last_session_id = new_session_id.clone();
                            }
                        }
                        let _ = &raw.status;
                        on_output(raw.event);
                    }
                    buffer.clear();
                    continue;
                }
                if buffer.len() + line.len() <= max_output_size {
                    buffer.push_str(&line);
                }
            }
            Ok(Ok(None)) => break, // stdout closed: process exited
            Ok(Err(_)) => break,
            Err(_) => {
                // idle timeout elapsed with no line; keep looping until the
                // hard timeout check above trips, matching the single
                // rolling-timer model (§4.4).
                if start.elapsed() >= hard_timeout {
                    timed_out = true;
                    break;
                }
            }
        }
    }

    let (exit_code, stderr_tail) = if timed_out {
        stop_gracefully(&mut child).await;
        (None, String::new())
    } else {
        let status = child.wait().await.ok();
        let stderr_tail = read_stderr_tail(&mut child).await;
        (status.and_then(|s| s.code()), stderr_tail)
    };

    let outcome = if timed_out && saw_any_event {
        RunOutcome {
            status: RunStatus::Success,
            new_session_id: last_session_id,
            error: None,
        }
    } else if timed_out {
        RunOutcome {
            status: RunStatus::Error,
            new_session_id: None,
            error: Some(format!("timed out after {}s", hard_timeout.as_secs())),
        }
    } else if exit_code.unwrap_or(0) != 0 {
        let tail: String = stderr_tail.chars().rev().take(200).collect::<String>().chars().rev().collect();
        RunOutcome {
            status: RunStatus::Error,
            new_session_id: None,
            error: Some(format!("code {}: {tail}", exit_code.unwrap_or(-1))),
        }
    } else {
        RunOutcome {
            status: RunStatus::Success,
            new_session_id: last_session_id,
            error: None,
        }
    };

    write_run_log(config, folder, &container_name, start.elapsed(), exit_code, &outcome).await;

    Ok(outcome)
}

async fn stop_gracefully(child: &mut Child) {
    if let Some(id) = child.id() {
        unsafe {
            libc::kill(id as i32, libc::SIGTERM);
        }
    }
    let _ = tokio_timeout(GRACEFUL_STOP_BOUND, child.wait()).await;
    let _ = child.start_kill();
}

async fn read_stderr_tail(child: &mut Child) -> String {
    let Some(stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut reader = BufReader::new(stderr).lines();
    let mut out = String::new();
    while let Ok(Some(line)) = reader.next_line().await {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

async fn write_run_log(
    config: &Config,
    folder: &str,
    container_name: &str,
    duration: Duration,
    exit_code: Option<i32>,
    outcome: &RunOutcome,
) {
    let logs_dir = config.data_dir.join("workspaces").join(folder).join("logs");
    if tokio::fs::create_dir_all(&logs_dir).await.is_err() {
        return;
    }
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let path = logs_dir.join(format!("container-{ts}.log"));
    let verbose = outcome.status == RunStatus::Error;
    let body = if verbose {
        format!(
            "group={folder} container={container_name} duration={:?} exit_code={:?}\nstatus={:?} error={:?}\n",
            duration, exit_code, outcome.status, outcome.error
        )
    } else {
        format!("group={folder} container={container_name} duration={:?} exit_code={:?}\n", duration, exit_code)
    };
    let _ = tokio::fs::write(path, body).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::parse(
            r#"
            [agent]
            name = "pynchy"

            [workspaces.admin]
            name = "Admin"
            is_admin = true
        "#,
        )
        .unwrap()
    }

    #[test]
    fn non_admin_workspace_gets_global_readonly_mount() {
        let config = test_config();
        let spec = LaunchSpec {
            folder: "team".into(),
            is_admin: false,
            repo_access: false,
            worktree_path: None,
            main_git_dir: None,
            additional_mounts: vec![],
        };
        let mounts = build_mounts(&config, &spec);
        let global = mounts.iter().find(|m| m.container_path == "/workspace/global");
        assert!(global.is_some());
        assert!(global.unwrap().read_only);
    }

    #[test]
    fn admin_workspace_has_no_global_mount() {
        let config = test_config();
        let spec = LaunchSpec {
            folder: "admin".into(),
            is_admin: true,
            repo_access: false,
            worktree_path: None,
            main_git_dir: None,
            additional_mounts: vec![],
        };
        let mounts = build_mounts(&config, &spec);
        assert!(!mounts.iter().any(|m| m.container_path == "/workspace/global"));
    }

    #[test]
    fn repo_access_adds_project_mount() {
        let config = test_config();
        let spec = LaunchSpec {
            folder: "team".into(),
            is_admin: false,
            repo_access: true,
            worktree_path: Some(PathBuf::from("/data/worktrees/team")),
            main_git_dir: Some(PathBuf::from("/data/repo/.git/worktrees/team")),
            additional_mounts: vec![],
        };
        let mounts = build_mounts(&config, &spec);
        assert!(mounts.iter().any(|m| m.container_path == "/workspace/project"));
    }
}
