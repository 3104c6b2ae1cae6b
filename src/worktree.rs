//! Per-workspace git worktree management and publish policy (§4.7).
//!
//! Shells out to `git`/`gh` the same way `acp/process.rs` shells out to the
//! agent-core subprocess: piped stdio, captured output, a bounded wait. No
//! new process-spawning idiom is introduced for this module.

use crate::config::{Config, GitPolicy};
use crate::error::{Result, WorktreeError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Where a workspace's worktree lives and what the container should mount.
pub struct WorktreeResolution {
    pub worktree_path: PathBuf,
    pub git_dir: PathBuf,
    pub advisory_notices: Vec<String>,
}

fn worktree_path(config: &Config, folder: &str) -> PathBuf {
    config.worktrees_dir().join(folder)
}

fn main_repo_dir(config: &Config) -> PathBuf {
    config.data_dir.join("repo")
}

async fn run_git(repo_dir: &Path, args: &[&str]) -> Result<(bool, String)> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok((output.status.success(), combined))
}

/// Resolve (creating or repairing as needed) the worktree for a repo-access
/// workspace. Called both at startup reconciliation and on every agent run
/// so a container never sees a stale or dangling worktree (§4.7
/// Reconciliation).
pub async fn resolve(config: &Config, folder: &str) -> Result<WorktreeResolution> {
    let main_repo = main_repo_dir(config);
    let wt_path = worktree_path(config, folder);
    let branch = format!("worktree/{folder}");
    let mut notices = Vec::new();

    if !wt_path.exists() {
        let (ok, output) = run_git(
            &main_repo,
            &[
                "worktree",
                "add",
                "-B",
                &branch,
                wt_path.to_str().unwrap_or_default(),
                "main",
            ],
        )
        .await?;
        if !ok {
            return Err(WorktreeError::CreateFailed {
                path: wt_path.display().to_string(),
            }
            .into());
        }
    } else {
        let (ok, _) = run_git(&wt_path, &["rev-parse", "--is-inside-work-tree"]).await?;
        if !ok {
            // The worktree directory exists but no longer points at a valid
            // checkout (e.g. the main repo's .git/worktrees entry was
            // pruned). Repair by re-adding.
            let _ = run_git(&main_repo, &["worktree", "remove", "--force", wt_path.to_str().unwrap_or_default()]).await;
            let (ok, _) = run_git(
                &main_repo,
                &["worktree", "add", "-B", &branch, wt_path.to_str().unwrap_or_default(), "main"],
            )
            .await?;
            if !ok {
                return Err(WorktreeError::CreateFailed {
                    path: wt_path.display().to_string(),
                }
                .into());
            }
            notices.push(format!("worktree for {folder} was repaired after a stale reference"));
        }

        let (dirty_ok, dirty_out) = run_git(&wt_path, &["status", "--porcelain"]).await?;
        if dirty_ok && !dirty_out.trim().is_empty() {
            notices.push(format!(
                "worktree for {folder} has uncommitted changes that survived a prior container exit"
            ));
        }

        let (rebase_ok, rebase_out) = run_git(&wt_path, &["rebase", "main"]).await?;
        if !rebase_ok {
            let _ = run_git(&wt_path, &["rebase", "--abort"]).await;
            notices.push(format!(
                "worktree for {folder} could not be rebased onto main: {}",
                rebase_out.lines().last().unwrap_or_default()
            ));
        }
    }

    let git_dir = main_repo.join(".git").join("worktrees").join(folder);
    Ok(WorktreeResolution {
        worktree_path: wt_path,
        git_dir,
        advisory_notices: notices,
    })
}

/// §4.7 Publish policy, run after an agent success when the workspace has
/// repo access.
pub async fn publish(config: &Config, folder: &str, policy: GitPolicy) -> Result<()> {
    let wt_path = worktree_path(config, folder);
    let branch = format!("worktree/{folder}");

    match policy {
        GitPolicy::MergeToMain => {
            let main_repo = main_repo_dir(config);
            let (merge_ok, merge_out) = run_git(&main_repo, &["merge", "--no-ff", &branch]).await?;
            if !merge_ok {
                let _ = run_git(&main_repo, &["merge", "--abort"]).await;
                return Err(WorktreeError::MergeConflict {
                    folder: folder.to_string(),
                }
                .into());
            }
            let (push_ok, push_out) = run_git(&main_repo, &["push", "origin", "main"]).await?;
            if !push_ok {
                return Err(WorktreeError::PushFailed {
                    folder: folder.to_string(),
                    reason: push_out,
                }
                .into());
            }
            tracing::info!(folder, merge_output = %merge_out, "merged worktree to main");
            // Other worktrees are notified out-of-band by the orchestrator,
            // which owns the full workspace list this module doesn't see.
        }
        GitPolicy::PullRequest => {
            let (push_ok, push_out) = run_git(&wt_path, &["push", "-u", "origin", &branch]).await?;
            if !push_ok {
                return Err(WorktreeError::PushFailed {
                    folder: folder.to_string(),
                    reason: push_out,
                }
                .into());
            }
            let (exists, _) = run_git(&wt_path, &["rev-parse", &format!("origin/{branch}")]).await?;
            let _ = exists;
            let _ = Command::new("gh")
                .args(["pr", "create", "--fill", "--head", &branch])
                .current_dir(&wt_path)
                .output()
                .await;
        }
    }
    Ok(())
}

/// Handle a container-requested `sync_worktree_to_main` IPC request: publish
/// per policy and write the blocking response file the container polls
/// (§4.5 container-requested sync, §4.7).
pub async fn handle_sync_request(
    config: &Config,
    folder: &str,
    policy: GitPolicy,
    request_id: &str,
) -> Result<()> {
    let ipc_dir = crate::ipc::WorkspaceIpcDir::new(&config.ipc_dir(), folder);
    let result = publish(config, folder, policy).await;
    let body = serde_json::json!({
        "ok": result.is_ok(),
        "error": result.as_ref().err().map(|e| e.to_string()),
    });
    crate::ipc::write_atomic(
        &ipc_dir.merge_results_dir(),
        &format!("{request_id}.json"),
        body.to_string().as_bytes(),
    )
    .await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_path_is_scoped_under_worktrees_dir() {
        let config = Config::parse(
            r#"
            [agent]
            name = "pynchy"

            [workspaces.team]
            name = "Team"
        "#,
        )
        .unwrap();
        let path = worktree_path(&config, "team");
        assert!(path.ends_with("worktrees/team"));
    }
}
