//! Inbound pipeline and special-command interception (§4.2, §4.3).
//!
//! Grounded on `main.rs`'s `run()` inbound-message handling (resolve agent
//! via config, create-or-reuse channel, backfill history) for the polling
//! shape, and `acp::process`'s subprocess spawn/timeout/capture idiom for
//! the `!`-prefixed direct-shell interception.

use crate::agent_run::{self, AgentRunRequest, InputSource};
use crate::config::{Config, TriggerMode};
use crate::error::Result;
use crate::ipc::{self, WorkspaceIpcDir};
use crate::store::WorkspaceProfile;
use crate::{Message, MessageType, PynchyDeps, WorkspaceId};
use chrono::Utc;
use regex::Regex;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const SHELL_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// The small, explicit magic-command phrase table (§4.3). Implementation-
/// defined phrasing, made explicit here rather than scattered across
/// call sites.
struct MagicCommands {
    reset: Regex,
    end: Regex,
    redeploy: Regex,
}

impl MagicCommands {
    fn new() -> Self {
        Self {
            reset: Regex::new(r"(?i)^\s*reset context\s*$").unwrap(),
            end: Regex::new(r"(?i)^\s*end session\s*$").unwrap(),
            redeploy: Regex::new(r"(?i)^\s*redeploy\s*$").unwrap(),
        }
    }

    fn matches_any(&self, text: &str) -> bool {
        self.reset.is_match(text) || self.end.is_match(text) || self.redeploy.is_match(text) || text.starts_with('!')
    }
}

pub struct Pipeline {
    deps: PynchyDeps,
    magic: MagicCommands,
}

impl Pipeline {
    pub fn new(deps: PynchyDeps) -> Self {
        Self {
            deps,
            magic: MagicCommands::new(),
        }
    }

    /// One iteration of the polling loop (§4.2). Advances `last_timestamp`
    /// before any dispatch so a crash cannot re-deliver.
    pub async fn poll_once(&self) -> Result<()> {
        let since = self.deps.store.workspaces.last_timestamp().await?.unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let new_messages = self.deps.store.messages.new_messages_since(since).await?;
        if new_messages.is_empty() {
            return Ok(());
        }
        let newest = new_messages.iter().map(|m| m.timestamp).max().unwrap_or(since);
        self.deps.store.workspaces.set_last_timestamp(newest).await?;

        let mut batches: HashMap<WorkspaceId, Vec<Message>> = HashMap::new();
        for message in new_messages {
            let canonical = self.deps.store.workspaces.resolve_canonical(&message.chat_jid).await?;
            batches.entry(canonical).or_default().push(message);
        }

        for (canonical_jid, messages) in batches {
            if crate::broadcast::is_all_system_notices(&messages) {
                continue;
            }
            if let Err(e) = self.process_workspace_batch(&canonical_jid, messages).await {
                tracing::error!(jid = %canonical_jid, error = %e, "failed to process inbound batch");
            }
        }
        Ok(())
    }

    async fn process_workspace_batch(&self, canonical_jid: &WorkspaceId, messages: Vec<Message>) -> Result<()> {
        let Some(profile) = self.deps.store.workspaces.get_profile(canonical_jid).await? else {
            return Ok(());
        };
        let config = self.deps.config.current();
        let Some(resolved) = config.resolve_workspace(&profile.folder) else {
            return Ok(());
        };

        if !resolved.access.may_launch() {
            return Ok(());
        }

        let last_message = messages.last().expect("batch is non-empty").clone();
        let has_magic = self.magic.matches_any(last_message.content.trim());
        let trigger_required = crate::store::requires_trigger(profile.is_admin, resolved.trigger_mode);
        if trigger_required && !has_magic {
            let pattern = trigger_regex(&resolved.trigger_pattern);
            let triggered = messages.iter().any(|m| pattern.as_ref().map(|p| p.is_match(&m.content)).unwrap_or(false));
            if !triggered {
                return Ok(());
            }
        }

        if self
            .intercept_special_command(&profile, canonical_jid, &last_message)
            .await?
        {
            self.deps
                .store
                .workspaces
                .advance_agent_timestamp(canonical_jid, last_message.timestamp)
                .await?;
            return Ok(());
        }

        if self.deps.queue.is_active(canonical_jid).await {
            let ipc_dir = WorkspaceIpcDir::new(&config.ipc_dir(), &profile.folder);
            self.apply_interrupt_policy(&ipc_dir, canonical_jid, &last_message).await;
            return Ok(());
        }

        self.dispatch_to_agent(&profile, canonical_jid, &config).await
    }

    /// §4.1 interrupt policy. While a scheduled task owns the slot, a "btw "
    /// prefix forwards straight into its stdin without interrupting it, a
    /// "todo " prefix mutates the host-side todo list and leaves the task
    /// running, and anything else interrupts: pending tasks are dropped and
    /// the active process is killed so the new message can be dispatched
    /// fresh. While an ordinary message-driven run owns the slot, every
    /// message is just forwarded into its stdin, since there's no task to
    /// interrupt. Either way a recheck is queued for once the slot frees.
    async fn apply_interrupt_policy(&self, ipc_dir: &WorkspaceIpcDir, jid: &WorkspaceId, message: &Message) {
        let content = message.content.trim();

        if self.deps.queue.is_active_task(jid).await {
            if let Some(rest) = content.strip_prefix("btw ") {
                self.deps.queue.send_message(jid, rest.trim()).await;
                let _ = self
                    .deps
                    .channels
                    .broadcast_host_message(jid, &format!("forwarded to the running task: {}", rest.trim()))
                    .await;
            } else if let Some(item) = content.strip_prefix("todo ") {
                let item = item.trim();
                if ipc::append_todo(ipc_dir, item).await.is_ok() {
                    self.deps
                        .queue
                        .send_message(
                            jid,
                            &format!("[System notice — no response needed] User added a todo item to your list: {item}"),
                        )
                        .await;
                }
            } else {
                self.deps.queue.clear_pending_tasks(jid).await;
                self.deps.queue.stop_active_process(jid).await;
            }
            self.deps.queue.enqueue_message_check(jid).await;
            return;
        }

        let forward = content.strip_prefix("btw ").map(str::trim).unwrap_or(content);
        self.deps.queue.send_message(jid, forward).await;
        self.deps.queue.enqueue_message_check(jid).await;
    }

    async fn dispatch_to_agent(&self, profile: &WorkspaceProfile, jid: &WorkspaceId, config: &Config) -> Result<()> {
        let cursor = self.deps.store.workspaces.agent_timestamp(jid).await?;
        let messages = self.deps.store.messages.messages_since(jid, cursor).await?;
        if messages.is_empty() {
            return Ok(());
        }

        if let Some(last_user) = messages.iter().rev().find(|m| m.is_user_origin()) {
            self.deps.channels.send_read_reaction(jid, &last_user.id).await;
        }
        self.deps.channels.set_typing_on_channels(jid, true).await;

        let new_cursor = messages.iter().map(|m| m.timestamp).max().unwrap_or(Utc::now());
        self.deps.store.workspaces.advance_agent_timestamp(jid, new_cursor).await?;

        let request = AgentRunRequest {
            workspace: profile.clone(),
            chat_jid: jid.clone(),
            messages,
            is_scheduled_task: false,
            repo_access_override: None,
            input_source: InputSource::User,
            extra_system_notices: Vec::new(),
        };
        let outcome = agent_run::run_agent(&self.deps, config, request).await;
        self.deps.channels.set_typing_on_channels(jid, false).await;

        match outcome {
            Ok(result) if !result.sent_any_output && result.is_error => {
                self.deps.store.workspaces.advance_agent_timestamp(jid, cursor.unwrap_or(new_cursor)).await?;
                self.deps
                    .channels
                    .broadcast_host_message(jid, "the last run failed before sending a reply")
                    .await?;
            }
            Err(e) => {
                self.deps.store.workspaces.advance_agent_timestamp(jid, cursor.unwrap_or(new_cursor)).await?;
                self.deps.channels.broadcast_host_message(jid, &format!("run failed: {e}")).await?;
            }
            Ok(result) if !result.is_error => {
                self.spawn_worktree_publish(&profile.folder, jid, config);
            }
            _ => {}
        }
        Ok(())
    }

    /// §4.2 step 8: a successful run on a repo-access workspace publishes its
    /// worktree in the background, per the workspace's git policy (§4.7).
    /// Runs detached so a slow merge/push never holds up the next poll.
    fn spawn_worktree_publish(&self, folder: &str, jid: &WorkspaceId, config: &Config) {
        let Some(resolved) = config.resolve_workspace(folder) else {
            return;
        };
        if resolved.repo_access.is_none() {
            return;
        }
        let config = config.clone();
        let folder = folder.to_string();
        let jid = jid.clone();
        let channels = self.deps.channels.clone();
        let policy = resolved.git_policy;
        tokio::spawn(async move {
            if let Err(e) = crate::worktree::publish(&config, &folder, policy).await {
                tracing::warn!(folder = %folder, error = %e, "background worktree publish failed");
                let _ = channels.broadcast_host_message(&jid, &format!("worktree publish failed: {e}")).await;
            }
        });
    }

    /// §4.3. Returns `true` if the batch's last message was a special
    /// command and agent dispatch should be skipped.
    async fn intercept_special_command(
        &self,
        profile: &WorkspaceProfile,
        jid: &WorkspaceId,
        message: &Message,
    ) -> Result<bool> {
        let content = message.content.trim();

        if self.magic.reset.is_match(content) {
            self.deps.store.workspaces.clear_session(&profile.folder).await?;
            self.deps.store.workspaces.set_cleared_at(jid, Utc::now()).await?;
            self.deps.queue.enqueue_message_check(jid).await;
            self.deps.channels.broadcast_host_message(jid, "context reset").await?;
            return Ok(true);
        }

        if self.magic.end.is_match(content) {
            self.deps.store.workspaces.clear_session(&profile.folder).await?;
            return Ok(true);
        }

        if self.magic.redeploy.is_match(content) {
            // §4.3: the original triggers a manual redeploy via its deploy
            // orchestrator. No deploy executor ships in this core, so say
            // that plainly rather than implying a redeploy happened.
            tracing::warn!(jid = %jid, "redeploy requested but no deploy executor is wired up in this core");
            self.deps
                .channels
                .broadcast_host_message(jid, "redeploy requested, but this core has no deploy executor configured, so nothing will happen")
                .await?;
            return Ok(true);
        }

        if let Some(command) = content.strip_prefix('!') {
            self.run_direct_shell(profile, jid, command.trim()).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn run_direct_shell(&self, profile: &WorkspaceProfile, jid: &WorkspaceId, command: &str) -> Result<()> {
        let config = self.deps.config.current();
        let workdir = config.data_dir.join("workspaces").join(&profile.folder);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&workdir).stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = match timeout(SHELL_COMMAND_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                self.deps.channels.broadcast_to_channels(jid, &format!("\u{274C} failed to run command: {e}")).await?;
                return Ok(());
            }
            Err(_) => {
                self.deps.channels.broadcast_to_channels(jid, "\u{274C} command timed out after 30s").await?;
                return Ok(());
            }
        };

        let ok = output.status.success();
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        let record = Message {
            id: uuid::Uuid::new_v4().to_string(),
            chat_jid: jid.clone(),
            sender_id: "command_output".to_string(),
            display_name: None,
            content: text.clone(),
            timestamp: Utc::now(),
            is_from_me: true,
            message_type: MessageType::ToolResult,
            metadata: None,
        };
        self.deps.store.messages.append(&record).await?;

        let emoji = if ok { "\u{2705}" } else { "\u{274C}" };
        self.deps.channels.broadcast_to_channels(jid, &format!("{emoji} {text}")).await?;
        Ok(())
    }
}

fn trigger_regex(pattern: &str) -> Option<Regex> {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(pattern))).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_commands_recognize_exact_phrases_and_shell_prefix() {
        let magic = MagicCommands::new();
        assert!(magic.matches_any("reset context"));
        assert!(magic.matches_any("  End Session  "));
        assert!(magic.matches_any("redeploy"));
        assert!(magic.matches_any("!ls -la"));
        assert!(!magic.matches_any("hello there"));
    }

    #[test]
    fn trigger_regex_matches_word_boundaries() {
        let pattern = trigger_regex("@Bot").unwrap();
        assert!(pattern.is_match("hey @Bot can you help"));
        assert!(!pattern.is_match("@Botanist is cool"));
    }
}
