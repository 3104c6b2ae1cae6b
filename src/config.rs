//! Configuration loading, validation, and hot reload.
//!
//! The on-disk document is TOML. Sections that can change without a
//! restart (workspace bindings, cron jobs) are exposed through
//! [`RuntimeConfig`], which wraps the parsed [`Config`] in an
//! [`arc_swap::ArcSwap`] and can be told to reload from disk at any time.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a workspace decides whether an inbound batch warrants launching a
/// container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Always,
    Mention,
}

/// Whether the workspace may launch a container at all, and whether the
/// agent-run pipeline should surface a repo worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    /// `read` and `write`-only workspaces never launch a container; only
    /// `read_write` does (§4.2 step 3).
    pub fn may_launch(self) -> bool {
        matches!(self, AccessMode::ReadWrite)
    }
}

/// How a workspace's worktree commits reach the main repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GitPolicy {
    MergeToMain,
    PullRequest,
}

impl Default for GitPolicy {
    fn default() -> Self {
        GitPolicy::MergeToMain
    }
}

fn default_trigger() -> String {
    "@Bot".to_string()
}

fn default_true() -> bool {
    true
}

/// One `[workspaces.<folder>]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default = "default_trigger_mode")]
    pub trigger: TriggerMode,
    #[serde(default = "default_trigger")]
    pub trigger_pattern: String,
    #[serde(default = "default_access_mode")]
    pub access: AccessMode,
    #[serde(default)]
    pub git_policy: GitPolicy,
    pub repo_access: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default)]
    pub additional_mounts: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
}

fn default_trigger_mode() -> TriggerMode {
    TriggerMode::Mention
}

fn default_access_mode() -> AccessMode {
    AccessMode::ReadWrite
}

/// Resolved, on-demand view of a workspace's effective policy. Separate
/// from `WorkspaceConfig` so callers don't need to know which fields are
/// raw document fields vs. derived ones.
#[derive(Debug, Clone)]
pub struct ResolvedWorkspaceConfig {
    pub trigger_mode: TriggerMode,
    pub trigger_pattern: String,
    pub access: AccessMode,
    pub git_policy: GitPolicy,
    pub repo_access: Option<String>,
    pub skills: Vec<String>,
}

impl From<&WorkspaceConfig> for ResolvedWorkspaceConfig {
    fn from(w: &WorkspaceConfig) -> Self {
        Self {
            trigger_mode: w.trigger,
            trigger_pattern: w.trigger_pattern.clone(),
            access: w.access,
            git_policy: w.git_policy,
            repo_access: w.repo_access.clone(),
            skills: w.skills.clone(),
        }
    }
}

/// One `[cron_jobs.<name>]` table. These are admin-only shell commands run
/// directly by the host, never inside a container (§4.9 "Host cron jobs").
#[derive(Debug, Clone, Deserialize)]
pub struct CronJobConfig {
    pub schedule: String,
    pub command: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host_job_timeout")]
    pub timeout_secs: u64,
}

fn default_host_job_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_message_poll_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntervalsSection {
    #[serde(default = "default_message_poll_ms")]
    pub message_poll_ms: u64,
}

impl Default for IntervalsSection {
    fn default() -> Self {
        Self {
            message_poll_ms: default_message_poll_ms(),
        }
    }
}

fn default_max_output_size() -> usize {
    10 * 1024 * 1024
}

fn default_container_timeout() -> u64 {
    600
}

fn default_idle_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSection {
    #[serde(default = "default_max_output_size")]
    pub max_output_size: usize,
    #[serde(default = "default_container_timeout")]
    pub container_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            max_output_size: default_max_output_size(),
            container_timeout_secs: default_container_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Ambient observability configuration. Not part of the original pipeline
/// spec; every Pynchy deployment still needs somewhere to point its traces.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingSection {
    pub otlp_endpoint: Option<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

fn default_sample_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    pub name: String,
    #[serde(default = "default_trigger")]
    pub default_trigger_pattern: String,
}

/// Raw document shape, deserialized directly from TOML before validation.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    agent: AgentSection,
    #[serde(default)]
    workspaces: HashMap<String, WorkspaceConfig>,
    #[serde(default)]
    cron_jobs: HashMap<String, CronJobConfig>,
    #[serde(default)]
    scheduler: SchedulerSection,
    #[serde(default)]
    intervals: IntervalsSection,
    #[serde(default)]
    container: ContainerSection,
    #[serde(default)]
    logging: LoggingSection,
    data_dir: Option<PathBuf>,
}

/// Validated Pynchy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub instance_dir: PathBuf,
    pub agent: AgentSection,
    pub workspaces: HashMap<String, WorkspaceConfig>,
    pub cron_jobs: HashMap<String, CronJobConfig>,
    pub scheduler: SchedulerSection,
    pub intervals: IntervalsSection,
    pub container: ContainerSection,
    pub logging: LoggingSection,
}

impl Config {
    /// Load and validate configuration from a TOML file on disk.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&text)
    }

    /// Parse and validate a configuration document already in memory.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let data_dir = raw.data_dir.clone().unwrap_or_else(default_data_dir);
        let instance_dir = data_dir.join("instance");

        let config = Config {
            data_dir,
            instance_dir,
            agent: raw.agent,
            workspaces: raw.workspaces,
            cron_jobs: raw.cron_jobs,
            scheduler: raw.scheduler,
            intervals: raw.intervals,
            container: raw.container,
            logging: raw.logging,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let admins: Vec<String> = self
            .workspaces
            .iter()
            .filter(|(_, w)| w.is_admin)
            .map(|(folder, _)| folder.clone())
            .collect();
        if admins.len() > 1 {
            return Err(ConfigError::MultipleAdmins { folders: admins }.into());
        }
        Ok(())
    }

    /// Resolve a workspace's effective policy. Returns `None` if the folder
    /// isn't configured.
    pub fn resolve_workspace(&self, folder: &str) -> Option<ResolvedWorkspaceConfig> {
        self.workspaces.get(folder).map(ResolvedWorkspaceConfig::from)
    }

    pub fn admin_folder(&self) -> Option<&str> {
        self.workspaces
            .iter()
            .find(|(_, w)| w.is_admin)
            .map(|(folder, _)| folder.as_str())
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("pynchy.db")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.data_dir.join("worktrees")
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.data_dir.join("ipc")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("pynchy"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Hot-reloadable handle to the current configuration. Subsystems hold an
/// `Arc<RuntimeConfig>` and call `.current()` each time they need a fresh
/// read rather than caching fields, so a reload takes effect on the next
/// access without restarting anything.
pub struct RuntimeConfig {
    path: PathBuf,
    live: arc_swap::ArcSwap<Config>,
}

impl RuntimeConfig {
    pub fn load(path: PathBuf) -> Result<Arc<Self>> {
        let config = Config::load_from_path(&path)?;
        Ok(Arc::new(Self {
            path,
            live: arc_swap::ArcSwap::from_pointee(config),
        }))
    }

    pub fn current(&self) -> Arc<Config> {
        self.live.load_full()
    }

    /// Re-read the config file from disk and swap it in. Invalid documents
    /// are rejected and the previous config stays live; the caller is
    /// responsible for surfacing the error (e.g. a host broadcast).
    pub fn reload(&self) -> Result<()> {
        let config = Config::load_from_path(&self.path)?;
        self.live.store(Arc::new(config));
        tracing::info!(path = %self.path.display(), "configuration reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let doc = r#"
            [agent]
            name = "pynchy"

            [workspaces.admin]
            name = "Admin"
            is_admin = true
        "#;
        let config = Config::parse(doc).unwrap();
        assert_eq!(config.agent.name, "pynchy");
        assert_eq!(config.admin_folder(), Some("admin"));
        assert_eq!(config.scheduler.poll_interval_secs, 30);
    }

    #[test]
    fn rejects_multiple_admins() {
        let doc = r#"
            [agent]
            name = "pynchy"

            [workspaces.a]
            name = "A"
            is_admin = true

            [workspaces.b]
            name = "B"
            is_admin = true
        "#;
        let err = Config::parse(doc).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::MultipleAdmins { .. })
        ));
    }

    #[test]
    fn read_write_workspace_may_launch() {
        assert!(AccessMode::ReadWrite.may_launch());
        assert!(!AccessMode::Read.may_launch());
        assert!(!AccessMode::Write.may_launch());
    }
}
