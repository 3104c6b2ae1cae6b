//! Top-level error types for Pynchy.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type. Each domain gets its own enum below; this type
/// only aggregates them so call sites can use `?` across module
/// boundaries without hand-rolled `From` impls at every seam.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found at {path}")]
    NotFound { path: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("workspace '{folder}' has no matching JID binding")]
    UnboundWorkspace { folder: String },

    #[error("more than one workspace is marked is_admin (found: {folders:?})")]
    MultipleAdmins { folders: Vec<String> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workspace profile not found for jid {jid}")]
    WorkspaceNotFound { jid: String },

    #[error("scheduled task {id} not found")]
    TaskNotFound { id: String },

    #[error("alias {alias} already bound to a different canonical jid")]
    AliasConflict { alias: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("malformed ipc file at {path}: {reason}")]
    MalformedFile { path: String, reason: String },

    #[error("unauthorized ipc request: {request_type} from non-admin workspace {folder}")]
    Unauthorized {
        request_type: String,
        folder: String,
    },

    #[error("ipc request '{request_type}' missing required field '{field}'")]
    MissingField {
        request_type: String,
        field: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn container process: {0}")]
    SpawnFailed(String),

    #[error("container timed out after {elapsed_secs}s (had_output={had_output})")]
    Timeout { elapsed_secs: u64, had_output: bool },

    #[error("container exited with code {code}: {stderr_tail}")]
    NonZeroExit { code: i32, stderr_tail: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("failed to create worktree at {path}")]
    CreateFailed { path: String },

    #[error("rebase of worktree/{folder} onto main produced a conflict")]
    MergeConflict { folder: String },

    #[error("push failed for worktree/{folder}: {reason}")]
    PushFailed { folder: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("channel '{channel}' failed to send to {jid}: {reason}")]
    SendFailed {
        channel: String,
        jid: String,
        reason: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid schedule_value '{value}' for schedule_type {schedule_type}")]
    InvalidSchedule {
        schedule_type: String,
        value: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("workspace {jid} already has an active process")]
    AlreadyActive { jid: String },

    #[error("workspace {jid} queue is shutting down")]
    ShuttingDown { jid: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
