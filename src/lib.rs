//! Pynchy: a multi-channel chat-driven AI agent orchestrator.
//!
//! This crate owns the host-side orchestration pipeline only: per-workspace
//! serialization, inbound message routing, container agent spawning, the
//! file-based IPC bus, channel fan-out, the scheduler, and git worktree
//! coordination. It does not interpret what the container says; the
//! container is an opaque collaborator.

pub mod agent_run;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod worktree;

pub use error::{Error, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Canonical, channel-agnostic identifier for a workspace (a JID in the
/// original terminology). Cheap to clone, shared across tasks.
pub type WorkspaceId = Arc<str>;

/// Opaque session handle owned by the agent core; transparent to the host.
pub type SessionId = String;

/// Classifies who originated a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    System,
    Host,
    ToolResult,
}

impl MessageType {
    /// User-origin senders are the only ones the inbound pipeline dispatches
    /// on; everything else is internal bookkeeping or bot output.
    pub fn is_user_origin(self) -> bool {
        matches!(self, MessageType::User)
    }
}

/// An immutable message record as stored by the message store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_jid: WorkspaceId,
    pub sender_id: String,
    pub display_name: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
    pub message_type: MessageType,
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    /// A sender "looks like" a user identity if it contains '@' or matches
    /// one of the known non-agent system tokens (tui, deploy).
    pub fn is_user_origin(&self) -> bool {
        self.message_type.is_user_origin()
            && (self.sender_id.contains('@') || matches!(self.sender_id.as_str(), "tui" | "deploy"))
    }
}

/// One parsed container output event, as streamed across the
/// `---PYNCHY_OUTPUT_START---`/`---PYNCHY_OUTPUT_END---` marker protocol.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContainerEvent {
    Thinking,
    ToolUse {
        tool_name: String,
        tool_input: serde_json::Value,
    },
    ToolResult {
        tool_result_id: String,
        tool_result_content: String,
        tool_result_is_error: bool,
    },
    Text {
        text: String,
    },
    System {
        system_subtype: String,
        system_data: Option<serde_json::Value>,
    },
    Result {
        result: Option<String>,
        new_session_id: Option<String>,
        result_metadata: Option<ResultMetadata>,
        error: Option<String>,
    },
}

/// Cost/duration/turn summary attached to a final `result` event.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ResultMetadata {
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub turns: u32,
}

/// Dependency bundle threaded through every subsystem instead of a
/// back-pointer to the orchestrator. Cheap to clone: every field is an
/// `Arc` or similarly cheap handle.
#[derive(Clone)]
pub struct PynchyDeps {
    pub store: Arc<store::Store>,
    pub config: Arc<config::RuntimeConfig>,
    pub channels: Arc<broadcast::BroadcastPlane>,
    pub queue: Arc<queue::WorkspaceQueue>,
}
