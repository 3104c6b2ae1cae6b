//! Channel broadcast plane (§4.8): fan-out, host messages, agent-output
//! rendering, reactions/typing, and the outbound ledger.
//!
//! Grounded on `messaging/manager.rs`'s name-keyed registry, substantially
//! extended with `owns_jid` fan-out filtering and the streamed-event
//! rendering table §4.8 specifies.

use crate::channel::{format_outbound, Channel, ChannelDyn};
use crate::error::Result;
use crate::store::{LedgerStore, OutboundLedgerEntry, Store};
use crate::{ContainerEvent, MessageType};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const ASSISTANT_EMOJI: &str = "\u{1F99E}"; // lobster, matches the teacher's mascot-prefix idiom
const HOST_EMOJI: &str = "\u{1F3E0}";
const THINKING_EMOJI: &str = "\u{1F4AD}";
const TOOL_USE_EMOJI: &str = "\u{1F527}";
const TOOL_RESULT_EMOJI: &str = "\u{1F4CB}";
const SYSTEM_EMOJI: &str = "\u{2699}\u{FE0F}";
const READ_REACTION: &str = "\u{1F440}";

/// Did the last-seen event warrant revealing tool_result content (only true
/// right after an `ExitPlanMode` tool_use, per §4.8's rendering table).
#[derive(Default)]
struct StreamState {
    last_tool_name: Option<String>,
}

/// Fan-out registry plus per-chat streaming state.
pub struct BroadcastPlane {
    channels: Mutex<HashMap<String, Arc<dyn ChannelDyn>>>,
    ledger: LedgerStore,
    stream_state: Mutex<HashMap<String, StreamState>>,
    history_cursors: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl BroadcastPlane {
    pub fn new(ledger: LedgerStore) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            ledger,
            stream_state: Mutex::new(HashMap::new()),
            history_cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, channel: impl Channel) {
        let arc: Arc<dyn ChannelDyn> = Arc::new(channel);
        self.channels.lock().unwrap().insert(arc.name().to_string(), arc);
    }

    fn owning_channels(&self, jid: &str) -> Vec<Arc<dyn ChannelDyn>> {
        self.channels
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.owns_jid(jid))
            .cloned()
            .collect()
    }

    fn all_channels(&self) -> Vec<Arc<dyn ChannelDyn>> {
        self.channels.lock().unwrap().values().cloned().collect()
    }

    /// Fan text out to every channel that owns `chat_jid`, recording an
    /// outbound ledger entry for retry-on-reconnect (§4.8).
    pub async fn broadcast_to_channels(&self, chat_jid: &str, text: &str) -> Result<()> {
        let owners = self.owning_channels(chat_jid);
        let names: Vec<String> = owners.iter().map(|c| c.name().to_string()).collect();

        let entry = OutboundLedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            chat_jid: chat_jid.to_string(),
            content: text.to_string(),
            source: "agent".to_string(),
            intended_channels: names,
            delivered_channels: Vec::new(),
            attempt_count: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
        };
        self.ledger.record(&entry).await?;

        for channel in owners {
            let Some(rendered) = format_outbound(channel.prefix_assistant_name(), ASSISTANT_EMOJI, text) else {
                continue;
            };
            if channel.send_message(chat_jid, &rendered).await.is_ok() {
                self.ledger.mark_delivered(&entry.id, channel.name(), Utc::now()).await?;
            }
        }
        Ok(())
    }

    /// Host-originated notices (`🏠`-prefixed) fan out with the exact same
    /// text on every channel; no per-channel assistant-name prefix since
    /// the emoji already identifies the origin (§4.8).
    pub async fn broadcast_host_message(&self, chat_jid: &str, text: &str) -> Result<()> {
        let text = format!("{HOST_EMOJI} {text}");
        for channel in self.owning_channels(chat_jid) {
            let _ = channel.send_message(chat_jid, &text).await;
        }
        Ok(())
    }

    pub async fn send_reaction_to_channels(&self, chat_jid: &str, message_id: &str, emoji: &str) {
        for channel in self.owning_channels(chat_jid) {
            let _ = channel.send_reaction(chat_jid, message_id, emoji).await;
        }
    }

    pub async fn send_read_reaction(&self, chat_jid: &str, message_id: &str) {
        self.send_reaction_to_channels(chat_jid, message_id, READ_REACTION).await;
    }

    pub async fn set_typing_on_channels(&self, chat_jid: &str, typing: bool) {
        for channel in self.owning_channels(chat_jid) {
            let _ = channel.set_typing(chat_jid, typing).await;
        }
    }

    /// Ask the first registered channel that supports group creation to
    /// create one (§4.10 step 8 workspace reconciliation). Returns the new
    /// JID, or `None` if no registered channel can create groups.
    pub async fn create_group(&self, name: &str) -> Option<String> {
        for channel in self.all_channels() {
            if let Ok(Some(jid)) = channel.create_group(name).await {
                return Some(jid);
            }
        }
        None
    }

    /// Retry undelivered ledger entries for a channel that just reconnected
    /// (§4.8 Outbound ledger, §7 retries).
    pub async fn retry_undelivered(&self, channel_name: &str) -> Result<()> {
        let Some(channel) = self.channels.lock().unwrap().get(channel_name).cloned() else {
            return Ok(());
        };
        for entry in self.ledger.undelivered_for_channel(channel_name).await? {
            let Some(rendered) = format_outbound(channel.prefix_assistant_name(), ASSISTANT_EMOJI, &entry.content)
            else {
                continue;
            };
            if channel.send_message(&entry.chat_jid, &rendered).await.is_ok() {
                self.ledger.mark_delivered(&entry.id, channel_name, Utc::now()).await?;
            }
        }
        Ok(())
    }

    /// Every ~10s: ask each registered channel for messages it has seen,
    /// per workspace it owns, since that channel's last-checked cursor;
    /// backfill any the store is missing, then retry that channel's
    /// undelivered outbound entries (§4.2 channel history reconciliation).
    /// A cursor starts at the moment the channel/workspace pair is first
    /// seen, so this never backfills a channel's full history on first run.
    pub async fn reconcile_history(&self, store: &Store) -> Result<()> {
        let profiles = store.workspaces.list_profiles().await?;
        for channel in self.all_channels() {
            for profile in &profiles {
                let jid = profile.canonical_jid.as_ref();
                if !channel.owns_jid(jid) {
                    continue;
                }
                let key = (channel.name().to_string(), jid.to_string());
                let since = *self.history_cursors.lock().unwrap().entry(key.clone()).or_insert_with(Utc::now);
                let missed = channel.fetch_inbound_since(jid, &since.to_rfc3339()).await?;
                if missed.is_empty() {
                    continue;
                }
                let newest = missed.iter().map(|m| m.timestamp).max().unwrap_or(since);
                for message in &missed {
                    store.messages.append_if_absent(message).await?;
                }
                self.history_cursors.lock().unwrap().insert(key, newest);
            }
            self.retry_undelivered(channel.name()).await?;
        }
        Ok(())
    }

    /// Render one streamed container event (§4.8 rendering table). Returns
    /// whether anything was actually sent to the user, used by the pipeline
    /// to decide cursor-rollback safety on a failed run.
    pub async fn handle_streamed_output(&self, chat_jid: &str, event: &ContainerEvent) -> Result<bool> {
        match event {
            ContainerEvent::Thinking => {
                self.broadcast_to_channels(chat_jid, &format!("{THINKING_EMOJI} thinking..."))
                    .await?;
                Ok(true)
            }
            ContainerEvent::ToolUse { tool_name, tool_input } => {
                self.stream_state
                    .lock()
                    .unwrap()
                    .entry(chat_jid.to_string())
                    .or_default()
                    .last_tool_name = Some(tool_name.clone());
                let rendering = render_tool_input(tool_input);
                self.broadcast_to_channels(chat_jid, &format!("{TOOL_USE_EMOJI} {tool_name}: {rendering}"))
                    .await?;
                Ok(true)
            }
            ContainerEvent::ToolResult {
                tool_result_content, ..
            } => {
                let last_tool = self
                    .stream_state
                    .lock()
                    .unwrap()
                    .get(chat_jid)
                    .and_then(|s| s.last_tool_name.clone());
                if last_tool.as_deref() == Some("ExitPlanMode") {
                    self.broadcast_to_channels(chat_jid, tool_result_content).await?;
                } else {
                    self.broadcast_to_channels(chat_jid, &format!("{TOOL_RESULT_EMOJI} tool result"))
                        .await?;
                }
                Ok(true)
            }
            ContainerEvent::Text { .. } => {
                // Streaming text is buffered upstream; the final `result`
                // event is authoritative (§4.8 rendering table).
                Ok(false)
            }
            ContainerEvent::System { system_subtype, .. } => {
                if system_subtype == "init" {
                    return Ok(false);
                }
                self.broadcast_to_channels(chat_jid, &format!("{SYSTEM_EMOJI} {system_subtype}"))
                    .await?;
                Ok(true)
            }
            ContainerEvent::Result {
                result,
                result_metadata,
                error,
                ..
            } => {
                if let Some(err) = error {
                    self.broadcast_host_message(chat_jid, err).await?;
                    return Ok(false);
                }
                let Some(result) = result else { return Ok(false) };
                let sent = if let Some(host_text) = extract_host_tag(result) {
                    if !host_text.is_empty() {
                        self.broadcast_host_message(chat_jid, &host_text).await?;
                        true
                    } else {
                        false
                    }
                } else {
                    match crate::channel::strip_internal(result) {
                        Some(text) => {
                            self.broadcast_to_channels(chat_jid, &text).await?;
                            true
                        }
                        None => false,
                    }
                };
                if let Some(meta) = result_metadata {
                    self.broadcast_to_channels(
                        chat_jid,
                        &format!(
                            "\u{1F4CA} {:.4} USD \u{00B7} {}ms \u{00B7} {} turns",
                            meta.cost_usd, meta.duration_ms, meta.turns
                        ),
                    )
                    .await?;
                }
                Ok(sent)
            }
        }
    }
}

fn render_tool_input(input: &serde_json::Value) -> String {
    let rendered = input.to_string();
    if rendered.len() > 120 {
        format!("{}...", &rendered[..120])
    } else {
        rendered
    }
}

/// If `<host>...</host>` tags wrap the text, return the inner content
/// (possibly empty, meaning "emit nothing" per §4.8's rendering table).
fn extract_host_tag(text: &str) -> Option<String> {
    const OPEN: &str = "<host>";
    const CLOSE: &str = "</host>";
    let start = text.find(OPEN)?;
    let end = text.find(CLOSE)?;
    if start >= end {
        return None;
    }
    Some(text[start + OPEN.len()..end].trim().to_string())
}

/// Whether a batch of candidate messages is entirely system notices, in
/// which case the pipeline must not wake a sleeping agent (§4.2
/// "System-notice filtering").
pub fn is_all_system_notices(messages: &[crate::Message]) -> bool {
    !messages.is_empty() && messages.iter().all(|m| m.message_type == MessageType::System)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    async fn plane() -> BroadcastPlane {
        let store = Store::connect_in_memory().await.unwrap();
        BroadcastPlane::new(store.ledger.clone())
    }

    #[tokio::test]
    async fn broadcast_to_empty_registry_is_a_noop() {
        let plane = plane().await;
        plane.broadcast_to_channels("w1", "hi").await.unwrap();
    }

    #[test]
    fn extract_host_tag_returns_inner_text() {
        assert_eq!(
            extract_host_tag("<host>restarting</host>"),
            Some("restarting".to_string())
        );
        assert_eq!(extract_host_tag("no tags here"), None);
    }

    #[test]
    fn system_notice_batch_detection() {
        use crate::{Message, WorkspaceId};
        let notice = Message {
            id: "1".into(),
            chat_jid: WorkspaceId::from("w1"),
            sender_id: "system".into(),
            display_name: None,
            content: "clean rebase completed".into(),
            timestamp: Utc::now(),
            is_from_me: true,
            message_type: MessageType::System,
            metadata: None,
        };
        assert!(is_all_system_notices(&[notice.clone()]));

        let mut user = notice;
        user.message_type = MessageType::User;
        assert!(!is_all_system_notices(&[user]));
        assert!(!is_all_system_notices(&[]));
    }
}
