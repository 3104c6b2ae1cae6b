//! The `Channel` capability set (§4.8, §9 dynamic dispatch design note).
//!
//! A static trait for type-safe adapters plus a dyn-compatible companion
//! for storage as `Arc<dyn ChannelDyn>`, matching the teacher's
//! `Messaging`/`MessagingDyn` pair in `messaging/traits.rs`. Optional
//! capabilities (typing, reactions, streaming, history reconciliation,
//! group creation, ask-user) get default no-op bodies so the broadcast
//! plane can treat their presence as a plain capability check rather than
//! probing for an attribute at runtime.

use crate::error::Result;
use std::pin::Pin;

/// A message id returned by a channel that supports streaming updates
/// (`post_message`/`update_message`).
pub type ChannelMessageId = String;

/// Static trait for channel adapters. Prefer this for concrete
/// implementations; it avoids boxing every future.
pub trait Channel: Send + Sync + 'static {
    /// Stable name used as the registry key and in log lines.
    fn name(&self) -> &str;

    /// Whether this channel should prefix outbound text with the
    /// assistant's name (§4.8 `format_outbound`).
    fn prefix_assistant_name(&self) -> bool {
        false
    }

    fn connect(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    fn disconnect(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    fn reconnect(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    fn is_connected(&self) -> bool;

    /// Whether this channel is the owner of a given chat JID; the broadcast
    /// plane fans out only to channels for which this returns true.
    fn owns_jid(&self, jid: &str) -> bool;

    fn send_message(&self, jid: &str, text: &str) -> impl std::future::Future<Output = Result<()>> + Send;

    fn set_typing(&self, _jid: &str, _typing: bool) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    fn send_reaction(
        &self,
        _jid: &str,
        _message_id: &str,
        _emoji: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Post a new message and return its id, for channels that support
    /// editing a message in place as streamed content grows.
    fn post_message(
        &self,
        _jid: &str,
        _text: &str,
    ) -> impl std::future::Future<Output = Result<Option<ChannelMessageId>>> + Send {
        async { Ok(None) }
    }

    fn update_message(
        &self,
        _jid: &str,
        _message_id: &str,
        _text: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Reconciliation support: messages this channel has seen since
    /// `since_iso`, for backfilling the store after a missed delivery.
    fn fetch_inbound_since(
        &self,
        _jid: &str,
        _since_iso: &str,
    ) -> impl std::future::Future<Output = Result<Vec<crate::Message>>> + Send {
        async { Ok(Vec::new()) }
    }

    fn create_group(
        &self,
        _name: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>>> + Send {
        async { Ok(None) }
    }

    fn send_ask_user(
        &self,
        _jid: &str,
        _request_id: &str,
        _questions: &[String],
    ) -> impl std::future::Future<Output = Result<Option<ChannelMessageId>>> + Send {
        async { Ok(None) }
    }
}

/// Dyn-compatible companion trait. Every `Channel` implementor gets this
/// for free via the blanket impl below, the same way the teacher derives
/// `MessagingDyn` from `Messaging`.
pub trait ChannelDyn: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn prefix_assistant_name(&self) -> bool;
    fn is_connected(&self) -> bool;
    fn owns_jid(&self, jid: &str) -> bool;

    fn connect<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
    fn disconnect<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
    fn reconnect<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
    fn send_message<'a>(
        &'a self,
        jid: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
    fn set_typing<'a>(
        &'a self,
        jid: &'a str,
        typing: bool,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
    fn send_reaction<'a>(
        &'a self,
        jid: &'a str,
        message_id: &'a str,
        emoji: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
    fn post_message<'a>(
        &'a self,
        jid: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Option<ChannelMessageId>>> + Send + 'a>>;
    fn update_message<'a>(
        &'a self,
        jid: &'a str,
        message_id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
    fn fetch_inbound_since<'a>(
        &'a self,
        jid: &'a str,
        since_iso: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<crate::Message>>> + Send + 'a>>;
    fn create_group<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Option<String>>> + Send + 'a>>;
}

impl<T: Channel> ChannelDyn for T {
    fn name(&self) -> &str {
        Channel::name(self)
    }

    fn prefix_assistant_name(&self) -> bool {
        Channel::prefix_assistant_name(self)
    }

    fn is_connected(&self) -> bool {
        Channel::is_connected(self)
    }

    fn owns_jid(&self, jid: &str) -> bool {
        Channel::owns_jid(self, jid)
    }

    fn connect<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Channel::connect(self))
    }

    fn disconnect<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Channel::disconnect(self))
    }

    fn reconnect<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Channel::reconnect(self))
    }

    fn send_message<'a>(
        &'a self,
        jid: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Channel::send_message(self, jid, text))
    }

    fn set_typing<'a>(
        &'a self,
        jid: &'a str,
        typing: bool,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Channel::set_typing(self, jid, typing))
    }

    fn send_reaction<'a>(
        &'a self,
        jid: &'a str,
        message_id: &'a str,
        emoji: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Channel::send_reaction(self, jid, message_id, emoji))
    }

    fn post_message<'a>(
        &'a self,
        jid: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Option<ChannelMessageId>>> + Send + 'a>> {
        Box::pin(Channel::post_message(self, jid, text))
    }

    fn update_message<'a>(
        &'a self,
        jid: &'a str,
        message_id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Channel::update_message(self, jid, message_id, text))
    }

    fn fetch_inbound_since<'a>(
        &'a self,
        jid: &'a str,
        since_iso: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<crate::Message>>> + Send + 'a>> {
        Box::pin(Channel::fetch_inbound_since(self, jid, since_iso))
    }

    fn create_group<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(Channel::create_group(self, name))
    }
}

/// Strip an `<internal>...</internal>`-wrapped span from outbound text
/// (§4.8 `format_outbound`). Returns `None` if stripping leaves nothing.
pub fn strip_internal(text: &str) -> Option<String> {
    const OPEN: &str = "<internal>";
    const CLOSE: &str = "</internal>";
    let stripped = if let (Some(start), Some(end)) = (text.find(OPEN), text.find(CLOSE)) {
        if start < end {
            let mut out = String::with_capacity(text.len());
            out.push_str(&text[..start]);
            out.push_str(&text[end + CLOSE.len()..]);
            out
        } else {
            text.to_string()
        }
    } else {
        text.to_string()
    };
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Per-channel outbound formatting (§4.8 `format_outbound`, §8 invariant 4).
/// The only allowed differences between channels are the assistant-name
/// prefix and chunking; post-strip content must otherwise be identical.
pub fn format_outbound(prefix_assistant_name: bool, assistant_emoji: &str, text: &str) -> Option<String> {
    let stripped = strip_internal(text)?;
    if prefix_assistant_name {
        Some(format!("{assistant_emoji} {stripped}"))
    } else {
        Some(stripped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_internal_removes_wrapped_span() {
        assert_eq!(
            strip_internal("before <internal>secret</internal> after"),
            Some("before  after".to_string())
        );
    }

    #[test]
    fn strip_internal_only_content_yields_none() {
        assert_eq!(strip_internal("<internal>only this</internal>"), None);
    }

    #[test]
    fn strip_internal_passthrough_when_absent() {
        assert_eq!(strip_internal("plain text"), Some("plain text".to_string()));
    }

    #[test]
    fn format_outbound_prefixes_only_when_declared() {
        assert_eq!(
            format_outbound(true, "\u{1F99E}", "hello"),
            Some("\u{1F99E} hello".to_string())
        );
        assert_eq!(format_outbound(false, "\u{1F99E}", "hello"), Some("hello".to_string()));
    }
}
