//! Bridge capability surface and the built-in platform adapters.
//!
//! A bridge mirrors one chat session onto one platform. Every method has a
//! no-op default so adapters only implement what their platform supports;
//! the hub calls the whole surface without caring which capabilities exist.

mod discord;
mod slack;
mod telegram;
mod threads;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;

use chatlink_core::{
    BridgeError, BridgeMessageIds, CustomEvent, Message, MessageStatus, Platform, Session,
};

pub use discord::{DiscordBridge, DiscordConfig, DiscordMode};
pub use slack::{SlackBridge, SlackConfig, SlackMode};
pub use telegram::{TelegramBridge, TelegramConfig};
pub use threads::ThreadIndex;

/// Outcome of mirroring a visitor message onto one platform.
#[derive(Debug, Default)]
pub struct BridgeMessageResult {
    /// Platform-native id(s) of the mirror, merged into the id-mapping store.
    pub ids: Option<BridgeMessageIds>,
    /// Raw platform response, kept for diagnostics.
    pub raw: Option<Value>,
}

/// One platform mirror of the canonical session stream.
///
/// Returned errors never abort the overall dispatch; the hub logs them and
/// keeps going with the remaining bridges.
#[async_trait]
pub trait Bridge: Send + Sync {
    fn platform(&self) -> Platform;

    /// Stable name used for echo suppression (`source_bridge` comparisons).
    fn name(&self) -> &'static str {
        self.platform().as_str()
    }

    /// A new session started; create the platform-side thread or topic and
    /// announce the visitor.
    async fn on_new_session(&self, _session: &Session) -> Result<(), BridgeError> {
        Ok(())
    }

    /// Mirror a visitor message. `reply` carries the platform ids of the
    /// message being replied to, when known.
    async fn on_visitor_message(
        &self,
        _message: &Message,
        _session: &Session,
        _reply: Option<&BridgeMessageIds>,
    ) -> Result<BridgeMessageResult, BridgeError> {
        Ok(BridgeMessageResult::default())
    }

    /// Relay an operator message that originated on another platform.
    /// Implementations must return without side effects when
    /// `source_bridge == self.name()`.
    async fn on_operator_message(
        &self,
        _message: &Message,
        _session: &Session,
        _source_bridge: &str,
        _operator_name: Option<&str>,
    ) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn on_message_read(
        &self,
        _session_id: &str,
        _message_ids: &[String],
        _status: MessageStatus,
    ) -> Result<(), BridgeError> {
        Ok(())
    }

    /// Propagate an edit. Returns the ids that were touched, or `None` when
    /// this platform holds no mirror of the message.
    async fn on_message_edit(
        &self,
        _session_id: &str,
        _message_id: &str,
        _content: &str,
        _edited_at: OffsetDateTime,
    ) -> Result<Option<BridgeMessageIds>, BridgeError> {
        Ok(None)
    }

    /// Propagate a delete. `Ok(true)` means the mirror is gone, including
    /// the case where the platform already deleted it; `Ok(false)` means
    /// there was no mirror to remove.
    async fn on_message_delete(
        &self,
        _session_id: &str,
        _message_id: &str,
        _deleted_at: OffsetDateTime,
    ) -> Result<bool, BridgeError> {
        Ok(false)
    }

    async fn on_custom_event(
        &self,
        _event: &CustomEvent,
        _session: &Session,
    ) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn on_identity_update(&self, _session: &Session) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn on_typing(&self, _session_id: &str, _typing: bool) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn on_ai_takeover(&self, _session: &Session, _reason: &str) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn on_session_closed(&self, _session: &Session) -> Result<(), BridgeError> {
        Ok(())
    }
}

pub type SharedBridge = Arc<dyn Bridge>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    #[async_trait]
    impl Bridge for Minimal {
        fn platform(&self) -> Platform {
            Platform::Discord
        }
    }

    #[tokio::test]
    async fn defaults_are_inert() {
        let bridge = Minimal;
        assert_eq!(bridge.name(), "discord");
        let session = Session::new("v-1");
        bridge.on_new_session(&session).await.unwrap();
        let now = OffsetDateTime::now_utc();
        assert!(!bridge.on_message_delete("s", "m", now).await.unwrap());
        assert!(bridge.on_message_edit("s", "m", "x", now).await.unwrap().is_none());
        let res = bridge
            .on_visitor_message(
                &Message::new("s", "hi", chatlink_core::Sender::Visitor),
                &session,
                None,
            )
            .await
            .unwrap();
        assert!(res.ids.is_none());
    }
}
