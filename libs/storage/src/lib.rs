//! Storage contract for sessions, messages and the message-id mapping.
//!
//! Backends are pluggable behind [`Storage`]; the engine ships with the
//! dashmap-backed [`MemoryStorage`].

mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;

use chatlink_core::{BridgeMessageIds, Message, Session};

pub use memory::MemoryStorage;

/// Persistence surface the hub talks to.
///
/// `save_bridge_ids` must merge field-wise into any existing mapping for
/// the message (set fields win, absent fields are preserved) and must be
/// atomic per message id so concurrent bridge results cannot clobber each
/// other.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_session(&self, session: &Session) -> anyhow::Result<()>;
    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<Session>>;
    /// Latest session for a visitor by `last_activity`.
    async fn find_session_by_visitor(&self, visitor_id: &str) -> anyhow::Result<Option<Session>>;
    async fn update_session(&self, session: &Session) -> anyhow::Result<()>;
    async fn delete_session(&self, session_id: &str) -> anyhow::Result<()>;

    async fn save_message(&self, message: &Message) -> anyhow::Result<()>;
    async fn get_message(&self, message_id: &str) -> anyhow::Result<Option<Message>>;
    /// Messages of a session in insertion order, optionally only those after
    /// the given message id, capped at `limit`.
    async fn get_messages(
        &self,
        session_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<Message>>;
    async fn update_message(&self, message: &Message) -> anyhow::Result<()>;

    async fn save_bridge_ids(&self, message_id: &str, ids: &BridgeMessageIds)
    -> anyhow::Result<()>;
    async fn get_bridge_ids(&self, message_id: &str) -> anyhow::Result<Option<BridgeMessageIds>>;

    /// Drops sessions idle since before `cutoff`, returning how many went.
    async fn cleanup_sessions(&self, cutoff: OffsetDateTime) -> anyhow::Result<usize>;
}

pub type SharedStorage = Arc<dyn Storage>;
