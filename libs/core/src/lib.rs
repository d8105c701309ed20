//! Core types shared across the Chatlink bridge engine.
//!
//! Everything here is plain data: sessions, messages, the per-platform
//! message-id mapping, and the two error shapes the rest of the workspace
//! builds on (`BridgeError` for platform adapters, `EngineError` for
//! orchestrator-level failures).

mod error;
mod events;
mod types;
mod useragent;

pub use error::{BridgeError, EngineError};
pub use events::{OperatorAttachment, WidgetEvent};
pub use types::{
    Attachment, AttachmentStatus, BridgeMessageIds, CustomEvent, MAX_MESSAGE_LEN, Message,
    MessageStatus, Platform, Sender, Session, SessionMetadata, UserIdentity, new_id,
    validate_content,
};
pub use useragent::{DeviceInfo, parse_user_agent};
