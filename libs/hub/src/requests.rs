use serde::{Deserialize, Serialize};

use chatlink_core::{
    Attachment, Message, OperatorAttachment, Platform, Sender, SessionMetadata,
};

/// Widget connect call. Session resolution order: explicit `session_id`,
/// then the visitor's most recent session, then a fresh session.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub visitor_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<SessionMetadata>,
    /// Server-observed fields; these win over anything the client sent.
    #[serde(skip)]
    pub ip: Option<String>,
    #[serde(skip)]
    pub country: Option<String>,
    #[serde(skip)]
    pub city: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub session_id: String,
    pub visitor_id: String,
    pub resumed: bool,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub welcome_message: Option<String>,
    pub operator_online: bool,
    pub ai_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub session_id: String,
    pub content: String,
    pub sender: Sender,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
}

/// Operator message observed on a platform, normalized by the webhook layer.
#[derive(Debug)]
pub struct OperatorMessageRecord {
    pub session_id: String,
    pub source: Platform,
    /// Native id of the message on the source platform.
    pub platform_message_id: String,
    pub content: String,
    pub operator_name: Option<String>,
    pub attachments: Vec<OperatorAttachment>,
    /// Native id of the message this one replied to, when the platform
    /// reported one.
    pub reply_to_platform_id: Option<String>,
}
