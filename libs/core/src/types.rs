use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Chat platforms a session can be mirrored onto.
///
/// ```
/// use chatlink_core::Platform;
/// assert_eq!(Platform::Telegram.as_str(), "telegram");
/// assert_eq!(Platform::parse("slack"), Some(Platform::Slack));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Discord,
    Slack,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::Discord => "discord",
            Platform::Slack => "slack",
        }
    }

    pub fn parse(s: &str) -> Option<Platform> {
        match s {
            "telegram" => Some(Platform::Telegram),
            "discord" => Some(Platform::Discord),
            "slack" => Some(Platform::Slack),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Visitor,
    Operator,
    Ai,
}

/// Delivery lifecycle of a message, monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentStatus {
    Pending,
    Uploading,
    Ready,
    Failed,
}

/// Identity a visitor attaches to a session via `identify`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl UserIdentity {
    /// Best display label for bridge-facing text.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Page, client and geo context captured when a widget connects.
///
/// The `ip`/`country`/`city` fields are filled in server-side and must
/// survive reconnects where the client resubmits its own metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

impl SessionMetadata {
    /// Overlays a client-supplied update onto existing metadata.
    ///
    /// Client-owned fields are replaced when the update carries a value.
    /// Server-populated geo fields (`ip`, `country`, `city`) are kept once
    /// set and only adopted from the update while still empty.
    pub fn apply_client_update(&mut self, update: &SessionMetadata) {
        macro_rules! take {
            ($field:ident) => {
                if update.$field.is_some() {
                    self.$field = update.$field.clone();
                }
            };
        }
        take!(url);
        take!(referrer);
        take!(page_title);
        take!(user_agent);
        take!(timezone);
        take!(language);
        take!(screen_resolution);
        take!(device_type);
        take!(browser);
        take!(os);
        if self.ip.is_none() {
            self.ip = update.ip.clone();
        }
        if self.country.is_none() {
            self.country = update.country.clone();
        }
        if self.city.is_none() {
            self.city = update.city.clone();
        }
    }
}

/// One visitor conversation, the canonical identity every mirror maps back to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub visitor_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<UserIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
    #[serde(default)]
    pub ai_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_phone: Option<String>,
}

impl Session {
    pub fn new(visitor_id: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Session {
            id: new_id(),
            visitor_id: visitor_id.into(),
            started_at: now,
            last_activity: now,
            identity: None,
            metadata: None,
            ai_active: false,
            user_phone: None,
        }
    }

    /// Short label for bridge-facing text: identity name, else visitor id.
    pub fn visitor_label(&self) -> &str {
        match &self.identity {
            Some(identity) => identity.label(),
            None => &self.visitor_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub status: AttachmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_file_id: Option<String>,
    /// Raw bytes when the file was pulled from a platform; never serialized.
    #[serde(skip)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub content: String,
    pub sender: Sender,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub read_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_name: Option<String>,
}

impl Message {
    pub fn new(session_id: impl Into<String>, content: impl Into<String>, sender: Sender) -> Self {
        Message {
            id: new_id(),
            session_id: session_id.into(),
            content: content.into(),
            sender,
            timestamp: OffsetDateTime::now_utc(),
            status: MessageStatus::Sent,
            attachments: Vec::new(),
            edited_at: None,
            deleted_at: None,
            delivered_at: None,
            read_at: None,
            reply_to_id: None,
            operator_name: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Application-defined event relayed through the engine (cart updates,
/// page transitions and the like).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEvent {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// Per-platform ids one canonical message maps to.
///
/// The mapping only ever grows: merging takes the incoming value for a
/// field when it is present and keeps the stored one otherwise, so bridges
/// reporting results concurrently cannot erase each other's ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessageIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_message_ts: Option<String>,
}

impl BridgeMessageIds {
    pub fn is_empty(&self) -> bool {
        self.telegram_message_id.is_none()
            && self.discord_message_id.is_none()
            && self.slack_message_ts.is_none()
    }

    /// Field-wise merge: `other`'s set fields win, absent fields never clear.
    pub fn merge_from(&mut self, other: &BridgeMessageIds) {
        if other.telegram_message_id.is_some() {
            self.telegram_message_id = other.telegram_message_id;
        }
        if other.discord_message_id.is_some() {
            self.discord_message_id = other.discord_message_id.clone();
        }
        if other.slack_message_ts.is_some() {
            self.slack_message_ts = other.slack_message_ts.clone();
        }
    }

    /// Builds a mapping holding one platform's native id.
    pub fn for_platform(platform: Platform, raw_id: &str) -> BridgeMessageIds {
        let mut ids = BridgeMessageIds::default();
        match platform {
            Platform::Telegram => ids.telegram_message_id = raw_id.parse().ok(),
            Platform::Discord => ids.discord_message_id = Some(raw_id.to_string()),
            Platform::Slack => ids.slack_message_ts = Some(raw_id.to_string()),
        }
        ids
    }

    /// The native id for one platform, stringified.
    pub fn id_for(&self, platform: Platform) -> Option<String> {
        match platform {
            Platform::Telegram => self.telegram_message_id.map(|id| id.to_string()),
            Platform::Discord => self.discord_message_id.clone(),
            Platform::Slack => self.slack_message_ts.clone(),
        }
    }
}

/// Hard cap on message content, matching the strictest platform limit.
pub const MAX_MESSAGE_LEN: usize = 4000;

/// Rejects empty and oversized message content.
pub fn validate_content(content: &str) -> Result<(), crate::EngineError> {
    if content.trim().is_empty() {
        return Err(crate::EngineError::EmptyContent);
    }
    let len = content.chars().count();
    if len > MAX_MESSAGE_LEN {
        return Err(crate::EngineError::ContentTooLong {
            len,
            max: MAX_MESSAGE_LEN,
        });
    }
    Ok(())
}

/// Fresh canonical id for sessions and messages.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
