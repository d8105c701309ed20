use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope broadcast to connected widget sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl WidgetEvent {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        WidgetEvent {
            kind: kind.into(),
            data,
        }
    }
}

/// File an operator attached on a platform, already downloaded and
/// normalized by the webhook layer.
#[derive(Debug, Clone)]
pub struct OperatorAttachment {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub data: Vec<u8>,
    pub url: Option<String>,
    pub bridge_file_id: Option<String>,
}
