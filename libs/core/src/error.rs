use serde_json::Value;

/// Failure reported by a platform adapter.
///
/// Carries a stable machine code (`"telegram.api"`, `"discord.http"`, ...),
/// whether a retry is worthwhile, and an optional backoff hint taken from
/// the platform response. Displays as `code: message`.
#[derive(Debug)]
pub struct BridgeError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub backoff_ms: Option<u64>,
    pub details: Option<Value>,
    source: Option<anyhow::Error>,
}

impl BridgeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError {
            code: code.into(),
            message: message.into(),
            retryable: false,
            backoff_ms: None,
            details: None,
            source: None,
        }
    }

    pub fn with_retry(mut self, backoff_ms: Option<u64>) -> Self {
        self.retryable = true;
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|err| err.as_ref() as _)
    }
}

/// Orchestrator-level failures callers are expected to match on.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("identity id is required")]
    IdentityIdRequired,
    #[error("message content is empty")]
    EmptyContent,
    #[error("message content too long: {len} chars (max {max})")]
    ContentTooLong { len: usize, max: usize },
    #[error("message does not belong to session {0}")]
    SessionMismatch(String),
    #[error("only visitor messages can be modified from the widget")]
    NotVisitorMessage,
    #[error("message already deleted: {0}")]
    MessageDeleted(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_error_displays_code_and_message() {
        let err = BridgeError::new("slack.api", "channel_not_found").with_retry(Some(1_000));
        assert_eq!(err.to_string(), "slack.api: channel_not_found");
        assert!(err.retryable);
        assert_eq!(err.backoff_ms, Some(1_000));
    }

    #[test]
    fn bridge_error_keeps_source_chain() {
        let err = BridgeError::new("telegram.http", "request failed")
            .with_source(anyhow::anyhow!("connection reset"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("connection reset"));
    }
}
