//! Slack Events API webhook: operator replies in session threads.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

use chatlink_core::{EngineError, OperatorAttachment, Platform};
use chatlink_hub::OperatorMessageRecord;

use crate::{WebhookState, ok_body};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct SlackEnvelope {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    event: Option<SlackEvent>,
}

#[derive(Debug, Deserialize, Default)]
struct SlackEvent {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    deleted_ts: Option<String>,
    #[serde(default)]
    reaction: Option<String>,
    #[serde(default)]
    item: Option<SlackItem>,
    #[serde(default)]
    files: Option<Vec<SlackFile>>,
}

#[derive(Debug, Deserialize)]
struct SlackItem {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    url_private: Option<String>,
}

/// Verifies Slack's `v0` request signature against the signing secret.
pub fn verify_slack_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
    let timestamp = headers
        .get("X-Slack-Request-Timestamp")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let signature = headers
        .get("X-Slack-Signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if timestamp.is_empty() || signature.is_empty() {
        return false;
    }

    let base_string = format!("v0:{timestamp}:{}", String::from_utf8_lossy(body));
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(base_string.as_bytes());
    let expected = format!("v0={}", hex::encode(mac.finalize().into_bytes()));
    constant_time_eq(&expected, signature)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub(crate) async fn handle(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // URL verification happens while the endpoint is being registered,
    // before any signing handshake is meaningful.
    if let Ok(envelope) = serde_json::from_slice::<SlackEnvelope>(&body) {
        if envelope.kind.as_deref() == Some("url_verification") {
            return Json(json!({ "challenge": envelope.challenge })).into_response();
        }
    }

    if let Some(secret) = &state.config.slack_signing_secret {
        if !verify_slack_signature(secret, &headers, &body) {
            tracing::warn!("slack webhook rejected: bad signature");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let envelope: SlackEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(error = %err, "slack payload parse error");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if envelope.kind.as_deref() != Some("event_callback") {
        return ok_body().into_response();
    }
    let Some(event) = envelope.event else {
        return ok_body().into_response();
    };

    match handle_event(&state, event).await {
        Ok(()) => ok_body().into_response(),
        Err(EngineError::MessageNotFound(id)) => {
            tracing::debug!(%id, "slack event ignored: unknown message");
            ok_body().into_response()
        }
        Err(err) => {
            tracing::warn!(error = %err, "slack event handling failed");
            ok_body().into_response()
        }
    }
}

async fn handle_event(state: &WebhookState, event: SlackEvent) -> Result<(), EngineError> {
    if event.kind.as_deref() == Some("reaction_added") {
        return handle_reaction(state, &event).await;
    }
    if event.kind.as_deref() != Some("message") {
        return Ok(());
    }

    match event.subtype.as_deref() {
        Some("message_deleted") => {
            let Some(deleted_ts) = &event.deleted_ts else {
                return Ok(());
            };
            return state
                .hub
                .record_operator_delete(Platform::Slack, deleted_ts, None)
                .await;
        }
        // Slack reports bot-side edits too; inbound edits are not mirrored.
        Some("message_changed") => {
            tracing::debug!("slack message_changed dropped");
            return Ok(());
        }
        Some(other) if other != "file_share" => {
            tracing::debug!(subtype = other, "slack subtype dropped");
            return Ok(());
        }
        _ => {}
    }

    if let Some(bot_id) = &event.bot_id {
        if !state.config.allowed_bot_ids.iter().any(|id| id == bot_id) {
            tracing::debug!(%bot_id, "slack bot message dropped");
            return Ok(());
        }
    }

    // Operator replies live inside the session's thread; a top-level
    // channel message has no session to map to.
    let Some(thread_ts) = &event.thread_ts else {
        return Ok(());
    };
    let Some(ts) = &event.ts else {
        return Ok(());
    };
    let Some(session_id) = state
        .hub
        .session_for_thread(Platform::Slack, thread_ts)
        .await?
    else {
        tracing::debug!(thread = %thread_ts, "slack thread has no session");
        return Ok(());
    };

    let operator_name = match &event.user {
        Some(user_id) => lookup_user_name(state, user_id).await,
        None => None,
    };
    let attachments = collect_attachments(state, event.files.as_deref().unwrap_or(&[])).await;

    state
        .hub
        .record_operator_message(OperatorMessageRecord {
            session_id,
            source: Platform::Slack,
            platform_message_id: ts.clone(),
            content: event.text.unwrap_or_default(),
            operator_name,
            attachments,
            reply_to_platform_id: None,
        })
        .await?;
    Ok(())
}

/// A wastebasket reaction on a mirrored message deletes it everywhere.
async fn handle_reaction(state: &WebhookState, event: &SlackEvent) -> Result<(), EngineError> {
    if event.reaction.as_deref() != Some("wastebasket") {
        return Ok(());
    }
    let Some(item) = &event.item else {
        return Ok(());
    };
    if item.kind.as_deref() != Some("message") {
        return Ok(());
    }
    let Some(ts) = &item.ts else {
        return Ok(());
    };
    state
        .hub
        .record_operator_delete(Platform::Slack, ts, None)
        .await
}

/// Resolves the operator's display name via `users.info`. Failures fall
/// back to showing no name.
async fn lookup_user_name(state: &WebhookState, user_id: &str) -> Option<String> {
    let token = state.config.slack_bot_token.as_ref()?;
    if state.config.slack_api_base.starts_with("mock://") {
        return None;
    }
    let url = format!("{}/users.info", state.config.slack_api_base);
    let response: serde_json::Value = state
        .http
        .get(&url)
        .bearer_auth(token)
        .query(&[("user", user_id)])
        .send()
        .await
        .ok()?
        .json()
        .await
        .ok()?;
    if response["ok"].as_bool() != Some(true) {
        return None;
    }
    let user = &response["user"];
    user["profile"]["display_name"]
        .as_str()
        .filter(|name| !name.is_empty())
        .or_else(|| user["real_name"].as_str())
        .map(str::to_string)
}

/// Downloads shared files. Slack private URLs need the bot token as a
/// bearer header.
async fn collect_attachments(state: &WebhookState, files: &[SlackFile]) -> Vec<OperatorAttachment> {
    let mut out = Vec::new();
    for file in files {
        let data = match download_file(state, file).await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(file = ?file.name, error = %err, "slack file download failed");
                Vec::new()
            }
        };
        out.push(OperatorAttachment {
            filename: file.name.clone().unwrap_or_else(|| "file".to_string()),
            mime_type: file
                .mimetype
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: file.size.unwrap_or(data.len() as u64),
            data,
            url: None,
            bridge_file_id: None,
        });
    }
    out
}

async fn download_file(state: &WebhookState, file: &SlackFile) -> anyhow::Result<Vec<u8>> {
    let Some(token) = &state.config.slack_bot_token else {
        anyhow::bail!("no bot token configured");
    };
    let Some(url) = &file.url_private else {
        anyhow::bail!("file has no private url");
    };
    if state.config.slack_api_base.starts_with("mock://") {
        return Ok(Vec::new());
    }
    let bytes = state
        .http
        .get(url)
        .bearer_auth(token)
        .send()
        .await?
        .bytes()
        .await?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_headers(secret: &str, timestamp: &str, body: &[u8]) -> HeaderMap {
        let base_string = format!("v0:{timestamp}:{}", String::from_utf8_lossy(body));
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(base_string.as_bytes());
        let signature = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

        let mut headers = HeaderMap::new();
        headers.insert("X-Slack-Request-Timestamp", timestamp.parse().unwrap());
        headers.insert("X-Slack-Signature", signature.parse().unwrap());
        headers
    }

    #[test]
    fn accepts_a_valid_signature() {
        let body = br#"{"type":"event_callback"}"#;
        let headers = signed_headers("top-secret", "1700000000", body);
        assert!(verify_slack_signature("top-secret", &headers, body));
    }

    #[test]
    fn rejects_missing_or_wrong_signature() {
        assert!(!verify_slack_signature("secret", &HeaderMap::new(), b"{}"));

        let mut headers = HeaderMap::new();
        headers.insert("X-Slack-Request-Timestamp", "1".parse().unwrap());
        headers.insert("X-Slack-Signature", "v0=deadbeef".parse().unwrap());
        assert!(!verify_slack_signature("secret", &headers, b"{}"));
    }

    #[test]
    fn rejects_tampered_body() {
        let headers = signed_headers("secret", "1700000000", b"original");
        assert!(!verify_slack_signature("secret", &headers, b"tampered"));
    }

    #[test]
    fn constant_time_eq_detects_difference() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }

    #[test]
    fn envelope_parses_file_share_event() {
        let envelope: SlackEnvelope = serde_json::from_value(serde_json::json!({
            "type": "event_callback",
            "event": {
                "type": "message",
                "subtype": "file_share",
                "user": "U123",
                "ts": "1727000000.000200",
                "thread_ts": "1727000000.000100",
                "files": [
                    { "name": "screenshot.png", "mimetype": "image/png", "size": 2048,
                      "url_private": "https://files.slack.com/x" }
                ]
            }
        }))
        .unwrap();
        let event = envelope.event.unwrap();
        assert_eq!(event.subtype.as_deref(), Some("file_share"));
        assert_eq!(event.files.unwrap()[0].name.as_deref(), Some("screenshot.png"));
    }
}
