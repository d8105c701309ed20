//! Telegram webhook: operator activity inside forum topics.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use time::OffsetDateTime;

use chatlink_core::{EngineError, OperatorAttachment, Platform};
use chatlink_hub::OperatorMessageRecord;

use crate::command::OperatorCommand;
use crate::{WebhookState, ok_body};

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramUpdate {
    #[serde(default)]
    message: Option<IncomingMessage>,
    #[serde(default)]
    edited_message: Option<IncomingMessage>,
    #[serde(default)]
    message_reaction: Option<MessageReaction>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    message_id: i64,
    date: i64,
    #[serde(default)]
    edit_date: Option<i64>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    message_thread_id: Option<i64>,
    #[serde(default)]
    reply_to_message: Option<Box<ReplyRef>>,
    #[serde(default)]
    photo: Option<Vec<PhotoSize>>,
    #[serde(default)]
    document: Option<TelegramFile>,
    #[serde(default)]
    voice: Option<TelegramFile>,
    #[serde(default)]
    audio: Option<TelegramFile>,
    #[serde(default)]
    video: Option<TelegramFile>,
}

#[derive(Debug, Deserialize)]
struct ReplyRef {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
    #[serde(default)]
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    file_id: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessageReaction {
    message_id: i64,
    date: i64,
    #[serde(default)]
    new_reaction: Vec<Reaction>,
}

#[derive(Debug, Deserialize)]
struct Reaction {
    #[serde(default)]
    emoji: Option<String>,
}

fn secret_token_valid(expected: Option<&str>, provided: Option<&str>) -> bool {
    match expected {
        Some(expected) => provided == Some(expected),
        None => true,
    }
}

fn unix(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

fn operator_display_name(user: Option<&TelegramUser>) -> Option<String> {
    let user = user?;
    let mut name = user.first_name.clone()?;
    if let Some(last) = &user.last_name {
        name.push(' ');
        name.push_str(last);
    }
    Some(name)
}

fn is_wastebasket(reaction: &MessageReaction) -> bool {
    reaction
        .new_reaction
        .iter()
        .any(|r| matches!(r.emoji.as_deref(), Some("\u{1F5D1}") | Some("\u{1F5D1}\u{FE0F}")))
}

pub(crate) async fn handle(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(update): Json<TelegramUpdate>,
) -> Response {
    let provided = headers
        .get("X-Telegram-Bot-Api-Secret-Token")
        .and_then(|v| v.to_str().ok());
    if !secret_token_valid(state.config.telegram_secret_token.as_deref(), provided) {
        tracing::warn!("telegram webhook rejected: bad secret token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if let Some(reaction) = update.message_reaction {
        if is_wastebasket(&reaction) {
            let result = state
                .hub
                .record_operator_delete(
                    Platform::Telegram,
                    &reaction.message_id.to_string(),
                    unix(reaction.date),
                )
                .await;
            log_outcome("reaction delete", result);
        }
        return ok_body().into_response();
    }

    if let Some(edited) = update.edited_message {
        let content = edited.text.or(edited.caption).unwrap_or_default();
        let result = state
            .hub
            .record_operator_edit(
                Platform::Telegram,
                &edited.message_id.to_string(),
                &content,
                edited.edit_date.and_then(unix),
            )
            .await;
        log_outcome("edit", result);
        return ok_body().into_response();
    }

    let Some(message) = update.message else {
        return ok_body().into_response();
    };
    if message.from.as_ref().is_some_and(|u| u.is_bot) {
        return ok_body().into_response();
    }

    if let Some(command) = message.text.as_deref().and_then(OperatorCommand::parse) {
        handle_command(&state, command, &message).await;
        return ok_body().into_response();
    }

    let Some(thread_id) = message.message_thread_id else {
        tracing::debug!(message = message.message_id, "telegram message outside a topic dropped");
        return ok_body().into_response();
    };
    let session_id = match state
        .hub
        .session_for_thread(Platform::Telegram, &thread_id.to_string())
        .await
    {
        Ok(Some(session_id)) => session_id,
        Ok(None) => {
            tracing::debug!(thread = thread_id, "telegram topic has no session");
            return ok_body().into_response();
        }
        Err(err) => {
            tracing::error!(error = %err, "session lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let attachments = collect_attachments(&state, &message).await;
    let record = OperatorMessageRecord {
        session_id,
        source: Platform::Telegram,
        platform_message_id: message.message_id.to_string(),
        content: message.text.clone().or(message.caption.clone()).unwrap_or_default(),
        operator_name: operator_display_name(message.from.as_ref()),
        attachments,
        reply_to_platform_id: message
            .reply_to_message
            .as_ref()
            .map(|r| r.message_id.to_string()),
    };
    log_outcome(
        "operator message",
        state.hub.record_operator_message(record).await.map(|_| ()),
    );
    ok_body().into_response()
}

async fn handle_command(state: &WebhookState, command: OperatorCommand, message: &IncomingMessage) {
    match command {
        OperatorCommand::Delete => {
            let Some(reply) = &message.reply_to_message else {
                tracing::debug!("/delete without a reply target ignored");
                return;
            };
            let result = state
                .hub
                .record_operator_delete(
                    Platform::Telegram,
                    &reply.message_id.to_string(),
                    unix(message.date),
                )
                .await;
            log_outcome("command delete", result);
        }
        OperatorCommand::Online => state.hub.set_operator_online(true).await,
        OperatorCommand::Offline => state.hub.set_operator_online(false).await,
        OperatorCommand::Status => {
            let text = if state.hub.is_operator_online() {
                "Operators are marked online."
            } else {
                "Operators are marked offline."
            };
            send_status_reply(state, message, text).await;
        }
    }
}

/// Answers a `/status` command in the thread it came from. Needs the bot
/// token; without one the command is logged and dropped.
async fn send_status_reply(state: &WebhookState, message: &IncomingMessage, text: &str) {
    let Some(token) = &state.config.telegram_bot_token else {
        tracing::debug!("status reply skipped: no bot token configured");
        return;
    };
    if state.config.telegram_api_base.starts_with("mock://") {
        return;
    }
    let mut body = serde_json::json!({ "text": text });
    if let Some(thread) = message.message_thread_id {
        body["message_thread_id"] = serde_json::json!(thread);
    }
    let url = format!("{}/bot{}/sendMessage", state.config.telegram_api_base, token);
    if let Err(err) = state.http.post(&url).json(&body).send().await {
        tracing::warn!(error = %err, "status reply failed");
    }
}

fn log_outcome(op: &str, result: Result<(), EngineError>) {
    match result {
        Ok(()) => {}
        Err(EngineError::MessageNotFound(id)) => {
            tracing::debug!(%id, "telegram {op} ignored: unknown message");
        }
        Err(err) => tracing::warn!(error = %err, "telegram {op} failed"),
    }
}

/// Pulls attached media through the two-step `getFile` flow. A failed
/// download still records the attachment with its platform file id so the
/// widget can show a placeholder.
async fn collect_attachments(
    state: &WebhookState,
    message: &IncomingMessage,
) -> Vec<OperatorAttachment> {
    let mut out = Vec::new();
    if let Some(sizes) = &message.photo {
        // Telegram sends every resolution; the last entry is the largest.
        if let Some(photo) = sizes.last() {
            out.push(
                build_attachment(
                    state,
                    &photo.file_id,
                    format!("photo_{}.jpg", message.message_id),
                    "image/jpeg".to_string(),
                    photo.file_size,
                )
                .await,
            );
        }
    }
    if let Some(doc) = &message.document {
        out.push(
            build_attachment(
                state,
                &doc.file_id,
                doc.file_name
                    .clone()
                    .unwrap_or_else(|| format!("document_{}", message.message_id)),
                doc.mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                doc.file_size,
            )
            .await,
        );
    }
    if let Some(voice) = &message.voice {
        out.push(
            build_attachment(
                state,
                &voice.file_id,
                format!("voice_{}.ogg", message.message_id),
                voice.mime_type.clone().unwrap_or_else(|| "audio/ogg".to_string()),
                voice.file_size,
            )
            .await,
        );
    }
    if let Some(audio) = &message.audio {
        out.push(
            build_attachment(
                state,
                &audio.file_id,
                audio
                    .file_name
                    .clone()
                    .unwrap_or_else(|| format!("audio_{}.mp3", message.message_id)),
                audio.mime_type.clone().unwrap_or_else(|| "audio/mpeg".to_string()),
                audio.file_size,
            )
            .await,
        );
    }
    if let Some(video) = &message.video {
        out.push(
            build_attachment(
                state,
                &video.file_id,
                format!("video_{}.mp4", message.message_id),
                video.mime_type.clone().unwrap_or_else(|| "video/mp4".to_string()),
                video.file_size,
            )
            .await,
        );
    }
    out
}

async fn build_attachment(
    state: &WebhookState,
    file_id: &str,
    filename: String,
    mime_type: String,
    file_size: Option<u64>,
) -> OperatorAttachment {
    let data = match download_file(state, file_id).await {
        Ok(data) => data,
        Err(err) => {
            tracing::warn!(file_id, error = %err, "telegram file download failed");
            Vec::new()
        }
    };
    OperatorAttachment {
        filename,
        mime_type,
        size: file_size.unwrap_or(data.len() as u64),
        data,
        url: None,
        bridge_file_id: Some(file_id.to_string()),
    }
}

async fn download_file(state: &WebhookState, file_id: &str) -> anyhow::Result<Vec<u8>> {
    let Some(token) = &state.config.telegram_bot_token else {
        anyhow::bail!("no bot token configured");
    };
    let base = &state.config.telegram_api_base;
    if base.starts_with("mock://") {
        return Ok(Vec::new());
    }

    let url = format!("{base}/bot{token}/getFile");
    let response: serde_json::Value = state
        .http
        .post(&url)
        .json(&serde_json::json!({ "file_id": file_id }))
        .send()
        .await?
        .json()
        .await?;
    let file_path = response["result"]["file_path"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("getFile returned no file_path"))?;

    let url = format!("{base}/file/bot{token}/{file_path}");
    let bytes = state.http.get(&url).send().await?.bytes().await?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_token_is_optional_but_checked_when_set() {
        assert!(secret_token_valid(None, None));
        assert!(secret_token_valid(None, Some("anything")));
        assert!(secret_token_valid(Some("s3cret"), Some("s3cret")));
        assert!(!secret_token_valid(Some("s3cret"), Some("wrong")));
        assert!(!secret_token_valid(Some("s3cret"), None));
    }

    #[test]
    fn wastebasket_reaction_detected_with_and_without_variant_selector() {
        let reaction = MessageReaction {
            message_id: 1,
            date: 0,
            new_reaction: vec![Reaction {
                emoji: Some("\u{1F5D1}\u{FE0F}".into()),
            }],
        };
        assert!(is_wastebasket(&reaction));

        let other = MessageReaction {
            message_id: 1,
            date: 0,
            new_reaction: vec![Reaction {
                emoji: Some("\u{1F44D}".into()),
            }],
        };
        assert!(!is_wastebasket(&other));
    }

    #[test]
    fn display_name_joins_first_and_last() {
        let user = TelegramUser {
            is_bot: false,
            first_name: Some("Dana".into()),
            last_name: Some("K".into()),
        };
        assert_eq!(operator_display_name(Some(&user)).as_deref(), Some("Dana K"));
        assert_eq!(operator_display_name(None), None);
    }

    #[test]
    fn update_parses_reaction_payload() {
        let update: TelegramUpdate = serde_json::from_value(serde_json::json!({
            "update_id": 7,
            "message_reaction": {
                "chat": { "id": -100 },
                "message_id": 999,
                "date": 1727000000,
                "new_reaction": [ { "type": "emoji", "emoji": "🗑️" } ]
            }
        }))
        .unwrap();
        let reaction = update.message_reaction.unwrap();
        assert_eq!(reaction.message_id, 999);
        assert!(is_wastebasket(&reaction));
    }
}
