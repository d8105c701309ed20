//! Discord interactions webhook: slash commands from the operator channel.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use chatlink_core::Platform;
use chatlink_hub::OperatorMessageRecord;

use crate::WebhookState;

const PING: u8 = 1;
const APPLICATION_COMMAND: u8 = 2;

// Interaction response types.
const PONG: u8 = 1;
const CHANNEL_MESSAGE: u8 = 4;
const EPHEMERAL: u64 = 64;

#[derive(Debug, Deserialize)]
pub(crate) struct Interaction {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    data: Option<InteractionData>,
    #[serde(default)]
    member: Option<GuildMember>,
    #[serde(default)]
    user: Option<DiscordUser>,
}

#[derive(Debug, Deserialize)]
struct InteractionData {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    options: Vec<CommandOption>,
}

#[derive(Debug, Deserialize)]
struct CommandOption {
    name: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GuildMember {
    #[serde(default)]
    nick: Option<String>,
    #[serde(default)]
    user: Option<DiscordUser>,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

fn respond(content: &str, ephemeral: bool) -> Json<serde_json::Value> {
    let mut data = json!({ "content": content });
    if ephemeral {
        data["flags"] = json!(EPHEMERAL);
    }
    Json(json!({ "type": CHANNEL_MESSAGE, "data": data }))
}

fn operator_name(interaction: &Interaction) -> Option<String> {
    if let Some(member) = &interaction.member {
        if let Some(nick) = &member.nick {
            return Some(nick.clone());
        }
        if let Some(user) = &member.user {
            return user.global_name.clone().or_else(|| user.username.clone());
        }
    }
    interaction
        .user
        .as_ref()
        .and_then(|user| user.global_name.clone().or_else(|| user.username.clone()))
}

fn string_option<'a>(data: &'a InteractionData, name: &str) -> Option<&'a str> {
    data.options
        .iter()
        .find(|option| option.name == name)
        .and_then(|option| option.value.as_str())
}

pub(crate) async fn handle(
    State(state): State<WebhookState>,
    Json(interaction): Json<Interaction>,
) -> Response {
    if interaction.kind == PING {
        return Json(json!({ "type": PONG })).into_response();
    }
    if interaction.kind != APPLICATION_COMMAND {
        return respond("Pong", false).into_response();
    }

    let Some(data) = &interaction.data else {
        return respond("Pong", false).into_response();
    };
    match data.name.as_deref() {
        Some("reply") => handle_reply(&state, &interaction, data).await,
        Some("delete") => handle_delete(&state, data).await,
        Some("online") => {
            state.hub.set_operator_online(true).await;
            respond("Marked operators online.", true).into_response()
        }
        Some("offline") => {
            state.hub.set_operator_online(false).await;
            respond("Marked operators offline.", true).into_response()
        }
        Some("status") => {
            let text = if state.hub.is_operator_online() {
                "Operators are marked online."
            } else {
                "Operators are marked offline."
            };
            respond(text, true).into_response()
        }
        _ => respond("Pong", false).into_response(),
    }
}

/// `/reply message:<text>` inside a session thread.
async fn handle_reply(
    state: &WebhookState,
    interaction: &Interaction,
    data: &InteractionData,
) -> Response {
    let Some(content) = string_option(data, "message") else {
        return respond("Usage: /reply message:<text>", true).into_response();
    };
    let Some(channel_id) = &interaction.channel_id else {
        return respond("This command only works inside a session thread.", true).into_response();
    };

    let session_id = match state
        .hub
        .session_for_thread(Platform::Discord, channel_id)
        .await
    {
        Ok(Some(session_id)) => session_id,
        Ok(None) => {
            return respond("No active session in this thread.", true).into_response();
        }
        Err(err) => {
            tracing::error!(error = %err, "session lookup failed");
            return respond("Internal error, try again.", true).into_response();
        }
    };

    let record = OperatorMessageRecord {
        session_id,
        source: Platform::Discord,
        platform_message_id: interaction
            .id
            .clone()
            .unwrap_or_else(chatlink_core::new_id),
        content: content.to_string(),
        operator_name: operator_name(interaction),
        attachments: Vec::new(),
        reply_to_platform_id: None,
    };
    match state.hub.record_operator_message(record).await {
        Ok(_) => respond("\u{2705} Message sent to visitor", false).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "discord reply failed");
            respond("Failed to deliver the message.", true).into_response()
        }
    }
}

/// `/delete message_id:<id>` removes an earlier operator message.
async fn handle_delete(state: &WebhookState, data: &InteractionData) -> Response {
    let Some(message_id) = string_option(data, "message_id") else {
        return respond("Usage: /delete message_id:<id>", true).into_response();
    };
    match state
        .hub
        .record_operator_delete(Platform::Discord, message_id, None)
        .await
    {
        Ok(()) => respond("Message deleted.", true).into_response(),
        Err(err) => {
            tracing::debug!(error = %err, "discord delete failed");
            respond("No such message.", true).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_name_prefers_nick_then_global_name() {
        let interaction: Interaction = serde_json::from_value(json!({
            "type": 2,
            "member": {
                "nick": "Support Dana",
                "user": { "global_name": "Dana", "username": "dana_k" }
            }
        }))
        .unwrap();
        assert_eq!(operator_name(&interaction).as_deref(), Some("Support Dana"));

        let interaction: Interaction = serde_json::from_value(json!({
            "type": 2,
            "user": { "username": "dana_k" }
        }))
        .unwrap();
        assert_eq!(operator_name(&interaction).as_deref(), Some("dana_k"));
    }

    #[test]
    fn string_option_finds_named_value() {
        let data: InteractionData = serde_json::from_value(json!({
            "name": "reply",
            "options": [ { "name": "message", "value": "hello there" } ]
        }))
        .unwrap();
        assert_eq!(string_option(&data, "message"), Some("hello there"));
        assert_eq!(string_option(&data, "missing"), None);
    }
}
