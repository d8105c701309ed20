//! Discord adapter. Bot mode drives a channel with one thread per session;
//! webhook mode posts flat into whatever channel the webhook targets.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use chatlink_core::{
    BridgeError, BridgeMessageIds, CustomEvent, Message, Platform, Session,
};
use chatlink_storage::SharedStorage;

use crate::{Bridge, BridgeMessageResult, ThreadIndex};

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

const COLOR_SESSION: i64 = 0x00D4AA;
const COLOR_EVENT: i64 = 0x5865F2;
const COLOR_IDENTITY: i64 = 0x57F287;
const COLOR_AI: i64 = 0xFEE75C;

#[derive(Debug, Clone)]
pub enum DiscordMode {
    Bot { bot_token: String, channel_id: String },
    /// Incoming webhook; no thread management, edit/delete go through the
    /// webhook's own message endpoints.
    Webhook { url: String },
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub mode: DiscordMode,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub api_base: String,
}

impl DiscordConfig {
    pub fn bot(bot_token: impl Into<String>, channel_id: impl Into<String>) -> Self {
        DiscordConfig {
            mode: DiscordMode::Bot {
                bot_token: bot_token.into(),
                channel_id: channel_id.into(),
            },
            username: None,
            avatar_url: None,
            api_base: DISCORD_API_BASE.to_string(),
        }
    }

    pub fn webhook(url: impl Into<String>) -> Self {
        DiscordConfig {
            mode: DiscordMode::Webhook { url: url.into() },
            username: None,
            avatar_url: None,
            api_base: DISCORD_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

pub struct DiscordBridge {
    http: reqwest::Client,
    config: DiscordConfig,
    threads: Arc<ThreadIndex>,
    storage: SharedStorage,
    mock_seq: AtomicI64,
}

impl DiscordBridge {
    pub fn new(
        http: reqwest::Client,
        config: DiscordConfig,
        threads: Arc<ThreadIndex>,
        storage: SharedStorage,
    ) -> Self {
        DiscordBridge {
            http,
            config,
            threads,
            storage,
            mock_seq: AtomicI64::new(1),
        }
    }

    fn is_mock(&self) -> bool {
        self.config.api_base.starts_with("mock://")
    }

    fn bot(&self) -> Option<(&str, &str)> {
        match &self.config.mode {
            DiscordMode::Bot {
                bot_token,
                channel_id,
            } => Some((bot_token.as_str(), channel_id.as_str())),
            DiscordMode::Webhook { .. } => None,
        }
    }

    /// Channel a session's messages live in: its thread when bound, else the
    /// configured channel.
    fn session_channel(&self, session_id: &str) -> Option<String> {
        self.threads
            .thread_for(Platform::Discord, session_id)
            .or_else(|| self.bot().map(|(_, channel)| channel.to_string()))
    }

    async fn request(
        &self,
        method: Method,
        url: String,
        payload: Option<&Value>,
    ) -> Result<(u16, Value), BridgeError> {
        if self.is_mock() {
            let seq = self.mock_seq.fetch_add(1, Ordering::Relaxed);
            return Ok((200, json!({ "id": seq.to_string() })));
        }

        let mut req = self.http.request(method, url);
        if let Some((token, _)) = self.bot() {
            req = req.header("Authorization", format!("Bot {token}"));
        }
        if let Some(payload) = payload {
            req = req.json(payload);
        }
        let response = req.send().await.map_err(net)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(net)?;
        let value = serde_json::from_str(&body).unwrap_or(Value::Null);
        Ok((status, value))
    }

    fn base_payload(&self) -> Value {
        let mut payload = json!({});
        if let Some(username) = &self.config.username {
            payload["username"] = json!(username);
        }
        if let Some(avatar) = &self.config.avatar_url {
            payload["avatar_url"] = json!(avatar);
        }
        payload
    }

    /// Posts a message into the session's channel and returns the Discord id.
    async fn send(
        &self,
        session_id: &str,
        content: Option<String>,
        embeds: Option<Value>,
        reply_to: Option<&str>,
    ) -> Result<Option<String>, BridgeError> {
        let mut payload = self.base_payload();
        if let Some(content) = content {
            payload["content"] = json!(content);
        }
        if let Some(embeds) = embeds {
            payload["embeds"] = embeds;
        }
        if let Some(reply_to) = reply_to {
            payload["message_reference"] = json!({ "message_id": reply_to });
        }

        let url = match &self.config.mode {
            DiscordMode::Bot { .. } => {
                let channel = self
                    .session_channel(session_id)
                    .ok_or_else(|| BridgeError::new("discord.config", "no channel configured"))?;
                format!(
                    "{}/channels/{}/messages",
                    self.config.api_base.trim_end_matches('/'),
                    channel
                )
            }
            DiscordMode::Webhook { url } => format!("{url}?wait=true"),
        };

        let (status, body) = self.request(Method::POST, url, Some(&payload)).await?;
        if status >= 400 {
            return Err(api_error(status, &body));
        }
        Ok(body.get("id").and_then(Value::as_str).map(str::to_string))
    }

    /// URL of one already-posted message, honoring bot vs webhook mode.
    fn message_url(&self, session_id: &str, discord_id: &str) -> Option<String> {
        match &self.config.mode {
            DiscordMode::Bot { .. } => {
                let channel = self.session_channel(session_id)?;
                Some(format!(
                    "{}/channels/{}/messages/{}",
                    self.config.api_base.trim_end_matches('/'),
                    channel,
                    discord_id
                ))
            }
            DiscordMode::Webhook { url } => Some(format!("{url}/messages/{discord_id}")),
        }
    }

    async fn stored_ids(&self, message_id: &str) -> Result<Option<BridgeMessageIds>, BridgeError> {
        self.storage
            .get_bridge_ids(message_id)
            .await
            .map_err(|err| {
                BridgeError::new("discord.storage", "bridge id lookup failed").with_source(err)
            })
    }
}

fn api_error(status: u16, body: &Value) -> BridgeError {
    let mut err = BridgeError::new("discord.api", format!("discord API error {status}"));
    if status == 429 {
        let backoff = body
            .get("retry_after")
            .and_then(Value::as_f64)
            .map(|secs| (secs * 1_000.0) as u64);
        err = err.with_retry(backoff);
    } else if status >= 500 {
        err = err.with_retry(Some(1_000));
    }
    err.with_details(json!({ "status": status, "body": body }))
}

fn net(err: reqwest::Error) -> BridgeError {
    BridgeError::new("discord.http", err.to_string())
        .with_retry(Some(1_000))
        .with_source(err.into())
}

fn embed(title: &str, color: i64) -> Value {
    json!({
        "title": title,
        "color": color,
        "timestamp": OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
    })
}

#[async_trait]
impl Bridge for DiscordBridge {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    async fn on_new_session(&self, session: &Session) -> Result<(), BridgeError> {
        let mut announce = embed("New Chat Session", COLOR_SESSION);
        announce["description"] = json!("A new visitor has started a chat");
        let mut fields = vec![json!({
            "name": "Visitor",
            "value": session.visitor_label(),
            "inline": true,
        })];
        if let Some(url) = session.metadata.as_ref().and_then(|m| m.url.as_ref()) {
            fields.push(json!({ "name": "Page", "value": url, "inline": false }));
        }
        announce["fields"] = json!(fields);

        let announce_id = self
            .send(&session.id, None, Some(json!([announce])), None)
            .await?;

        // Bot mode gets a dedicated thread hung off the announcement.
        if let (Some((_, _)), Some(announce_id)) = (self.bot(), announce_id) {
            let channel = self
                .session_channel(&session.id)
                .ok_or_else(|| BridgeError::new("discord.config", "no channel configured"))?;
            let url = format!(
                "{}/channels/{}/messages/{}/threads",
                self.config.api_base.trim_end_matches('/'),
                channel,
                announce_id
            );
            let payload = json!({ "name": format!("Chat with {}", session.visitor_label()) });
            let (status, body) = self.request(Method::POST, url, Some(&payload)).await?;
            match (status, body.get("id").and_then(Value::as_str)) {
                (status, Some(thread_id)) if status < 400 => {
                    self.threads.bind(Platform::Discord, &session.id, thread_id);
                }
                _ => {
                    tracing::warn!(session = %session.id, status, "discord thread creation failed, using flat channel");
                }
            }
        }
        Ok(())
    }

    async fn on_visitor_message(
        &self,
        message: &Message,
        session: &Session,
        reply: Option<&BridgeMessageIds>,
    ) -> Result<BridgeMessageResult, BridgeError> {
        let mut content = format!("**{}**: {}", session.visitor_label(), message.content);
        if !message.attachments.is_empty() {
            content.push_str(&format!(" _(+{} attachment(s))_", message.attachments.len()));
        }

        let reply_to = reply.and_then(|ids| ids.discord_message_id.clone());
        let id = self
            .send(&session.id, Some(content), None, reply_to.as_deref())
            .await?;

        Ok(BridgeMessageResult {
            raw: id.as_ref().map(|id| json!({ "id": id })),
            ids: id.map(|id| BridgeMessageIds {
                discord_message_id: Some(id),
                ..Default::default()
            }),
        })
    }

    async fn on_operator_message(
        &self,
        message: &Message,
        session: &Session,
        source_bridge: &str,
        operator_name: Option<&str>,
    ) -> Result<(), BridgeError> {
        if source_bridge == self.name() {
            return Ok(());
        }
        let name = operator_name.unwrap_or("Operator");
        let content = format!("**{}** (via {}): {}", name, source_bridge, message.content);
        self.send(&session.id, Some(content), None, None).await?;
        Ok(())
    }

    async fn on_typing(&self, session_id: &str, typing: bool) -> Result<(), BridgeError> {
        if !typing || self.bot().is_none() {
            return Ok(());
        }
        let Some(channel) = self.session_channel(session_id) else {
            return Ok(());
        };
        let url = format!(
            "{}/channels/{}/typing",
            self.config.api_base.trim_end_matches('/'),
            channel
        );
        self.request(Method::POST, url, None).await?;
        Ok(())
    }

    async fn on_message_edit(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
        _edited_at: OffsetDateTime,
    ) -> Result<Option<BridgeMessageIds>, BridgeError> {
        let Some(discord_id) = self
            .stored_ids(message_id)
            .await?
            .and_then(|ids| ids.discord_message_id)
        else {
            return Ok(None);
        };
        let Some(url) = self.message_url(session_id, &discord_id) else {
            return Ok(None);
        };

        let payload = json!({ "content": format!("_(edited)_ {content}") });
        let (status, _) = self.request(Method::PATCH, url, Some(&payload)).await?;
        if status >= 400 {
            tracing::warn!(message = message_id, status, "discord edit rejected");
            return Ok(None);
        }
        Ok(Some(BridgeMessageIds {
            discord_message_id: Some(discord_id),
            ..Default::default()
        }))
    }

    async fn on_message_delete(
        &self,
        session_id: &str,
        message_id: &str,
        _deleted_at: OffsetDateTime,
    ) -> Result<bool, BridgeError> {
        let Some(discord_id) = self
            .stored_ids(message_id)
            .await?
            .and_then(|ids| ids.discord_message_id)
        else {
            return Ok(false);
        };
        let Some(url) = self.message_url(session_id, &discord_id) else {
            return Ok(false);
        };

        let (status, body) = self.request(Method::DELETE, url, None).await?;
        // 404 means the mirror is already gone, which is the desired state.
        if status == 404 {
            return Ok(true);
        }
        if status >= 400 {
            return Err(api_error(status, &body));
        }
        Ok(true)
    }

    async fn on_custom_event(
        &self,
        event: &CustomEvent,
        session: &Session,
    ) -> Result<(), BridgeError> {
        let mut card = embed(&format!("Event: {}", event.name), COLOR_EVENT);
        if !event.data.is_null() {
            let pretty = serde_json::to_string_pretty(&event.data).unwrap_or_default();
            card["description"] = json!(format!("```json\n{pretty}\n```"));
        }
        self.send(&session.id, None, Some(json!([card])), None).await?;
        Ok(())
    }

    async fn on_identity_update(&self, session: &Session) -> Result<(), BridgeError> {
        let Some(identity) = &session.identity else {
            return Ok(());
        };
        let mut card = embed("User Identified", COLOR_IDENTITY);
        let mut fields = vec![json!({ "name": "User ID", "value": identity.id, "inline": true })];
        if let Some(name) = &identity.name {
            fields.push(json!({ "name": "Name", "value": name, "inline": true }));
        }
        if let Some(email) = &identity.email {
            fields.push(json!({ "name": "Email", "value": email, "inline": true }));
        }
        card["fields"] = json!(fields);
        self.send(&session.id, None, Some(json!([card])), None).await?;
        Ok(())
    }

    async fn on_ai_takeover(&self, session: &Session, reason: &str) -> Result<(), BridgeError> {
        let mut card = embed("AI Takeover", COLOR_AI);
        card["description"] = json!(reason);
        self.send(&session.id, None, Some(json!([card])), None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatlink_core::Sender;
    use chatlink_storage::{MemoryStorage, Storage};

    fn mock_bot() -> (DiscordBridge, Arc<MemoryStorage>, Arc<ThreadIndex>) {
        let storage = Arc::new(MemoryStorage::new());
        let threads = Arc::new(ThreadIndex::new());
        let bridge = DiscordBridge::new(
            reqwest::Client::new(),
            DiscordConfig::bot("bot-token", "chan-1").with_api_base("mock://discord"),
            threads.clone(),
            storage.clone(),
        );
        (bridge, storage, threads)
    }

    #[tokio::test]
    async fn new_session_starts_a_thread_in_bot_mode() {
        let (bridge, _, threads) = mock_bot();
        let session = Session::new("v-1");
        bridge.on_new_session(&session).await.unwrap();
        assert!(threads.thread_for(Platform::Discord, &session.id).is_some());
    }

    #[tokio::test]
    async fn visitor_message_maps_to_a_discord_id() {
        let (bridge, _, _) = mock_bot();
        let session = Session::new("v-1");
        let message = Message::new(&session.id, "hello", Sender::Visitor);
        let result = bridge
            .on_visitor_message(&message, &session, None)
            .await
            .unwrap();
        assert!(result.ids.unwrap().discord_message_id.is_some());
    }

    #[tokio::test]
    async fn delete_reports_nothing_without_a_mapping() {
        let (bridge, storage, _) = mock_bot();
        let now = OffsetDateTime::now_utc();
        assert!(!bridge.on_message_delete("s-1", "m-1", now).await.unwrap());

        storage
            .save_bridge_ids(
                "m-1",
                &BridgeMessageIds {
                    discord_message_id: Some("999".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(bridge.on_message_delete("s-1", "m-1", now).await.unwrap());
    }

    #[test]
    fn webhook_mode_edits_through_the_webhook_url() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let bridge = DiscordBridge::new(
            reqwest::Client::new(),
            DiscordConfig::webhook("https://discord.com/api/webhooks/1/tok"),
            Arc::new(ThreadIndex::new()),
            storage,
        );
        assert_eq!(
            bridge.message_url("s-1", "42").as_deref(),
            Some("https://discord.com/api/webhooks/1/tok/messages/42")
        );
    }

    #[test]
    fn rate_limit_errors_carry_backoff() {
        let err = api_error(429, &json!({ "retry_after": 1.5 }));
        assert!(err.retryable);
        assert_eq!(err.backoff_ms, Some(1_500));
    }
}
