//! Slack adapter. Bot mode anchors each session on a root message and
//! threads everything under its `ts`; incoming-webhook mode is create-only.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;

use chatlink_core::{
    BridgeError, BridgeMessageIds, CustomEvent, Message, MessageStatus, Platform, Session,
};
use chatlink_storage::SharedStorage;

use crate::{Bridge, BridgeMessageResult, ThreadIndex};

pub const SLACK_API_BASE: &str = "https://slack.com/api";

#[derive(Debug, Clone)]
pub enum SlackMode {
    Bot { bot_token: String, channel_id: String },
    /// Incoming webhook; replies with plain-text `ok`, cannot edit or delete.
    Webhook { url: String },
}

#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub mode: SlackMode,
    pub username: Option<String>,
    pub icon_emoji: Option<String>,
    pub api_base: String,
}

impl SlackConfig {
    pub fn bot(bot_token: impl Into<String>, channel_id: impl Into<String>) -> Self {
        SlackConfig {
            mode: SlackMode::Bot {
                bot_token: bot_token.into(),
                channel_id: channel_id.into(),
            },
            username: None,
            icon_emoji: None,
            api_base: SLACK_API_BASE.to_string(),
        }
    }

    pub fn webhook(url: impl Into<String>) -> Self {
        SlackConfig {
            mode: SlackMode::Webhook { url: url.into() },
            username: None,
            icon_emoji: None,
            api_base: SLACK_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

pub struct SlackBridge {
    http: reqwest::Client,
    config: SlackConfig,
    threads: Arc<ThreadIndex>,
    storage: SharedStorage,
    mock_seq: AtomicI64,
}

impl SlackBridge {
    pub fn new(
        http: reqwest::Client,
        config: SlackConfig,
        threads: Arc<ThreadIndex>,
        storage: SharedStorage,
    ) -> Self {
        SlackBridge {
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
            SlackMode::Bot {
                bot_token,
                channel_id,
            } => Some((bot_token.as_str(), channel_id.as_str())),
            SlackMode::Webhook { .. } => None,
        }
    }

    /// Calls a Web API method and returns the decoded body after the `ok`
    /// envelope check.
    async fn call(&self, method: &str, payload: Value) -> Result<Value, BridgeError> {
        if self.is_mock() {
            let seq = self.mock_seq.fetch_add(1, Ordering::Relaxed);
            return Ok(json!({ "ok": true, "ts": format!("1727000000.{seq:06}") }));
        }

        let (token, _) = self
            .bot()
            .ok_or_else(|| BridgeError::new("slack.config", format!("{method} needs a bot token")))?;
        let url = format!("{}/{}", self.config.api_base.trim_end_matches('/'), method);
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(net)?;
        let body: Value = response.json().await.map_err(net)?;

        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let code = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error")
                .to_string();
            let mut err = BridgeError::new("slack.api", code.clone());
            if code == "ratelimited" {
                err = err.with_retry(Some(1_000));
            }
            return Err(err.with_details(body));
        }
        Ok(body)
    }

    /// Posts into the session thread (bot mode) or the incoming webhook.
    /// Returns the message `ts` when the API reports one.
    async fn send(
        &self,
        session_id: &str,
        text: String,
        blocks: Option<Value>,
    ) -> Result<Option<String>, BridgeError> {
        let mut payload = json!({ "text": text });
        if let Some(blocks) = blocks {
            payload["blocks"] = blocks;
        }
        if let Some(username) = &self.config.username {
            payload["username"] = json!(username);
        }
        if let Some(icon) = &self.config.icon_emoji {
            payload["icon_emoji"] = json!(icon);
        }

        match &self.config.mode {
            SlackMode::Bot { channel_id, .. } => {
                payload["channel"] = json!(channel_id);
                if let Some(thread_ts) = self.threads.thread_for(Platform::Slack, session_id) {
                    payload["thread_ts"] = json!(thread_ts);
                }
                let body = self.call("chat.postMessage", payload).await?;
                Ok(body.get("ts").and_then(Value::as_str).map(str::to_string))
            }
            SlackMode::Webhook { url } => {
                if self.is_mock() {
                    return Ok(None);
                }
                let response = self.http.post(url).json(&payload).send().await.map_err(net)?;
                let body = response.text().await.map_err(net)?;
                // Incoming webhooks answer with plain-text "ok".
                if body != "ok" {
                    return Err(BridgeError::new("slack.webhook", body));
                }
                Ok(None)
            }
        }
    }

    async fn stored_ts(&self, message_id: &str) -> Result<Option<String>, BridgeError> {
        let ids = self
            .storage
            .get_bridge_ids(message_id)
            .await
            .map_err(|err| {
                BridgeError::new("slack.storage", "bridge id lookup failed").with_source(err)
            })?;
        Ok(ids.and_then(|ids| ids.slack_message_ts))
    }
}

/// Slack delete errors that mean the message is already gone.
fn delete_already_gone(error: &str) -> bool {
    matches!(error, "message_not_found" | "cant_delete_message")
}

fn reaction_for(status: MessageStatus) -> Option<&'static str> {
    match status {
        MessageStatus::Delivered => Some("white_check_mark"),
        MessageStatus::Read => Some("eyes"),
        _ => None,
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn net(err: reqwest::Error) -> BridgeError {
    BridgeError::new("slack.http", err.to_string())
        .with_retry(Some(1_000))
        .with_source(err.into())
}

fn section(markdown: String) -> Value {
    json!({ "type": "section", "text": { "type": "mrkdwn", "text": markdown } })
}

#[async_trait]
impl Bridge for SlackBridge {
    fn platform(&self) -> Platform {
        Platform::Slack
    }

    async fn on_new_session(&self, session: &Session) -> Result<(), BridgeError> {
        let mut blocks = vec![
            json!({
                "type": "header",
                "text": { "type": "plain_text", "text": "New Chat Session" }
            }),
            section(format!("*Visitor:*\n{}", escape(session.visitor_label()))),
        ];
        if let Some(url) = session.metadata.as_ref().and_then(|m| m.url.as_ref()) {
            blocks.push(section(format!("*Page:* {}", escape(url))));
        }

        let ts = self
            .send(&session.id, "New chat session".to_string(), Some(json!(blocks)))
            .await?;
        if let Some(ts) = ts {
            self.threads.bind(Platform::Slack, &session.id, &ts);
        }
        Ok(())
    }

    async fn on_visitor_message(
        &self,
        message: &Message,
        session: &Session,
        _reply: Option<&BridgeMessageIds>,
    ) -> Result<BridgeMessageResult, BridgeError> {
        let mut text = format!(
            "*{}*: {}",
            escape(session.visitor_label()),
            escape(&message.content)
        );
        if !message.attachments.is_empty() {
            text.push_str(&format!(" _(+{} attachment(s))_", message.attachments.len()));
        }

        let ts = self.send(&session.id, text, None).await?;
        Ok(BridgeMessageResult {
            raw: ts.as_ref().map(|ts| json!({ "ts": ts })),
            ids: ts.map(|ts| BridgeMessageIds {
                slack_message_ts: Some(ts),
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
        let text = format!(
            "*{}* (via {}): {}",
            escape(name),
            source_bridge,
            escape(&message.content)
        );
        self.send(&session.id, text, None).await?;
        Ok(())
    }

    async fn on_message_read(
        &self,
        _session_id: &str,
        message_ids: &[String],
        status: MessageStatus,
    ) -> Result<(), BridgeError> {
        let Some((_, channel)) = self.bot() else {
            return Ok(());
        };
        let Some(name) = reaction_for(status) else {
            return Ok(());
        };
        let channel = channel.to_string();

        for message_id in message_ids {
            let Some(ts) = self.stored_ts(message_id).await? else {
                continue;
            };
            let payload = json!({ "channel": channel, "timestamp": ts, "name": name });
            if let Err(err) = self.call("reactions.add", payload).await {
                // already_reacted just means a repeat receipt.
                if err.message != "already_reacted" {
                    tracing::warn!(message = %message_id, error = %err, "slack reaction failed");
                }
            }
        }
        Ok(())
    }

    async fn on_message_edit(
        &self,
        _session_id: &str,
        message_id: &str,
        content: &str,
        _edited_at: OffsetDateTime,
    ) -> Result<Option<BridgeMessageIds>, BridgeError> {
        let Some((_, channel)) = self.bot() else {
            return Ok(None);
        };
        let Some(ts) = self.stored_ts(message_id).await? else {
            return Ok(None);
        };

        let payload = json!({
            "channel": channel,
            "ts": ts,
            "text": format!("_(edited)_ {}", escape(content)),
        });
        match self.call("chat.update", payload).await {
            Ok(_) => Ok(Some(BridgeMessageIds {
                slack_message_ts: Some(ts),
                ..Default::default()
            })),
            Err(err) if err.code == "slack.api" => {
                tracing::warn!(message = message_id, error = %err, "slack edit rejected");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn on_message_delete(
        &self,
        _session_id: &str,
        message_id: &str,
        _deleted_at: OffsetDateTime,
    ) -> Result<bool, BridgeError> {
        let Some((_, channel)) = self.bot() else {
            return Ok(false);
        };
        let Some(ts) = self.stored_ts(message_id).await? else {
            return Ok(false);
        };

        let payload = json!({ "channel": channel, "ts": ts });
        match self.call("chat.delete", payload).await {
            Ok(_) => Ok(true),
            Err(err) if err.code == "slack.api" && delete_already_gone(&err.message) => Ok(true),
            Err(err) => Err(err),
        }
    }

    async fn on_custom_event(
        &self,
        event: &CustomEvent,
        session: &Session,
    ) -> Result<(), BridgeError> {
        let mut blocks = vec![section(format!("*Event:* {}", escape(&event.name)))];
        if !event.data.is_null() {
            let data = serde_json::to_string(&event.data).unwrap_or_default();
            blocks.push(section(format!("```{}```", escape(&data))));
        }
        self.send(
            &session.id,
            format!("Event: {}", event.name),
            Some(json!(blocks)),
        )
        .await?;
        Ok(())
    }

    async fn on_identity_update(&self, session: &Session) -> Result<(), BridgeError> {
        let Some(identity) = &session.identity else {
            return Ok(());
        };
        let mut fields = vec![json!({
            "type": "mrkdwn",
            "text": format!("*ID:*\n{}", escape(&identity.id)),
        })];
        if let Some(name) = &identity.name {
            fields.push(json!({ "type": "mrkdwn", "text": format!("*Name:*\n{}", escape(name)) }));
        }
        if let Some(email) = &identity.email {
            fields.push(json!({ "type": "mrkdwn", "text": format!("*Email:*\n{}", escape(email)) }));
        }
        if let Some(phone) = &session.user_phone {
            fields.push(json!({ "type": "mrkdwn", "text": format!("*Phone:*\n{}", escape(phone)) }));
        }
        let blocks = json!([
            { "type": "header", "text": { "type": "plain_text", "text": "User Identified" } },
            { "type": "section", "fields": fields },
        ]);
        self.send(&session.id, "User identified".to_string(), Some(blocks))
            .await?;
        Ok(())
    }

    async fn on_ai_takeover(&self, session: &Session, reason: &str) -> Result<(), BridgeError> {
        let blocks = json!([
            { "type": "header", "text": { "type": "plain_text", "text": "AI Takeover" } },
            section(escape(reason)),
        ]);
        self.send(&session.id, "AI takeover".to_string(), Some(blocks))
            .await?;
        Ok(())
    }
}
