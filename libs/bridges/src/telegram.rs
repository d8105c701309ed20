//! Telegram adapter: one forum supergroup, one topic per session.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;

use chatlink_core::{
    BridgeError, BridgeMessageIds, CustomEvent, Message, Platform, Session,
};
use chatlink_storage::SharedStorage;

use crate::{Bridge, BridgeMessageResult, ThreadIndex};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Forum supergroup all session topics live in.
    pub chat_id: String,
    pub api_base: String,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        TelegramConfig {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

pub struct TelegramBridge {
    http: reqwest::Client,
    config: TelegramConfig,
    threads: Arc<ThreadIndex>,
    storage: SharedStorage,
    mock_seq: AtomicI64,
}

impl TelegramBridge {
    pub fn new(
        http: reqwest::Client,
        config: TelegramConfig,
        threads: Arc<ThreadIndex>,
        storage: SharedStorage,
    ) -> Self {
        TelegramBridge {
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

    async fn call(&self, method: &str, payload: Value) -> Result<Value, BridgeError> {
        if self.is_mock() {
            let seq = self.mock_seq.fetch_add(1, Ordering::Relaxed);
            return Ok(match method {
                "createForumTopic" => json!({ "message_thread_id": seq }),
                "sendMessage" | "editMessageText" => json!({ "message_id": seq }),
                _ => json!(true),
            });
        }

        let url = format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        );
        let response = self.http.post(url).json(&payload).send().await.map_err(net)?;
        let body: Value = response.json().await.map_err(net)?;

        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown telegram error")
                .to_string();
            let mut err = BridgeError::new("telegram.api", description);
            if let Some(retry_after) = body
                .pointer("/parameters/retry_after")
                .and_then(Value::as_u64)
            {
                err = err.with_retry(Some(retry_after * 1_000));
            }
            return Err(err.with_details(body));
        }

        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Topic for the session, creating one on first use. Falls back to the
    /// flat chat when topic creation fails (non-forum group).
    async fn ensure_topic(&self, session: &Session) -> Result<Option<i64>, BridgeError> {
        if let Some(thread) = self.threads.thread_for(Platform::Telegram, &session.id) {
            return Ok(thread.parse().ok());
        }

        let payload = json!({
            "chat_id": self.config.chat_id,
            "name": format!("Chat with {}", session.visitor_label()),
        });
        match self.call("createForumTopic", payload).await {
            Ok(result) => {
                let topic = result
                    .get("message_thread_id")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        BridgeError::new("telegram.api", "createForumTopic returned no topic id")
                    })?;
                self.threads
                    .bind(Platform::Telegram, &session.id, &topic.to_string());
                Ok(Some(topic))
            }
            Err(err) => {
                tracing::warn!(session = %session.id, error = %err, "forum topic creation failed, using flat chat");
                Ok(None)
            }
        }
    }

    async fn send(
        &self,
        text: String,
        topic: Option<i64>,
        reply_to: Option<i64>,
    ) -> Result<i64, BridgeError> {
        let mut payload = json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        let obj = payload.as_object_mut().unwrap();
        if let Some(topic) = topic {
            obj.insert("message_thread_id".into(), json!(topic));
        }
        if let Some(reply_to) = reply_to {
            obj.insert("reply_to_message_id".into(), json!(reply_to));
        }

        let result = self.call("sendMessage", payload).await?;
        result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| BridgeError::new("telegram.api", "sendMessage returned no message_id"))
    }

    async fn stored_ids(&self, message_id: &str) -> Result<Option<BridgeMessageIds>, BridgeError> {
        self.storage
            .get_bridge_ids(message_id)
            .await
            .map_err(|err| {
                BridgeError::new("telegram.storage", "bridge id lookup failed").with_source(err)
            })
    }
}

/// Telegram reports deletes of already-gone messages as errors; treat those
/// as success so retried deletes stay idempotent.
fn delete_already_gone(description: &str) -> bool {
    let description = description.to_ascii_lowercase();
    description.contains("message to delete not found")
        || description.contains("message can't be deleted")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn net(err: reqwest::Error) -> BridgeError {
    BridgeError::new("telegram.http", err.to_string())
        .with_retry(Some(1_000))
        .with_source(err.into())
}

#[async_trait]
impl Bridge for TelegramBridge {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn on_new_session(&self, session: &Session) -> Result<(), BridgeError> {
        let topic = self.ensure_topic(session).await?;

        let mut text = format!(
            "🆕 <b>New chat session</b>\n👤 Visitor: {}",
            escape_html(session.visitor_label())
        );
        if let Some(meta) = &session.metadata {
            match (&meta.country, &meta.city) {
                (Some(country), Some(city)) => {
                    text.push_str(&format!("\n🌍 {}, {}", escape_html(country), escape_html(city)));
                }
                (Some(country), None) => text.push_str(&format!("\n🌍 {}", escape_html(country))),
                _ => {}
            }
            if let Some(url) = &meta.url {
                text.push_str(&format!("\n📍 {}", escape_html(url)));
            }
        }

        self.send(text, topic, None).await?;
        Ok(())
    }

    async fn on_visitor_message(
        &self,
        message: &Message,
        session: &Session,
        reply: Option<&BridgeMessageIds>,
    ) -> Result<BridgeMessageResult, BridgeError> {
        let topic = self.ensure_topic(session).await?;

        let mut text = format!(
            "💬 <b>{}</b>:\n{}",
            escape_html(session.visitor_label()),
            escape_html(&message.content)
        );
        if !message.attachments.is_empty() {
            text.push_str(&format!("\n📎 {} attachment(s)", message.attachments.len()));
        }

        let reply_to = reply.and_then(|ids| ids.telegram_message_id);
        let message_id = self.send(text, topic, reply_to).await?;

        Ok(BridgeMessageResult {
            ids: Some(BridgeMessageIds {
                telegram_message_id: Some(message_id),
                ..Default::default()
            }),
            raw: Some(json!({ "message_id": message_id })),
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

        let topic = self.ensure_topic(session).await?;
        let name = operator_name.unwrap_or("Operator");
        let text = format!(
            "👤 <b>{}</b> (via {}):\n{}",
            escape_html(name),
            source_bridge,
            escape_html(&message.content)
        );
        self.send(text, topic, None).await?;
        Ok(())
    }

    async fn on_typing(&self, session_id: &str, typing: bool) -> Result<(), BridgeError> {
        if !typing {
            return Ok(());
        }
        let mut payload = json!({
            "chat_id": self.config.chat_id,
            "action": "typing",
        });
        if let Some(thread) = self.threads.thread_for(Platform::Telegram, session_id) {
            if let Ok(topic) = thread.parse::<i64>() {
                payload["message_thread_id"] = json!(topic);
            }
        }
        self.call("sendChatAction", payload).await?;
        Ok(())
    }

    async fn on_message_edit(
        &self,
        _session_id: &str,
        message_id: &str,
        content: &str,
        _edited_at: OffsetDateTime,
    ) -> Result<Option<BridgeMessageIds>, BridgeError> {
        let Some(telegram_id) = self
            .stored_ids(message_id)
            .await?
            .and_then(|ids| ids.telegram_message_id)
        else {
            return Ok(None);
        };

        let payload = json!({
            "chat_id": self.config.chat_id,
            "message_id": telegram_id,
            "text": format!("✏️ (edited):\n{}", escape_html(content)),
            "parse_mode": "HTML",
        });
        match self.call("editMessageText", payload).await {
            Ok(_) => Ok(Some(BridgeMessageIds {
                telegram_message_id: Some(telegram_id),
                ..Default::default()
            })),
            Err(err) if err.code == "telegram.api" => {
                tracing::warn!(message = message_id, error = %err, "telegram edit rejected");
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
        let Some(telegram_id) = self
            .stored_ids(message_id)
            .await?
            .and_then(|ids| ids.telegram_message_id)
        else {
            return Ok(false);
        };

        let payload = json!({
            "chat_id": self.config.chat_id,
            "message_id": telegram_id,
        });
        match self.call("deleteMessage", payload).await {
            Ok(_) => Ok(true),
            Err(err) if err.code == "telegram.api" && delete_already_gone(&err.message) => {
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    async fn on_custom_event(
        &self,
        event: &CustomEvent,
        session: &Session,
    ) -> Result<(), BridgeError> {
        let topic = self.ensure_topic(session).await?;
        let mut text = format!("⚡ <b>Event: {}</b>", escape_html(&event.name));
        if !event.data.is_null() {
            let data = serde_json::to_string(&event.data).unwrap_or_default();
            text.push_str(&format!("\n<code>{}</code>", escape_html(&data)));
        }
        self.send(text, topic, None).await?;
        Ok(())
    }

    async fn on_identity_update(&self, session: &Session) -> Result<(), BridgeError> {
        let Some(identity) = &session.identity else {
            return Ok(());
        };
        let topic = self.ensure_topic(session).await?;

        let mut text = format!("🔑 <b>User identified</b>\nID: {}", escape_html(&identity.id));
        if let Some(name) = &identity.name {
            text.push_str(&format!("\nName: {}", escape_html(name)));
        }
        if let Some(email) = &identity.email {
            text.push_str(&format!("\nEmail: {}", escape_html(email)));
        }
        if let Some(phone) = &session.user_phone {
            text.push_str(&format!("\n📱 Phone: {}", escape_html(phone)));
        }
        self.send(text, topic, None).await?;
        Ok(())
    }

    async fn on_ai_takeover(&self, session: &Session, reason: &str) -> Result<(), BridgeError> {
        let topic = self.ensure_topic(session).await?;
        let text = format!("🤖 <b>AI takeover</b>\nReason: {}", escape_html(reason));
        self.send(text, topic, None).await?;
        Ok(())
    }

    async fn on_session_closed(&self, session: &Session) -> Result<(), BridgeError> {
        if let Some(thread) = self.threads.thread_for(Platform::Telegram, &session.id) {
            if let Ok(topic) = thread.parse::<i64>() {
                let payload = json!({
                    "chat_id": self.config.chat_id,
                    "message_thread_id": topic,
                });
                if let Err(err) = self.call("closeForumTopic", payload).await {
                    tracing::warn!(session = %session.id, error = %err, "closeForumTopic failed");
                }
            }
            self.threads.unbind(Platform::Telegram, &session.id);
        }
        Ok(())
    }
}
