use futures::future::join_all;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use chatlink_bridges::{SharedBridge, ThreadIndex};
use chatlink_core::{
    Attachment, AttachmentStatus, BridgeMessageIds, CustomEvent, EngineError, MAX_MESSAGE_LEN,
    Message, MessageStatus, OperatorAttachment, Platform, Sender, Session, UserIdentity,
    WidgetEvent, new_id, parse_user_agent, validate_content,
};
use chatlink_storage::SharedStorage;

use crate::broadcast::{SessionBroadcaster, SinkId, WidgetSink};
use crate::bus::{EventBus, EventHandler, HandlerId};
use crate::requests::{ConnectRequest, ConnectResponse, OperatorMessageRecord, SendMessageRequest};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Shown to first-time visitors in the connect response.
    pub welcome_message: Option<String>,
    /// How many trailing messages a connect response replays.
    pub recent_messages: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            welcome_message: None,
            recent_messages: 50,
        }
    }
}

/// Per-bridge outcome of one fan-out, reported without rollback.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeDispatch {
    pub platform: Platform,
    pub ok: bool,
    pub detail: Option<String>,
}

/// The orchestrator. One instance owns all sessions.
pub struct Hub {
    storage: SharedStorage,
    bridges: Vec<SharedBridge>,
    threads: Arc<ThreadIndex>,
    broadcaster: SessionBroadcaster,
    bus: EventBus,
    config: HubConfig,
    operator_online: AtomicBool,
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|err| EngineError::Storage(anyhow::Error::new(err)))
}

fn rfc3339(timestamp: OffsetDateTime) -> Option<String> {
    timestamp.format(&Rfc3339).ok()
}

fn to_attachment(att: OperatorAttachment) -> Attachment {
    Attachment {
        id: new_id(),
        filename: att.filename,
        mime_type: att.mime_type,
        size: att.size,
        url: att.url,
        thumbnail_url: None,
        status: AttachmentStatus::Ready,
        bridge_file_id: att.bridge_file_id,
        data: att.data,
    }
}

impl Hub {
    pub fn new(
        storage: SharedStorage,
        bridges: Vec<SharedBridge>,
        threads: Arc<ThreadIndex>,
        config: HubConfig,
    ) -> Self {
        Hub {
            storage,
            bridges,
            threads,
            broadcaster: SessionBroadcaster::new(),
            bus: EventBus::new(),
            config,
            operator_online: AtomicBool::new(false),
        }
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn threads(&self) -> &Arc<ThreadIndex> {
        &self.threads
    }

    async fn require_session(&self, session_id: &str) -> Result<Session, EngineError> {
        self.storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    async fn require_message(&self, message_id: &str) -> Result<Message, EngineError> {
        self.storage
            .get_message(message_id)
            .await?
            .ok_or_else(|| EngineError::MessageNotFound(message_id.to_string()))
    }

    async fn touch(&self, session: &mut Session) -> Result<(), EngineError> {
        session.last_activity = OffsetDateTime::now_utc();
        self.storage.update_session(session).await?;
        Ok(())
    }

    /// Resolves a session per the three-step order: explicit id, visitor's
    /// latest session, fresh session. Geo fields survive resubmission.
    pub async fn connect(&self, req: ConnectRequest) -> Result<ConnectResponse, EngineError> {
        let mut session = match &req.session_id {
            Some(id) => self.storage.get_session(id).await?,
            None => None,
        };
        if session.is_none() {
            if let Some(visitor_id) = &req.visitor_id {
                session = self.storage.find_session_by_visitor(visitor_id).await?;
            }
        }

        let resumed = session.is_some();
        let mut session = session.unwrap_or_else(|| {
            Session::new(req.visitor_id.clone().unwrap_or_else(new_id))
        });

        let mut meta = session.metadata.take().unwrap_or_default();
        if let Some(update) = &req.metadata {
            meta.apply_client_update(update);
        }
        if meta.ip.is_none() {
            meta.ip = req.ip.clone();
        }
        if meta.country.is_none() {
            meta.country = req.country.clone();
        }
        if meta.city.is_none() {
            meta.city = req.city.clone();
        }
        if meta.device_type.is_none() {
            if let Some(ua) = meta.user_agent.clone() {
                let info = parse_user_agent(&ua);
                meta.device_type = info.device_type;
                meta.browser = info.browser;
                meta.os = info.os;
            }
        }
        session.metadata = Some(meta);
        session.last_activity = OffsetDateTime::now_utc();

        if resumed {
            self.storage.update_session(&session).await?;
            tracing::debug!(session = %session.id, "session resumed");
        } else {
            self.storage.create_session(&session).await?;
            tracing::info!(session = %session.id, visitor = %session.visitor_id, "session started");

            let session_ref = &session;
            let results = join_all(self.bridges.iter().map(|bridge| async move {
                (bridge.platform(), bridge.on_new_session(session_ref).await)
            }))
            .await;
            for (platform, result) in results {
                if let Err(err) = result {
                    tracing::warn!(platform = %platform, session = %session.id, error = %err, "new session announcement failed");
                }
            }
        }

        let all = self
            .storage
            .get_messages(&session.id, None, usize::MAX)
            .await?;
        let skip = all.len().saturating_sub(self.config.recent_messages);
        let messages = all.into_iter().skip(skip).collect();

        Ok(ConnectResponse {
            session_id: session.id.clone(),
            visitor_id: session.visitor_id.clone(),
            resumed,
            messages,
            welcome_message: if resumed {
                None
            } else {
                self.config.welcome_message.clone()
            },
            operator_online: self.is_operator_online(),
            ai_active: session.ai_active,
        })
    }

    /// Persists a message and mirrors it. Visitor messages fan out to every
    /// bridge concurrently; one failing platform never blocks the others.
    /// An operator message clears the session's AI flag.
    pub async fn send_message(
        &self,
        req: SendMessageRequest,
    ) -> Result<(Message, Vec<BridgeDispatch>), EngineError> {
        if req.attachments.is_empty() {
            validate_content(&req.content)?;
        } else if req.content.chars().count() > MAX_MESSAGE_LEN {
            return Err(EngineError::ContentTooLong {
                len: req.content.chars().count(),
                max: MAX_MESSAGE_LEN,
            });
        }

        let mut session = self.require_session(&req.session_id).await?;
        let mut message = Message::new(&req.session_id, req.content, req.sender);
        message.attachments = req.attachments;
        message.reply_to_id = req.reply_to_id;
        self.storage.save_message(&message).await?;

        if req.sender == Sender::Operator && session.ai_active {
            session.ai_active = false;
        }
        self.touch(&mut session).await?;

        let dispatches = match req.sender {
            Sender::Visitor => {
                let reply = match &message.reply_to_id {
                    Some(reply_id) => self.storage.get_bridge_ids(reply_id).await?,
                    None => None,
                };
                self.fan_out_visitor(&message, &session, reply.as_ref())
                    .await?
            }
            Sender::Operator => {
                self.relay_operator(&message, &session, "dashboard", message.operator_name.as_deref())
                    .await
            }
            Sender::Ai => {
                self.relay_operator(&message, &session, "ai", Some("AI Assistant"))
                    .await
            }
        };

        self.broadcaster
            .broadcast(&session.id, &WidgetEvent::new("message", to_value(&message)?))
            .await;

        Ok((message, dispatches))
    }

    async fn fan_out_visitor(
        &self,
        message: &Message,
        session: &Session,
        reply: Option<&BridgeMessageIds>,
    ) -> Result<Vec<BridgeDispatch>, EngineError> {
        let results = join_all(self.bridges.iter().map(|bridge| async move {
            (
                bridge.platform(),
                bridge.on_visitor_message(message, session, reply).await,
            )
        }))
        .await;

        let mut dispatches = Vec::with_capacity(results.len());
        for (platform, result) in results {
            match result {
                Ok(outcome) => {
                    if let Some(ids) = outcome.ids {
                        self.storage.save_bridge_ids(&message.id, &ids).await?;
                    }
                    dispatches.push(BridgeDispatch {
                        platform,
                        ok: true,
                        detail: None,
                    });
                }
                Err(err) => {
                    tracing::warn!(platform = %platform, message = %message.id, error = %err, "visitor message dispatch failed");
                    dispatches.push(BridgeDispatch {
                        platform,
                        ok: false,
                        detail: Some(err.to_string()),
                    });
                }
            }
        }
        Ok(dispatches)
    }

    async fn relay_operator(
        &self,
        message: &Message,
        session: &Session,
        source_bridge: &str,
        operator_name: Option<&str>,
    ) -> Vec<BridgeDispatch> {
        let targets: Vec<&SharedBridge> = self
            .bridges
            .iter()
            .filter(|bridge| bridge.name() != source_bridge)
            .collect();

        let results = join_all(targets.iter().map(|bridge| async move {
            (
                bridge.platform(),
                bridge
                    .on_operator_message(message, session, source_bridge, operator_name)
                    .await,
            )
        }))
        .await;

        results
            .into_iter()
            .map(|(platform, result)| match result {
                Ok(()) => BridgeDispatch {
                    platform,
                    ok: true,
                    detail: None,
                },
                Err(err) => {
                    tracing::warn!(platform = %platform, message = %message.id, error = %err, "operator relay failed");
                    BridgeDispatch {
                        platform,
                        ok: false,
                        detail: Some(err.to_string()),
                    }
                }
            })
            .collect()
    }

    /// Records an operator message that arrived from a platform webhook.
    ///
    /// The canonical id is `{source}:{platform_id}`, so later edit/delete
    /// webhooks resolve it without a reverse lookup. The message is relayed
    /// to every bridge except the one it came from.
    pub async fn record_operator_message(
        &self,
        record: OperatorMessageRecord,
    ) -> Result<Message, EngineError> {
        let mut session = self.require_session(&record.session_id).await?;

        let canonical_id = format!("{}:{}", record.source, record.platform_message_id);
        let mut message = Message::new(&record.session_id, record.content, Sender::Operator);
        message.id = canonical_id.clone();
        message.operator_name = record.operator_name.clone();
        message.attachments = record.attachments.into_iter().map(to_attachment).collect();
        self.storage.save_message(&message).await?;

        self.storage
            .save_bridge_ids(
                &canonical_id,
                &BridgeMessageIds::for_platform(record.source, &record.platform_message_id),
            )
            .await?;

        // A human replied; the AI stands down.
        session.ai_active = false;
        self.touch(&mut session).await?;

        let mut data = to_value(&message)?;
        data["sourceBridge"] = json!(record.source.as_str());
        if let Some(reply_to) = &record.reply_to_platform_id {
            data["replyToBridgeMessageId"] = json!(reply_to);
        }
        self.broadcaster
            .broadcast(&session.id, &WidgetEvent::new("operator_message", data))
            .await;

        self.relay_operator(
            &message,
            &session,
            record.source.as_str(),
            record.operator_name.as_deref(),
        )
        .await;

        Ok(message)
    }

    /// Applies an operator edit observed on a platform webhook. The session
    /// is taken from the stored message; edit payloads carry no thread key.
    pub async fn record_operator_edit(
        &self,
        source: Platform,
        platform_message_id: &str,
        content: &str,
        edited_at: Option<OffsetDateTime>,
    ) -> Result<(), EngineError> {
        let canonical_id = format!("{source}:{platform_message_id}");
        let mut message = self.require_message(&canonical_id).await?;
        message.content = content.to_string();
        message.edited_at = Some(edited_at.unwrap_or_else(OffsetDateTime::now_utc));
        self.storage.update_message(&message).await?;

        self.broadcaster
            .broadcast(
                &message.session_id,
                &WidgetEvent::new(
                    "operator_message_edited",
                    json!({
                        "messageId": canonical_id,
                        "content": content,
                        "editedAt": message.edited_at.and_then(rfc3339),
                    }),
                ),
            )
            .await;
        Ok(())
    }

    /// Applies an operator delete observed on a platform webhook.
    pub async fn record_operator_delete(
        &self,
        source: Platform,
        platform_message_id: &str,
        deleted_at: Option<OffsetDateTime>,
    ) -> Result<(), EngineError> {
        let canonical_id = format!("{source}:{platform_message_id}");
        let mut message = self.require_message(&canonical_id).await?;
        message.deleted_at = Some(deleted_at.unwrap_or_else(OffsetDateTime::now_utc));
        self.storage.update_message(&message).await?;

        self.broadcaster
            .broadcast(
                &message.session_id,
                &WidgetEvent::new(
                    "operator_message_deleted",
                    json!({ "messageId": canonical_id }),
                ),
            )
            .await;
        Ok(())
    }

    /// Visitor-side edit. Bridges holding no mirror of the message skip
    /// silently; failures are reported per bridge without rollback.
    pub async fn edit_message(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<(Message, Vec<BridgeDispatch>), EngineError> {
        validate_content(content)?;
        let mut message = self.require_message(message_id).await?;
        if message.session_id != session_id {
            return Err(EngineError::SessionMismatch(session_id.to_string()));
        }
        if message.sender != Sender::Visitor {
            return Err(EngineError::NotVisitorMessage);
        }
        if message.is_deleted() {
            return Err(EngineError::MessageDeleted(message_id.to_string()));
        }

        let edited_at = OffsetDateTime::now_utc();
        let results = join_all(self.bridges.iter().map(|bridge| async move {
            (
                bridge.platform(),
                bridge
                    .on_message_edit(session_id, message_id, content, edited_at)
                    .await,
            )
        }))
        .await;

        let mut dispatches = Vec::with_capacity(results.len());
        for (platform, result) in results {
            match result {
                Ok(Some(ids)) => {
                    self.storage.save_bridge_ids(message_id, &ids).await?;
                    dispatches.push(BridgeDispatch {
                        platform,
                        ok: true,
                        detail: None,
                    });
                }
                Ok(None) => dispatches.push(BridgeDispatch {
                    platform,
                    ok: true,
                    detail: Some("no mirror".into()),
                }),
                Err(err) => {
                    tracing::warn!(platform = %platform, message = message_id, error = %err, "edit dispatch failed");
                    dispatches.push(BridgeDispatch {
                        platform,
                        ok: false,
                        detail: Some(err.to_string()),
                    });
                }
            }
        }

        message.content = content.to_string();
        message.edited_at = Some(edited_at);
        self.storage.update_message(&message).await?;

        self.broadcaster
            .broadcast(
                session_id,
                &WidgetEvent::new(
                    "message_edited",
                    json!({
                        "messageId": message_id,
                        "content": content,
                        "editedAt": message.edited_at.and_then(rfc3339),
                    }),
                ),
            )
            .await;

        Ok((message, dispatches))
    }

    /// Visitor-side delete. Bridges are told first, while the id mapping is
    /// still live, then the message is soft-deleted. Deleting an already
    /// deleted message is a no-op.
    pub async fn delete_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Vec<BridgeDispatch>, EngineError> {
        let mut message = self.require_message(message_id).await?;
        if message.session_id != session_id {
            return Err(EngineError::SessionMismatch(session_id.to_string()));
        }
        if message.sender != Sender::Visitor {
            return Err(EngineError::NotVisitorMessage);
        }
        if message.is_deleted() {
            return Ok(Vec::new());
        }

        let deleted_at = OffsetDateTime::now_utc();
        let results = join_all(self.bridges.iter().map(|bridge| async move {
            (
                bridge.platform(),
                bridge
                    .on_message_delete(session_id, message_id, deleted_at)
                    .await,
            )
        }))
        .await;

        let mut dispatches = Vec::with_capacity(results.len());
        for (platform, result) in results {
            match result {
                Ok(removed) => dispatches.push(BridgeDispatch {
                    platform,
                    ok: true,
                    detail: (!removed).then(|| "no mirror".to_string()),
                }),
                Err(err) => {
                    tracing::warn!(platform = %platform, message = message_id, error = %err, "delete dispatch failed");
                    dispatches.push(BridgeDispatch {
                        platform,
                        ok: false,
                        detail: Some(err.to_string()),
                    });
                }
            }
        }

        message.deleted_at = Some(deleted_at);
        self.storage.update_message(&message).await?;

        self.broadcaster
            .broadcast(
                session_id,
                &WidgetEvent::new("message_deleted", json!({ "messageId": message_id })),
            )
            .await;

        Ok(dispatches)
    }

    /// Moves messages forward through the delivery lifecycle; transitions
    /// never go backwards. Returns the ids that actually changed.
    pub async fn mark_read(
        &self,
        session_id: &str,
        message_ids: &[String],
        status: MessageStatus,
    ) -> Result<Vec<String>, EngineError> {
        let now = OffsetDateTime::now_utc();
        let mut changed = Vec::new();
        for message_id in message_ids {
            let Some(mut message) = self.storage.get_message(message_id).await? else {
                continue;
            };
            if message.session_id != session_id || message.status >= status {
                continue;
            }
            message.status = status;
            if status >= MessageStatus::Delivered && message.delivered_at.is_none() {
                message.delivered_at = Some(now);
            }
            if status == MessageStatus::Read && message.read_at.is_none() {
                message.read_at = Some(now);
            }
            self.storage.update_message(&message).await?;
            changed.push(message_id.clone());
        }

        if changed.is_empty() {
            return Ok(changed);
        }

        self.broadcaster
            .broadcast(
                session_id,
                &WidgetEvent::new(
                    "messages_read",
                    json!({ "messageIds": changed, "status": to_value(&status)? }),
                ),
            )
            .await;

        let changed_ref = &changed;
        let results = join_all(self.bridges.iter().map(|bridge| async move {
            (
                bridge.platform(),
                bridge.on_message_read(session_id, changed_ref, status).await,
            )
        }))
        .await;
        for (platform, result) in results {
            if let Err(err) = result {
                tracing::warn!(platform = %platform, session = session_id, error = %err, "read receipt dispatch failed");
            }
        }

        Ok(changed)
    }

    /// Attaches an identity to the session. The id field is mandatory.
    pub async fn identify(
        &self,
        session_id: &str,
        identity: UserIdentity,
        user_phone: Option<String>,
    ) -> Result<(), EngineError> {
        if identity.id.trim().is_empty() {
            return Err(EngineError::IdentityIdRequired);
        }
        let mut session = self.require_session(session_id).await?;
        session.identity = Some(identity);
        if user_phone.is_some() {
            session.user_phone = user_phone;
        }
        self.touch(&mut session).await?;

        let session_ref = &session;
        let results = join_all(self.bridges.iter().map(|bridge| async move {
            (bridge.platform(), bridge.on_identity_update(session_ref).await)
        }))
        .await;
        for (platform, result) in results {
            if let Err(err) = result {
                tracing::warn!(platform = %platform, session = session_id, error = %err, "identity dispatch failed");
            }
        }

        self.broadcaster
            .broadcast(
                session_id,
                &WidgetEvent::new("identity_updated", to_value(&session.identity)?),
            )
            .await;
        Ok(())
    }

    pub fn on_event(&self, name: &str, handler: EventHandler) -> HandlerId {
        self.bus.on(name, handler)
    }

    pub fn off_event(&self, name: &str, id: HandlerId) -> bool {
        self.bus.off(name, id)
    }

    /// Routes a custom event through registered handlers, then the bridges.
    /// Every consumer is isolated; a failure is logged and skipped.
    pub async fn handle_custom_event(
        &self,
        session_id: &str,
        event: CustomEvent,
    ) -> Result<usize, EngineError> {
        let session = self.require_session(session_id).await?;
        let handled = self.bus.emit(&event, &session);

        let event_ref = &event;
        let session_ref = &session;
        let results = join_all(self.bridges.iter().map(|bridge| async move {
            (
                bridge.platform(),
                bridge.on_custom_event(event_ref, session_ref).await,
            )
        }))
        .await;
        for (platform, result) in results {
            if let Err(err) = result {
                tracing::warn!(platform = %platform, event = %event.name, error = %err, "custom event dispatch failed");
            }
        }

        self.broadcaster
            .broadcast(
                session_id,
                &WidgetEvent::new(
                    "custom_event",
                    json!({ "name": event.name, "data": event.data }),
                ),
            )
            .await;
        Ok(handled)
    }

    /// Visitor typing indicator, forwarded to the platforms.
    pub async fn visitor_typing(&self, session_id: &str, typing: bool) {
        let results = join_all(self.bridges.iter().map(|bridge| async move {
            (bridge.platform(), bridge.on_typing(session_id, typing).await)
        }))
        .await;
        for (platform, result) in results {
            if let Err(err) = result {
                tracing::debug!(platform = %platform, session = session_id, error = %err, "typing dispatch failed");
            }
        }
    }

    /// Operator typing indicator, pushed to the widget.
    pub async fn operator_typing(&self, session_id: &str, typing: bool) {
        self.broadcaster
            .broadcast(
                session_id,
                &WidgetEvent::new("typing", json!({ "typing": typing, "sender": "operator" })),
            )
            .await;
    }

    pub fn is_operator_online(&self) -> bool {
        self.operator_online.load(Ordering::Relaxed)
    }

    pub async fn set_operator_online(&self, online: bool) {
        self.operator_online.store(online, Ordering::Relaxed);
        self.broadcaster
            .broadcast_all(&WidgetEvent::new(
                "operator_presence",
                json!({ "online": online }),
            ))
            .await;
    }

    /// Hands the session to the AI until an operator replies.
    pub async fn ai_takeover(&self, session_id: &str, reason: &str) -> Result<(), EngineError> {
        let mut session = self.require_session(session_id).await?;
        session.ai_active = true;
        self.touch(&mut session).await?;

        let session_ref = &session;
        let results = join_all(self.bridges.iter().map(|bridge| async move {
            (bridge.platform(), bridge.on_ai_takeover(session_ref, reason).await)
        }))
        .await;
        for (platform, result) in results {
            if let Err(err) = result {
                tracing::warn!(platform = %platform, session = session_id, error = %err, "ai takeover dispatch failed");
            }
        }

        self.broadcaster
            .broadcast(
                session_id,
                &WidgetEvent::new("ai_takeover", json!({ "reason": reason })),
            )
            .await;
        Ok(())
    }

    /// Notifies bridges and the widget that the session ended. The session
    /// record stays in storage until cleanup.
    pub async fn close_session(&self, session_id: &str) -> Result<(), EngineError> {
        let session = self.require_session(session_id).await?;

        let session_ref = &session;
        let results = join_all(self.bridges.iter().map(|bridge| async move {
            (bridge.platform(), bridge.on_session_closed(session_ref).await)
        }))
        .await;
        for (platform, result) in results {
            if let Err(err) = result {
                tracing::warn!(platform = %platform, session = session_id, error = %err, "session close dispatch failed");
            }
        }

        self.broadcaster
            .broadcast(session_id, &WidgetEvent::new("session_closed", Value::Null))
            .await;
        Ok(())
    }

    /// Maps a platform thread key back to a canonical session id. Falls
    /// back to treating the key as a session id for mirrors created before
    /// the index existed.
    pub async fn session_for_thread(
        &self,
        platform: Platform,
        thread_key: &str,
    ) -> Result<Option<String>, EngineError> {
        if let Some(session_id) = self.threads.session_for(platform, thread_key) {
            return Ok(Some(session_id));
        }
        if self.storage.get_session(thread_key).await?.is_some() {
            return Ok(Some(thread_key.to_string()));
        }
        Ok(None)
    }

    pub fn register_sink(&self, session_id: &str, sink: Arc<dyn WidgetSink>) -> SinkId {
        self.broadcaster.register(session_id, sink)
    }

    pub fn unregister_sink(&self, session_id: &str, id: SinkId) {
        self.broadcaster.unregister(session_id, id);
    }

    pub async fn session(&self, session_id: &str) -> Result<Session, EngineError> {
        self.require_session(session_id).await
    }

    /// Drops sessions idle since before `cutoff`.
    pub async fn cleanup_sessions(&self, cutoff: OffsetDateTime) -> Result<usize, EngineError> {
        Ok(self.storage.cleanup_sessions(cutoff).await?)
    }
}
