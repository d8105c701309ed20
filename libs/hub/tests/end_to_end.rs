//! Hub behavior with scripted bridges standing in for the real platforms.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use time::OffsetDateTime;

use chatlink_bridges::{Bridge, BridgeMessageResult, SharedBridge, ThreadIndex};
use chatlink_core::{
    BridgeError, BridgeMessageIds, EngineError, Message, MessageStatus, Platform, Sender, Session,
    SessionMetadata, UserIdentity, WidgetEvent,
};
use chatlink_hub::{
    ConnectRequest, Hub, HubConfig, OperatorMessageRecord, SendMessageRequest, WidgetSink,
};
use chatlink_storage::MemoryStorage;

/// Records every hub call and answers with a scripted platform id.
struct ScriptedBridge {
    platform: Platform,
    fail_visitor: bool,
    next_id: AtomicUsize,
    new_sessions: AtomicUsize,
    operator_calls: Mutex<Vec<(String, String)>>,
    edit_calls: Mutex<Vec<String>>,
    delete_calls: Mutex<Vec<String>>,
    read_calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedBridge {
    fn new(platform: Platform) -> Arc<Self> {
        Arc::new(ScriptedBridge {
            platform,
            fail_visitor: false,
            next_id: AtomicUsize::new(500),
            new_sessions: AtomicUsize::new(0),
            operator_calls: Mutex::new(Vec::new()),
            edit_calls: Mutex::new(Vec::new()),
            delete_calls: Mutex::new(Vec::new()),
            read_calls: Mutex::new(Vec::new()),
        })
    }

    fn failing(platform: Platform) -> Arc<Self> {
        let mut bridge = ScriptedBridge::new(platform);
        Arc::get_mut(&mut bridge).unwrap().fail_visitor = true;
        bridge
    }

    fn operator_sources(&self) -> Vec<String> {
        self.operator_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, source)| source.clone())
            .collect()
    }
}

#[async_trait]
impl Bridge for ScriptedBridge {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn on_new_session(&self, _session: &Session) -> Result<(), BridgeError> {
        self.new_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_visitor_message(
        &self,
        _message: &Message,
        _session: &Session,
        _reply: Option<&BridgeMessageIds>,
    ) -> Result<BridgeMessageResult, BridgeError> {
        if self.fail_visitor {
            return Err(BridgeError::new("scripted.down", "platform unavailable"));
        }
        let platform_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        Ok(BridgeMessageResult {
            ids: Some(BridgeMessageIds::for_platform(self.platform, &platform_id)),
            raw: None,
        })
    }

    async fn on_operator_message(
        &self,
        message: &Message,
        _session: &Session,
        source_bridge: &str,
        _operator_name: Option<&str>,
    ) -> Result<(), BridgeError> {
        assert_ne!(source_bridge, self.name(), "echo was not suppressed");
        self.operator_calls
            .lock()
            .unwrap()
            .push((message.id.clone(), source_bridge.to_string()));
        Ok(())
    }

    async fn on_message_read(
        &self,
        _session_id: &str,
        message_ids: &[String],
        _status: MessageStatus,
    ) -> Result<(), BridgeError> {
        self.read_calls.lock().unwrap().push(message_ids.to_vec());
        Ok(())
    }

    async fn on_message_edit(
        &self,
        _session_id: &str,
        message_id: &str,
        _content: &str,
        _edited_at: OffsetDateTime,
    ) -> Result<Option<BridgeMessageIds>, BridgeError> {
        self.edit_calls.lock().unwrap().push(message_id.to_string());
        Ok(None)
    }

    async fn on_message_delete(
        &self,
        _session_id: &str,
        message_id: &str,
        _deleted_at: OffsetDateTime,
    ) -> Result<bool, BridgeError> {
        self.delete_calls.lock().unwrap().push(message_id.to_string());
        Ok(!self.fail_visitor)
    }
}

struct RecordingSink {
    events: Mutex<Vec<WidgetEvent>>,
}

#[async_trait]
impl WidgetSink for RecordingSink {
    async fn deliver(&self, event: &WidgetEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn build_hub(bridges: Vec<SharedBridge>) -> Hub {
    Hub::new(
        Arc::new(MemoryStorage::new()),
        bridges,
        Arc::new(ThreadIndex::new()),
        HubConfig::default(),
    )
}

async fn start_session(hub: &Hub) -> String {
    hub.connect(ConnectRequest::default())
        .await
        .unwrap()
        .session_id
}

#[tokio::test]
async fn operator_message_skips_its_source_platform() {
    let telegram = ScriptedBridge::new(Platform::Telegram);
    let discord = ScriptedBridge::new(Platform::Discord);
    let slack = ScriptedBridge::new(Platform::Slack);
    let hub = build_hub(vec![
        telegram.clone() as SharedBridge,
        discord.clone(),
        slack.clone(),
    ]);
    let session_id = start_session(&hub).await;

    hub.ai_takeover(&session_id, "after hours").await.unwrap();
    assert!(hub.session(&session_id).await.unwrap().ai_active);

    let message = hub
        .record_operator_message(OperatorMessageRecord {
            session_id: session_id.clone(),
            source: Platform::Telegram,
            platform_message_id: "999".into(),
            content: "hello from the team".into(),
            operator_name: Some("Dana".into()),
            attachments: Vec::new(),
            reply_to_platform_id: None,
        })
        .await
        .unwrap();

    assert_eq!(message.id, "telegram:999");
    assert!(telegram.operator_calls.lock().unwrap().is_empty());
    assert_eq!(discord.operator_sources(), vec!["telegram"]);
    assert_eq!(slack.operator_sources(), vec!["telegram"]);

    // The human reply switched the AI off and the source id was mapped.
    assert!(!hub.session(&session_id).await.unwrap().ai_active);
    let ids = hub
        .storage()
        .get_bridge_ids("telegram:999")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ids.telegram_message_id, Some(999));
    assert!(ids.discord_message_id.is_none());
}

#[tokio::test]
async fn one_failing_platform_does_not_block_the_rest() {
    let telegram = ScriptedBridge::new(Platform::Telegram);
    let discord = ScriptedBridge::failing(Platform::Discord);
    let slack = ScriptedBridge::new(Platform::Slack);
    let hub = build_hub(vec![
        telegram.clone() as SharedBridge,
        discord.clone(),
        slack.clone(),
    ]);
    let session_id = start_session(&hub).await;

    let sink = Arc::new(RecordingSink {
        events: Mutex::new(Vec::new()),
    });
    hub.register_sink(&session_id, sink.clone());

    let (message, dispatches) = hub
        .send_message(SendMessageRequest {
            session_id: session_id.clone(),
            content: "is anyone there?".into(),
            sender: Sender::Visitor,
            attachments: Vec::new(),
            reply_to_id: None,
        })
        .await
        .unwrap();

    assert_eq!(dispatches.len(), 3);
    for dispatch in &dispatches {
        assert_eq!(dispatch.ok, dispatch.platform != Platform::Discord);
    }

    // The mapping holds the two platforms that answered and nothing else.
    let ids = hub
        .storage()
        .get_bridge_ids(&message.id)
        .await
        .unwrap()
        .unwrap();
    assert!(ids.telegram_message_id.is_some());
    assert!(ids.slack_message_ts.is_some());
    assert!(ids.discord_message_id.is_none());

    let events = sink.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "message");
}

#[tokio::test]
async fn delete_reaches_every_bridge_and_is_idempotent() {
    let telegram = ScriptedBridge::new(Platform::Telegram);
    let slack = ScriptedBridge::new(Platform::Slack);
    let hub = build_hub(vec![telegram.clone() as SharedBridge, slack.clone()]);
    let session_id = start_session(&hub).await;

    let (message, _) = hub
        .send_message(SendMessageRequest {
            session_id: session_id.clone(),
            content: "delete me".into(),
            sender: Sender::Visitor,
            attachments: Vec::new(),
            reply_to_id: None,
        })
        .await
        .unwrap();

    let dispatches = hub.delete_message(&session_id, &message.id).await.unwrap();
    assert_eq!(dispatches.len(), 2);
    assert!(dispatches.iter().all(|d| d.ok));
    assert_eq!(telegram.delete_calls.lock().unwrap().len(), 1);
    assert_eq!(slack.delete_calls.lock().unwrap().len(), 1);

    let stored = hub
        .storage()
        .get_message(&message.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_deleted());

    // Second delete is a no-op, not an error.
    let again = hub.delete_message(&session_id, &message.id).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(telegram.delete_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn reconnect_resumes_and_keeps_server_geo() {
    let hub = build_hub(Vec::new());

    let first = hub
        .connect(ConnectRequest {
            metadata: Some(SessionMetadata {
                url: Some("https://shop.example/checkout".into()),
                ..Default::default()
            }),
            ip: Some("203.0.113.9".into()),
            country: Some("DE".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!first.resumed);

    // Same visitor, no session id, spoofed geo in the client payload.
    let second = hub
        .connect(ConnectRequest {
            visitor_id: Some(first.visitor_id.clone()),
            metadata: Some(SessionMetadata {
                url: Some("https://shop.example/cart".into()),
                ip: Some("198.51.100.1".into()),
                country: Some("ZZ".into()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(second.resumed);
    assert_eq!(second.session_id, first.session_id);

    let meta = hub
        .session(&first.session_id)
        .await
        .unwrap()
        .metadata
        .unwrap();
    assert_eq!(meta.ip.as_deref(), Some("203.0.113.9"));
    assert_eq!(meta.country.as_deref(), Some("DE"));
    assert_eq!(meta.url.as_deref(), Some("https://shop.example/cart"));
}

#[tokio::test]
async fn dashboard_operator_message_reaches_all_platforms() {
    let telegram = ScriptedBridge::new(Platform::Telegram);
    let discord = ScriptedBridge::new(Platform::Discord);
    let hub = build_hub(vec![telegram.clone() as SharedBridge, discord.clone()]);
    let session_id = start_session(&hub).await;

    hub.ai_takeover(&session_id, "night shift").await.unwrap();
    let (_, dispatches) = hub
        .send_message(SendMessageRequest {
            session_id: session_id.clone(),
            content: "an operator is here now".into(),
            sender: Sender::Operator,
            attachments: Vec::new(),
            reply_to_id: None,
        })
        .await
        .unwrap();

    assert_eq!(dispatches.len(), 2);
    assert_eq!(telegram.operator_sources(), vec!["dashboard"]);
    assert_eq!(discord.operator_sources(), vec!["dashboard"]);
    assert!(!hub.session(&session_id).await.unwrap().ai_active);
}

#[tokio::test]
async fn read_status_never_moves_backwards() {
    let telegram = ScriptedBridge::new(Platform::Telegram);
    let hub = build_hub(vec![telegram.clone() as SharedBridge]);
    let session_id = start_session(&hub).await;

    let (message, _) = hub
        .send_message(SendMessageRequest {
            session_id: session_id.clone(),
            content: "status check".into(),
            sender: Sender::Visitor,
            attachments: Vec::new(),
            reply_to_id: None,
        })
        .await
        .unwrap();

    let ids = vec![message.id.clone()];
    let changed = hub
        .mark_read(&session_id, &ids, MessageStatus::Read)
        .await
        .unwrap();
    assert_eq!(changed, ids);

    let stored = hub
        .storage()
        .get_message(&message.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MessageStatus::Read);
    assert!(stored.read_at.is_some());
    assert!(stored.delivered_at.is_some());

    // Delivered after Read changes nothing and fans out nothing.
    let changed = hub
        .mark_read(&session_id, &ids, MessageStatus::Delivered)
        .await
        .unwrap();
    assert!(changed.is_empty());
    assert_eq!(telegram.read_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn widget_can_only_edit_visitor_messages() {
    let hub = build_hub(Vec::new());
    let session_id = start_session(&hub).await;

    let recorded = hub
        .record_operator_message(OperatorMessageRecord {
            session_id: session_id.clone(),
            source: Platform::Slack,
            platform_message_id: "1727000000.000100".into(),
            content: "operator text".into(),
            operator_name: None,
            attachments: Vec::new(),
            reply_to_platform_id: None,
        })
        .await
        .unwrap();

    let err = hub
        .edit_message(&session_id, &recorded.id, "rewritten")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotVisitorMessage));
}

#[tokio::test]
async fn widget_cannot_delete_operator_messages() {
    let telegram = ScriptedBridge::new(Platform::Telegram);
    let hub = build_hub(vec![telegram.clone() as SharedBridge]);
    let session_id = start_session(&hub).await;

    let recorded = hub
        .record_operator_message(OperatorMessageRecord {
            session_id: session_id.clone(),
            source: Platform::Telegram,
            platform_message_id: "999".into(),
            content: "operator text".into(),
            operator_name: None,
            attachments: Vec::new(),
            reply_to_platform_id: None,
        })
        .await
        .unwrap();

    let err = hub
        .delete_message(&session_id, &recorded.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotVisitorMessage));

    // No bridge was told to delete and the record survived.
    assert!(telegram.delete_calls.lock().unwrap().is_empty());
    let stored = hub
        .storage()
        .get_message(&recorded.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.is_deleted());
}

#[tokio::test]
async fn identity_requires_an_id() {
    let hub = build_hub(Vec::new());
    let session_id = start_session(&hub).await;

    let err = hub
        .identify(
            &session_id,
            UserIdentity {
                id: "  ".into(),
                email: None,
                name: None,
                metadata: None,
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IdentityIdRequired));

    hub.identify(
        &session_id,
        UserIdentity {
            id: "u-42".into(),
            email: Some("ada@example.com".into()),
            name: Some("Ada".into()),
            metadata: None,
        },
        Some("+49123456".into()),
    )
    .await
    .unwrap();

    let session = hub.session(&session_id).await.unwrap();
    assert_eq!(session.identity.unwrap().id, "u-42");
    assert_eq!(session.user_phone.as_deref(), Some("+49123456"));
}
