use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chatlink_core::WidgetEvent;

/// One connected widget transport (in production a websocket writer).
#[async_trait]
pub trait WidgetSink: Send + Sync {
    async fn deliver(&self, event: &WidgetEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(u64);

/// Per-session registry of widget sinks. A sink that fails delivery is
/// treated as a dead connection and dropped from the registry.
#[derive(Default)]
pub struct SessionBroadcaster {
    sinks: DashMap<String, Vec<(u64, Arc<dyn WidgetSink>)>>,
    next_id: AtomicU64,
}

impl SessionBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str, sink: Arc<dyn WidgetSink>) -> SinkId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks
            .entry(session_id.to_string())
            .or_default()
            .push((id, sink));
        SinkId(id)
    }

    pub fn unregister(&self, session_id: &str, id: SinkId) {
        if let Some(mut bucket) = self.sinks.get_mut(session_id) {
            bucket.retain(|(sink_id, _)| *sink_id != id.0);
        }
    }

    pub fn sink_count(&self, session_id: &str) -> usize {
        self.sinks.get(session_id).map_or(0, |b| b.len())
    }

    /// Delivers to every sink of the session, returning how many succeeded.
    pub async fn broadcast(&self, session_id: &str, event: &WidgetEvent) -> usize {
        let snapshot: Vec<(u64, Arc<dyn WidgetSink>)> = match self.sinks.get(session_id) {
            Some(bucket) => bucket.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, sink) in snapshot {
            match sink.deliver(event).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(session = session_id, error = %err, "dropping dead widget sink");
                    dead.push(id);
                }
            }
        }
        if !dead.is_empty() {
            if let Some(mut bucket) = self.sinks.get_mut(session_id) {
                bucket.retain(|(id, _)| !dead.contains(id));
            }
        }
        delivered
    }

    /// Delivers to every session, used for operator presence changes.
    pub async fn broadcast_all(&self, event: &WidgetEvent) {
        let session_ids: Vec<String> = self.sinks.iter().map(|e| e.key().clone()).collect();
        for session_id in session_ids {
            self.broadcast(&session_id, event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<WidgetEvent>>,
    }

    #[async_trait]
    impl WidgetSink for RecordingSink {
        async fn deliver(&self, event: &WidgetEvent) -> anyhow::Result<()> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WidgetSink for FailingSink {
        async fn deliver(&self, _event: &WidgetEvent) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("connection closed")
        }
    }

    #[tokio::test]
    async fn broadcasts_to_registered_sinks_only() {
        let broadcaster = SessionBroadcaster::new();
        let sink = Arc::new(RecordingSink::default());
        broadcaster.register("s-1", sink.clone());

        let event = WidgetEvent::new("message", json!({"id": "m1"}));
        assert_eq!(broadcaster.broadcast("s-1", &event).await, 1);
        assert_eq!(broadcaster.broadcast("s-2", &event).await, 0);
        assert_eq!(sink.events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn dead_sinks_are_dropped_after_one_failure() {
        let broadcaster = SessionBroadcaster::new();
        let dead = Arc::new(FailingSink {
            calls: AtomicUsize::new(0),
        });
        let live = Arc::new(RecordingSink::default());
        broadcaster.register("s-1", dead.clone());
        broadcaster.register("s-1", live.clone());

        let event = WidgetEvent::new("typing", json!({"typing": true}));
        assert_eq!(broadcaster.broadcast("s-1", &event).await, 1);
        assert_eq!(broadcaster.sink_count("s-1"), 1);

        broadcaster.broadcast("s-1", &event).await;
        assert_eq!(dead.calls.load(Ordering::SeqCst), 1);
        assert_eq!(live.events.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn unregister_removes_the_sink() {
        let broadcaster = SessionBroadcaster::new();
        let sink = Arc::new(RecordingSink::default());
        let id = broadcaster.register("s-1", sink);
        broadcaster.unregister("s-1", id);
        assert_eq!(broadcaster.sink_count("s-1"), 0);
    }
}
