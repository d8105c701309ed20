use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;

use chatlink_core::{BridgeMessageIds, Message, Session};

use crate::Storage;

/// Dashmap-backed storage, the default backend and the test double.
#[derive(Default)]
pub struct MemoryStorage {
    sessions: DashMap<String, Session>,
    messages: DashMap<String, Message>,
    session_messages: DashMap<String, Vec<String>>,
    bridge_ids: DashMap<String, BridgeMessageIds>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_session(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }

    async fn find_session_by_visitor(&self, visitor_id: &str) -> anyhow::Result<Option<Session>> {
        let mut latest: Option<Session> = None;
        for entry in self.sessions.iter() {
            if entry.visitor_id != visitor_id {
                continue;
            }
            match &latest {
                Some(best) if best.last_activity >= entry.last_activity => {}
                _ => latest = Some(entry.clone()),
            }
        }
        Ok(latest)
    }

    async fn update_session(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.sessions.remove(session_id);
        if let Some((_, ids)) = self.session_messages.remove(session_id) {
            for message_id in ids {
                self.messages.remove(&message_id);
                self.bridge_ids.remove(&message_id);
            }
        }
        Ok(())
    }

    async fn save_message(&self, message: &Message) -> anyhow::Result<()> {
        let fresh = self.messages.insert(message.id.clone(), message.clone());
        if fresh.is_none() {
            self.session_messages
                .entry(message.session_id.clone())
                .or_default()
                .push(message.id.clone());
        }
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> anyhow::Result<Option<Message>> {
        Ok(self.messages.get(message_id).map(|m| m.clone()))
    }

    async fn get_messages(
        &self,
        session_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<Message>> {
        let Some(ids) = self.session_messages.get(session_id) else {
            return Ok(Vec::new());
        };
        let start = match after {
            Some(after_id) => match ids.iter().position(|id| id == after_id) {
                Some(pos) => pos + 1,
                None => 0,
            },
            None => 0,
        };
        let out = ids
            .iter()
            .skip(start)
            .filter_map(|id| self.messages.get(id).map(|m| m.clone()))
            .take(limit)
            .collect();
        Ok(out)
    }

    async fn update_message(&self, message: &Message) -> anyhow::Result<()> {
        self.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn save_bridge_ids(
        &self,
        message_id: &str,
        ids: &BridgeMessageIds,
    ) -> anyhow::Result<()> {
        // Entry API keeps the merge atomic per message id.
        self.bridge_ids
            .entry(message_id.to_string())
            .or_default()
            .merge_from(ids);
        Ok(())
    }

    async fn get_bridge_ids(&self, message_id: &str) -> anyhow::Result<Option<BridgeMessageIds>> {
        Ok(self.bridge_ids.get(message_id).map(|ids| ids.clone()))
    }

    async fn cleanup_sessions(&self, cutoff: OffsetDateTime) -> anyhow::Result<usize> {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.last_activity < cutoff)
            .map(|s| s.id.clone())
            .collect();
        for session_id in &stale {
            self.delete_session(session_id).await?;
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatlink_core::{Platform, Sender};
    use time::Duration;

    fn message(id: &str, session_id: &str) -> Message {
        let mut msg = Message::new(session_id, format!("msg {id}"), Sender::Visitor);
        msg.id = id.to_string();
        msg
    }

    #[tokio::test]
    async fn bridge_id_saves_merge_instead_of_overwrite() {
        let store = MemoryStorage::new();
        store
            .save_bridge_ids("m1", &BridgeMessageIds::for_platform(Platform::Telegram, "555"))
            .await
            .unwrap();
        store
            .save_bridge_ids("m1", &BridgeMessageIds::for_platform(Platform::Slack, "1727.0001"))
            .await
            .unwrap();

        let ids = store.get_bridge_ids("m1").await.unwrap().unwrap();
        assert_eq!(ids.telegram_message_id, Some(555));
        assert_eq!(ids.slack_message_ts.as_deref(), Some("1727.0001"));
    }

    #[tokio::test]
    async fn visitor_lookup_returns_latest_session() {
        let store = MemoryStorage::new();
        let mut old = Session::new("v-1");
        old.last_activity -= Duration::hours(2);
        let recent = Session::new("v-1");
        let other = Session::new("v-2");
        store.create_session(&old).await.unwrap();
        store.create_session(&recent).await.unwrap();
        store.create_session(&other).await.unwrap();

        let found = store.find_session_by_visitor("v-1").await.unwrap().unwrap();
        assert_eq!(found.id, recent.id);
        assert!(store.find_session_by_visitor("v-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn messages_paginate_after_a_message_id() {
        let store = MemoryStorage::new();
        for id in ["a", "b", "c", "d"] {
            store.save_message(&message(id, "s1")).await.unwrap();
        }

        let page = store.get_messages("s1", Some("b"), 10).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["c", "d"]);

        let capped = store.get_messages("s1", None, 2).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert!(store.get_messages("s2", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resaving_a_message_does_not_duplicate_ordering() {
        let store = MemoryStorage::new();
        let mut msg = message("a", "s1");
        store.save_message(&msg).await.unwrap();
        msg.content = "edited".into();
        store.save_message(&msg).await.unwrap();

        let page = store.get_messages("s1", None, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].content, "edited");
    }

    #[tokio::test]
    async fn cleanup_drops_idle_sessions_and_their_messages() {
        let store = MemoryStorage::new();
        let mut idle = Session::new("v-idle");
        idle.last_activity -= Duration::days(30);
        let live = Session::new("v-live");
        store.create_session(&idle).await.unwrap();
        store.create_session(&live).await.unwrap();
        store.save_message(&message("m-idle", &idle.id)).await.unwrap();

        let removed = store
            .cleanup_sessions(OffsetDateTime::now_utc() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_session(&idle.id).await.unwrap().is_none());
        assert!(store.get_message("m-idle").await.unwrap().is_none());
        assert!(store.get_session(&live.id).await.unwrap().is_some());
    }
}
