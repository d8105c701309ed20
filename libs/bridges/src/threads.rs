use dashmap::DashMap;

use chatlink_core::Platform;

/// Two-way binding between canonical session ids and platform thread keys
/// (Telegram forum topic id, Discord thread channel id, Slack root `ts`).
///
/// Adapters bind when they create the platform-side thread; the webhook
/// layer resolves inbound thread keys back to sessions.
#[derive(Default)]
pub struct ThreadIndex {
    by_session: DashMap<String, String>,
    by_thread: DashMap<String, String>,
}

fn key(platform: Platform, id: &str) -> String {
    format!("{}/{id}", platform.as_str())
}

impl ThreadIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, platform: Platform, session_id: &str, thread_key: &str) {
        self.by_session
            .insert(key(platform, session_id), thread_key.to_string());
        self.by_thread
            .insert(key(platform, thread_key), session_id.to_string());
    }

    pub fn thread_for(&self, platform: Platform, session_id: &str) -> Option<String> {
        self.by_session
            .get(&key(platform, session_id))
            .map(|v| v.clone())
    }

    pub fn session_for(&self, platform: Platform, thread_key: &str) -> Option<String> {
        self.by_thread
            .get(&key(platform, thread_key))
            .map(|v| v.clone())
    }

    pub fn unbind(&self, platform: Platform, session_id: &str) {
        if let Some((_, thread_key)) = self.by_session.remove(&key(platform, session_id)) {
            self.by_thread.remove(&key(platform, &thread_key));
        }
    }
}
