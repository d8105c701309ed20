use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chatlink_core::{CustomEvent, Session};

/// Bucket name receiving every event regardless of its name.
pub const WILDCARD: &str = "*";

pub type EventHandler = Arc<dyn Fn(&CustomEvent, &Session) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Named-plus-wildcard handler registry for custom events.
///
/// Dispatch order is named handlers first, wildcard handlers second. A
/// failing handler is logged and never stops the others.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<(u64, EventHandler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, name: &str, handler: EventHandler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .expect("event bus lock poisoned")
            .entry(name.to_string())
            .or_default()
            .push((id, handler));
        HandlerId(id)
    }

    pub fn off(&self, name: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().expect("event bus lock poisoned");
        let Some(bucket) = handlers.get_mut(name) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|(handler_id, _)| *handler_id != id.0);
        before != bucket.len()
    }

    /// Runs matching handlers and returns how many were invoked.
    pub fn emit(&self, event: &CustomEvent, session: &Session) -> usize {
        let snapshot: Vec<EventHandler> = {
            let handlers = self.handlers.read().expect("event bus lock poisoned");
            let named = handlers.get(&event.name).into_iter().flatten();
            let wildcard = handlers.get(WILDCARD).into_iter().flatten();
            named.chain(wildcard).map(|(_, h)| h.clone()).collect()
        };

        for handler in &snapshot {
            if let Err(err) = handler(event, session) {
                tracing::warn!(event = %event.name, error = %err, "event handler failed");
            }
        }
        snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counter_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn named_then_wildcard_and_off() {
        let bus = EventBus::new();
        let named = Arc::new(AtomicUsize::new(0));
        let wild = Arc::new(AtomicUsize::new(0));
        let id = bus.on("cart_updated", counter_handler(named.clone()));
        bus.on(WILDCARD, counter_handler(wild.clone()));

        let session = Session::new("v-1");
        let event = CustomEvent {
            name: "cart_updated".into(),
            data: json!({"items": 3}),
        };
        assert_eq!(bus.emit(&event, &session), 2);
        assert_eq!(named.load(Ordering::SeqCst), 1);
        assert_eq!(wild.load(Ordering::SeqCst), 1);

        assert!(bus.off("cart_updated", id));
        assert!(!bus.off("cart_updated", id));
        assert_eq!(bus.emit(&event, &session), 1);
        assert_eq!(named.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_handler_does_not_stop_the_rest() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on("boom", Arc::new(|_, _| anyhow::bail!("handler exploded")));
        bus.on("boom", counter_handler(counter.clone()));

        let session = Session::new("v-1");
        let event = CustomEvent {
            name: "boom".into(),
            data: serde_json::Value::Null,
        };
        assert_eq!(bus.emit(&event, &session), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
