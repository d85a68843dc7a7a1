//! Typed publish/subscribe interface.
//!
//! The scheduler subscribes event-based triggers through [`EventBus`]; the
//! engine publishes execution-completion events through it. The bus is passed
//! in by the embedder. [`InMemoryEventBus`] is a synchronous in-process
//! implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// An event carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub module_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, module_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type: event_type.into(),
            module_id: module_id.into(),
            entity_id: None,
            data: None,
            timestamp,
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Look up `key` for filter matching: the `data` object first, then the
    /// top-level `module_id` / `entity_id` fields.
    pub fn field(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.data.as_ref().and_then(|d| d.get(key)) {
            return Some(v.clone());
        }
        match key {
            "module_id" => Some(Value::String(self.module_id.clone())),
            "entity_id" => self.entity_id.clone().map(Value::String),
            _ => None,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Opaque token returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

pub trait EventBus: Send + Sync {
    fn subscribe(&self, event_type: &str, handler: EventHandler) -> SubscriptionHandle;

    /// Remove a subscription. Unknown handles are ignored.
    fn unsubscribe(&self, handle: SubscriptionHandle);

    fn publish(&self, event: Event);
}

/// Synchronous in-process bus: `publish` calls matching handlers inline.
#[derive(Default)]
pub struct InMemoryEventBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(SubscriptionHandle, EventHandler)>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions for `event_type`.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .map(|h| h.get(event_type).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl EventBus for InMemoryEventBus {
    fn subscribe(&self, event_type: &str, handler: EventHandler) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut handlers) = self.handlers.write() {
            handlers
                .entry(event_type.to_owned())
                .or_default()
                .push((handle, handler));
        }
        debug!(event_type, ?handle, "subscribed");
        handle
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Ok(mut handlers) = self.handlers.write() {
            for subs in handlers.values_mut() {
                subs.retain(|(h, _)| *h != handle);
            }
            handlers.retain(|_, subs| !subs.is_empty());
        }
    }

    fn publish(&self, event: Event) {
        // Clone the handler list so handlers may (un)subscribe re-entrantly.
        let targets: Vec<EventHandler> = match self.handlers.read() {
            Ok(handlers) => handlers
                .get(&event.event_type)
                .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };
        for handler in targets {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (EventHandler, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: EventHandler = Arc::new(move |e: &Event| sink.lock().unwrap().push(e.clone()));
        (handler, seen)
    }

    #[test]
    fn publish_reaches_only_matching_subscribers() {
        let bus = InMemoryEventBus::new();
        let (notes, seen_notes) = recorder();
        let (tasks, seen_tasks) = recorder();
        bus.subscribe("note.created", notes);
        bus.subscribe("task.created", tasks);

        bus.publish(Event::new("note.created", "notes", Utc::now()));

        assert_eq!(seen_notes.lock().unwrap().len(), 1);
        assert!(seen_tasks.lock().unwrap().is_empty());
    }

    #[test]
    fn unsubscribe_removes_only_that_handle() {
        let bus = InMemoryEventBus::new();
        let (a, seen_a) = recorder();
        let (b, seen_b) = recorder();
        let handle_a = bus.subscribe("x", a);
        bus.subscribe("x", b);

        bus.unsubscribe(handle_a);
        bus.unsubscribe(handle_a);
        bus.publish(Event::new("x", "m", Utc::now()));

        assert!(seen_a.lock().unwrap().is_empty());
        assert_eq!(seen_b.lock().unwrap().len(), 1);
        assert_eq!(bus.subscriber_count("x"), 1);
    }

    #[test]
    fn field_prefers_data_then_top_level() {
        let event = Event::new("note.created", "notes", Utc::now())
            .with_entity("n-1")
            .with_data(json!({ "folder": "inbox", "module_id": "shadowed" }));

        assert_eq!(event.field("folder"), Some(json!("inbox")));
        assert_eq!(event.field("module_id"), Some(json!("shadowed")));
        assert_eq!(event.field("entity_id"), Some(json!("n-1")));
        assert_eq!(event.field("missing"), None);
    }
}
