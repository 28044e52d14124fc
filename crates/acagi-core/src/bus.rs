use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tracing::error;

pub const TOPIC_TASK_CREATED: &str = "task.created";
pub const TOPIC_TASK_UPDATED: &str = "task.updated";
pub const TOPIC_TASK_STATUS: &str = "task.status";
pub const TOPIC_TASK_DIFF: &str = "task.diff";
pub const TOPIC_TASK_DELETED: &str = "task.deleted";
pub const TOPIC_TASK_CONVERSATION: &str = "task.conversation";
pub const TOPIC_SYSTEM_METRICS: &str = "system.metrics";

/// Subscribe-only wildcard covering every `task.` topic.
pub const TOPIC_TASK_WILDCARD: &str = "task.*";

const TOPICS: [&str; 7] = [
    TOPIC_TASK_CREATED,
    TOPIC_TASK_UPDATED,
    TOPIC_TASK_STATUS,
    TOPIC_TASK_DIFF,
    TOPIC_TASK_DELETED,
    TOPIC_TASK_CONVERSATION,
    TOPIC_SYSTEM_METRICS,
];

pub type Payload = Map<String, Value>;

type Callback = Arc<dyn Fn(&str, &Payload) + Send + Sync>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown topic: {0}")]
    BadTopic(String),
    #[error("payload must be a JSON object")]
    BadPayload,
}

struct Entry {
    id: u64,
    topic: String,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

/// In-process pub/sub over a closed topic set. Dispatch happens on the
/// publishing thread; the registry lock is released before any callback
/// runs, so subscribers may publish or unsubscribe re-entrantly.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Result<Subscription, BusError>
    where
        F: Fn(&str, &Payload) + Send + Sync + 'static,
    {
        if topic != TOPIC_TASK_WILDCARD && !TOPICS.contains(&topic) {
            return Err(BusError::BadTopic(topic.to_string()));
        }
        let mut registry = self.inner.lock().unwrap();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.push(Entry {
            id,
            topic: topic.to_string(),
            callback: Arc::new(callback),
        });
        Ok(Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        })
    }

    /// Deliver `payload` to every subscriber of `topic`, exact matches in
    /// registration order first, wildcard matches after. Returns how many
    /// subscribers fired.
    pub fn publish(&self, topic: &str, payload: Value) -> Result<usize, BusError> {
        if !TOPICS.contains(&topic) {
            return Err(BusError::BadTopic(topic.to_string()));
        }
        let map = match payload {
            Value::Object(map) => map,
            _ => return Err(BusError::BadPayload),
        };

        let wildcard_applies = topic.starts_with("task.");
        let (exact, wildcard) = {
            let registry = self.inner.lock().unwrap();
            let mut exact: Vec<Callback> = Vec::new();
            let mut wildcard: Vec<Callback> = Vec::new();
            for entry in &registry.entries {
                if entry.topic == topic {
                    exact.push(Arc::clone(&entry.callback));
                } else if wildcard_applies && entry.topic == TOPIC_TASK_WILDCARD {
                    wildcard.push(Arc::clone(&entry.callback));
                }
            }
            (exact, wildcard)
        };

        let mut delivered = 0usize;
        for callback in exact.into_iter().chain(wildcard) {
            let result = catch_unwind(AssertUnwindSafe(|| callback(topic, &map)));
            if result.is_err() {
                error!(event = "bus_subscriber_panic", topic = %topic, "subscriber panicked; continuing dispatch");
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

/// Handle for one subscription. Dropping it unsubscribes; calling
/// `unsubscribe` repeatedly is harmless.
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap();
            registry.entries.retain(|entry| entry.id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
