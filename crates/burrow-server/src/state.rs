use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

/// Callback run for every message delivered on a subscribed topic
pub type MessageHandler = Arc<dyn Fn(&Bytes) + Send + Sync>;

/// Identifies one local subscription, several of which may share a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Result of removing a subscription from the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// No such subscription on that topic
    Missing,
    /// Other subscriptions on the topic remain
    Remaining,
    /// The topic has no subscribers left
    LastForTopic,
}

/// Shared registry of local subscriptions
/// Maps topic -> handlers, in subscription order
pub struct SubscriptionRegistry {
    topics: DashMap<String, Vec<(SubscriptionId, MessageHandler)>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a handler for `topic`.
    ///
    /// The returned flag is true when this is the first handler on the
    /// topic, i.e. when the broker needs to be told about it.
    pub fn insert(&self, topic: &str, handler: MessageHandler) -> (SubscriptionId, bool) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.topics.entry(topic.to_string()).or_default();
        let first = handlers.is_empty();
        handlers.push((id, handler));
        (id, first)
    }

    /// Remove one handler, dropping the topic once it is empty
    pub fn remove(&self, topic: &str, id: SubscriptionId) -> Removal {
        {
            let Some(mut handlers) = self.topics.get_mut(topic) else {
                return Removal::Missing;
            };
            let before = handlers.len();
            handlers.retain(|(sid, _)| *sid != id);
            if handlers.len() == before {
                return Removal::Missing;
            }
        }

        if self.topics.remove_if(topic, |_, h| h.is_empty()).is_some() {
            Removal::LastForTopic
        } else {
            Removal::Remaining
        }
    }

    /// Hand `payload` to every handler on `topic`, returning how many ran
    pub fn dispatch(&self, topic: &str, payload: &Bytes) -> usize {
        // Handlers run outside the shard lock so they may touch the registry
        let handlers: Vec<MessageHandler> = match self.topics.get(topic) {
            Some(entry) => entry.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };

        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    /// Topics with at least one live subscription
    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|r| r.key().clone()).collect()
    }

    /// Number of handlers currently installed on `topic`
    pub fn handler_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|h| h.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.topics.clear();
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self {
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (MessageHandler, Arc<Mutex<Vec<Bytes>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MessageHandler = Arc::new(move |msg: &Bytes| sink.lock().push(msg.clone()));
        (handler, seen)
    }

    #[test]
    fn test_first_insert_is_flagged() {
        let registry = SubscriptionRegistry::new();
        let (h1, _) = recorder();
        let (h2, _) = recorder();

        let (id1, first1) = registry.insert("clients/foo", h1);
        let (id2, first2) = registry.insert("clients/foo", h2);

        assert!(first1);
        assert!(!first2);
        assert_ne!(id1, id2);
        assert_eq!(registry.handler_count("clients/foo"), 2);
    }

    #[test]
    fn test_dispatch_fans_out() {
        let registry = SubscriptionRegistry::new();
        let (h1, seen1) = recorder();
        let (h2, seen2) = recorder();
        let (h3, seen3) = recorder();
        registry.insert("clients/foo", h1);
        registry.insert("clients/foo", h2);
        registry.insert("clients/bar", h3);

        let delivered = registry.dispatch("clients/foo", &Bytes::from_static(b"hello"));

        assert_eq!(delivered, 2);
        assert_eq!(seen1.lock().len(), 1);
        assert_eq!(seen2.lock().len(), 1);
        assert!(seen3.lock().is_empty());
        assert_eq!(registry.dispatch("clients/none", &Bytes::new()), 0);
    }

    #[test]
    fn test_remove_reports_last_subscriber() {
        let registry = SubscriptionRegistry::new();
        let (h1, _) = recorder();
        let (h2, _) = recorder();
        let (id1, _) = registry.insert("clients/foo", h1);
        let (id2, _) = registry.insert("clients/foo", h2);

        assert_eq!(registry.remove("clients/foo", id1), Removal::Remaining);
        assert_eq!(registry.remove("clients/foo", id1), Removal::Missing);
        assert_eq!(registry.remove("clients/foo", id2), Removal::LastForTopic);
        assert!(registry.topics().is_empty());
        assert_eq!(registry.remove("clients/foo", id2), Removal::Missing);
    }

    #[test]
    fn test_handler_may_reenter_registry() {
        let registry = SubscriptionRegistry::new();
        let inner = registry.clone();
        let handler: MessageHandler = Arc::new(move |_msg: &Bytes| {
            inner.insert("clients/other", Arc::new(|_: &Bytes| {}));
        });
        registry.insert("clients/foo", handler);

        assert_eq!(registry.dispatch("clients/foo", &Bytes::new()), 1);
        assert_eq!(registry.handler_count("clients/other"), 1);
    }
}
