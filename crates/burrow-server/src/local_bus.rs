//! In-process message bus
//!
//! Delivers publishes synchronously to every handler on the topic, echoing
//! the publisher's own messages back to it the way an MQTT broker does.
//! Used by tests and when embedding the server next to its tunnel clients.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::bus::{BusError, MessageBus};
use crate::state::{MessageHandler, Removal, SubscriptionId, SubscriptionRegistry};

pub struct LocalBus {
    registry: Arc<SubscriptionRegistry>,
    publishes: AtomicU64,
    subscribes: AtomicU64,
    unsubscribes: AtomicU64,
    /// Whether to simulate failures on publish
    fail_publish: AtomicBool,
    /// Whether to simulate failures on subscribe
    fail_subscribe: AtomicBool,
    /// Whether to simulate failures on unsubscribe
    fail_unsubscribe: AtomicBool,
    closed: AtomicBool,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of publish calls that reached the bus
    pub fn publish_count(&self) -> u64 {
        self.publishes.load(Ordering::SeqCst)
    }

    /// Number of subscribe calls that reached the bus
    pub fn subscribe_count(&self) -> u64 {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Number of unsubscribe attempts, failed ones included
    pub fn unsubscribe_count(&self) -> u64 {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Handlers currently installed on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.handler_count(topic)
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unsubscribe(&self, fail: bool) {
        self.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self {
            registry: Arc::new(SubscriptionRegistry::default()),
            publishes: AtomicU64::new(0),
            subscribes: AtomicU64::new(0),
            unsubscribes: AtomicU64::new(0),
            fail_publish: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fail_unsubscribe: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        self.ensure_open()?;
        self.publishes.fetch_add(1, Ordering::SeqCst);
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                topic: topic.to_string(),
                reason: "Simulated publish failure".into(),
            });
        }

        let delivered = self.registry.dispatch(topic, &payload);
        tracing::trace!(
            "LocalBus: {} bytes on {} delivered to {} handlers",
            payload.len(),
            topic,
            delivered
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, BusError> {
        self.ensure_open()?;
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BusError::Subscribe {
                topic: topic.to_string(),
                reason: "Simulated subscribe failure".into(),
            });
        }

        let (id, _) = self.registry.insert(topic, handler);
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), BusError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(BusError::Unsubscribe {
                topic: topic.to_string(),
                reason: "Simulated unsubscribe failure".into(),
            });
        }

        if self.registry.remove(topic, id) == Removal::Missing {
            tracing::debug!("LocalBus: unknown subscription {:?} on {}", id, topic);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::SeqCst);
        self.registry.clear();
        Ok(())
    }
}
