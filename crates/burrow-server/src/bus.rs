//! Message bus abstraction
//!
//! The server only ever publishes, subscribes and unsubscribes. This trait
//! lets it run against an MQTT broker in production or an in-process bus in
//! tests and embedded setups.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::state::{MessageHandler, SubscriptionId};

/// Errors from message bus operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Failed to connect to broker {broker}: {reason}")]
    Connect { broker: String, reason: String },

    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Failed to unsubscribe from {topic}: {reason}")]
    Unsubscribe { topic: String, reason: String },

    #[error("Failed to disconnect from broker: {reason}")]
    Disconnect { reason: String },

    #[error("Bus is shut down")]
    Closed,
}

/// Publish/subscribe transport shared by every in-flight request
///
/// Subscriptions are additive: each call to `subscribe` installs its own
/// handler and every handler on a topic sees every message published there
/// afterwards, including the subscriber's own publishes.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError>;

    /// Install a handler on a topic
    ///
    /// # Returns
    /// An identifier to pass to `unsubscribe`
    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, BusError>;

    /// Remove a handler previously installed with `subscribe`
    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), BusError>;

    /// Drop every subscription and release the transport
    async fn shutdown(&self) -> Result<(), BusError>;
}
