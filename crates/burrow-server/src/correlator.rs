//! Request/reply correlation over the message bus
//!
//! The bus has no request/response primitive. A request is published to the
//! client's topic, the same topic is subscribed, and the first reply that
//! belongs to this request is taken:
//!
//! ```text
//! Idle -> Published -> Subscribed -> Waiting -> Fulfilled | TimedOut | Cancelled
//!                                                   \_________|__________/
//!                                                        Unsubscribed
//! ```
//!
//! Replies are told apart from the echoed request by the reply sigil, and
//! from replies to other requests on the same topic by the request id.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use burrow_protocol::{decode, reply_request_id, topic, ClientId, RequestId};

use crate::bus::{BusError, MessageBus};
use crate::state::{MessageHandler, SubscriptionId};

/// How long and how a request waits for its reply
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    /// Total time to wait for a reply
    pub reply_timeout: Duration,
    /// Interval between "still waiting" log lines
    pub poll_interval: Duration,
    /// Ignore replies that do not echo the request id
    pub require_request_id: bool,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            require_request_id: false,
        }
    }
}

/// Terminal state of one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Raw HTTP response bytes from the tunnel client
    Fulfilled(Bytes),
    /// No reply before the deadline
    TimedOut,
    /// The caller went away while waiting
    Cancelled,
}

/// Errors that abort an exchange before the wait starts
#[derive(Debug, Error)]
pub enum CorrelateError {
    #[error("Publish failed: {0}")]
    Publish(#[source] BusError),

    #[error("Subscribe failed: {0}")]
    Subscribe(#[source] BusError),
}

/// Correlation state for one in-flight request
struct PendingRequest {
    topic: String,
    request_id: RequestId,
    deadline: Instant,
    reply: oneshot::Receiver<Bytes>,
}

/// Publishes requests and waits for the matching reply
pub struct Correlator {
    bus: Arc<dyn MessageBus>,
    policy: WaitPolicy,
}

impl Correlator {
    pub fn new(bus: Arc<dyn MessageBus>, policy: WaitPolicy) -> Self {
        Self { bus, policy }
    }

    pub fn policy(&self) -> &WaitPolicy {
        &self.policy
    }

    /// Send `request` to `client` and wait for its reply.
    ///
    /// A publish failure returns before anything is subscribed. Once the
    /// subscription exists it is released exactly once, whatever the outcome;
    /// an unsubscribe failure is only logged.
    pub async fn exchange(
        &self,
        client: &ClientId,
        request_id: &RequestId,
        request: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Outcome, CorrelateError> {
        let topic = topic(client);

        self.bus
            .publish(&topic, request)
            .await
            .map_err(CorrelateError::Publish)?;
        tracing::debug!("Published request {} to {}", request_id, topic);

        let (reply_tx, reply_rx) = oneshot::channel();
        let handler = reply_handler(
            request_id.clone(),
            self.policy.require_request_id,
            reply_tx,
        );
        let id = self
            .bus
            .subscribe(&topic, handler)
            .await
            .map_err(CorrelateError::Subscribe)?;
        let subscription = ActiveSubscription {
            bus: self.bus.clone(),
            topic: topic.clone(),
            id: Some(id),
        };

        let pending = PendingRequest {
            topic,
            request_id: request_id.clone(),
            deadline: Instant::now() + self.policy.reply_timeout,
            reply: reply_rx,
        };
        let outcome = self.wait(pending, cancel).await;

        subscription.release().await;
        Ok(outcome)
    }

    async fn wait(&self, pending: PendingRequest, cancel: &CancellationToken) -> Outcome {
        let PendingRequest {
            topic,
            request_id,
            deadline,
            mut reply,
        } = pending;

        let deadline = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline);

        let interval = self.policy.poll_interval.max(Duration::from_millis(1));
        let mut progress = tokio::time::interval_at(Instant::now() + interval, interval);

        loop {
            tokio::select! {
                biased;

                result = &mut reply => {
                    return match result {
                        Ok(bytes) => {
                            tracing::debug!(
                                "Reply for {} on {} ({} bytes)",
                                request_id,
                                topic,
                                bytes.len()
                            );
                            Outcome::Fulfilled(bytes)
                        }
                        Err(_) => {
                            tracing::warn!("Subscription to {} closed before a reply", topic);
                            Outcome::TimedOut
                        }
                    };
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("Caller for {} went away, abandoning wait", request_id);
                    return Outcome::Cancelled;
                }
                _ = &mut deadline => {
                    tracing::info!("No reply on {} for request {}", topic, request_id);
                    return Outcome::TimedOut;
                }
                _ = progress.tick() => {
                    tracing::debug!("Awaiting a reply on {} for {}", topic, request_id);
                }
            }
        }
    }
}

/// Build the subscription callback that records the first matching reply
fn reply_handler(
    request_id: RequestId,
    require_request_id: bool,
    reply_tx: oneshot::Sender<Bytes>,
) -> MessageHandler {
    let slot = Mutex::new(Some(reply_tx));

    Arc::new(move |message: &Bytes| {
        // Our own request echoed back, or anything else without the sigil
        let Some(reply) = decode(message) else {
            return;
        };

        match reply_request_id(&reply) {
            Some(id) if id != request_id.as_str() => {
                tracing::trace!("Ignoring reply for request {}", id);
                return;
            }
            None if require_request_id => {
                tracing::trace!("Ignoring untagged reply while waiting for {}", request_id);
                return;
            }
            _ => {}
        }

        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(reply);
        }
    })
}

/// Subscription held for the duration of one exchange
///
/// Released explicitly on every normal path. If the exchange future is
/// dropped mid-wait, the release runs on a spawned task instead.
struct ActiveSubscription {
    bus: Arc<dyn MessageBus>,
    topic: String,
    id: Option<SubscriptionId>,
}

impl ActiveSubscription {
    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            unsubscribe(self.bus.as_ref(), &self.topic, id).await;
        }
    }
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };

        let bus = self.bus.clone();
        let topic = std::mem::take(&mut self.topic);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    unsubscribe(bus.as_ref(), &topic, id).await;
                });
            }
            Err(_) => {
                tracing::warn!("No runtime to release subscription on {}", topic);
            }
        }
    }
}

async fn unsubscribe(bus: &dyn MessageBus, topic: &str, id: SubscriptionId) {
    if let Err(e) = bus.unsubscribe(topic, id).await {
        tracing::warn!("Failed to unsubscribe from {}: {}", topic, e);
    }
}
