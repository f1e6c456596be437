//! MQTT implementation of the message bus
//!
//! One broker connection is made at startup and shared by every request.
//! Local subscriptions are reference counted per topic: the broker only sees
//! a SUBSCRIBE for the first handler on a topic and an UNSUBSCRIBE when the
//! last one is removed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusError, MessageBus};
use crate::state::{MessageHandler, Removal, SubscriptionId, SubscriptionRegistry};

/// Maximum MQTT packet size (16 MB), large enough for buffered HTTP bodies
const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Capacity of the client -> event loop request queue
const REQUEST_CAPACITY: usize = 256;

/// Pause between reconnect attempts after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long shutdown waits for the event loop to flush DISCONNECT
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Connection settings for the broker
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

/// Message bus backed by an MQTT broker
pub struct MqttBus {
    client: AsyncClient,
    registry: Arc<SubscriptionRegistry>,
    /// Serializes subscribe/unsubscribe so broker SUBSCRIBE and UNSUBSCRIBE
    /// for the same topic cannot be reordered
    ops: tokio::sync::Mutex<()>,
    stop: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Connect to the broker and start dispatching incoming messages
    ///
    /// Fails if the broker does not acknowledge the connection within
    /// `connect_timeout`.
    pub async fn connect(settings: &MqttSettings) -> Result<Arc<Self>, BusError> {
        let broker = format!("{}:{}", settings.host, settings.port);

        let mut options =
            MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        match tokio::time::timeout(settings.connect_timeout, wait_for_connack(&mut eventloop)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(BusError::Connect {
                    broker,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(BusError::Connect {
                    broker,
                    reason: "timed out waiting for CONNACK".to_string(),
                })
            }
        }

        tracing::info!(
            "Connected to MQTT broker {} as {}",
            broker,
            settings.client_id
        );

        let registry = SubscriptionRegistry::new();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            registry.clone(),
            stop.clone(),
        ));

        Ok(Arc::new(Self {
            client,
            registry,
            ops: tokio::sync::Mutex::new(()),
            stop,
            event_loop: Mutex::new(Some(handle)),
        }))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

/// Drive the connection, routing incoming publishes to local handlers
async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    registry: Arc<SubscriptionRegistry>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let delivered = registry.dispatch(&publish.topic, &publish.payload);
                tracing::trace!(
                    "MQTT message on {} ({} bytes) delivered to {} handlers",
                    publish.topic,
                    publish.payload.len(),
                    delivered
                );
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Clean session: the broker forgot our subscriptions
                let topics = registry.topics();
                tracing::info!(
                    "Reconnected to MQTT broker, restoring {} subscriptions",
                    topics.len()
                );
                for topic in topics {
                    if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
                        tracing::warn!("Failed to restore subscription to {}: {}", topic, e);
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    tracing::warn!("Broker rejected subscription (pkid {})", ack.pkid);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("MQTT connection error: {}", e);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    tracing::debug!("MQTT event loop stopped");
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, BusError> {
        let _guard = self.ops.lock().await;

        let (id, first) = self.registry.insert(topic, handler);
        if first {
            if let Err(e) = self.client.subscribe(topic, QoS::AtMostOnce).await {
                self.registry.remove(topic, id);
                return Err(BusError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                });
            }
            tracing::debug!("Subscribed to {}", topic);
        }
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), BusError> {
        let _guard = self.ops.lock().await;

        match self.registry.remove(topic, id) {
            Removal::LastForTopic => {
                self.client
                    .unsubscribe(topic)
                    .await
                    .map_err(|e| BusError::Unsubscribe {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    })?;
                tracing::debug!("Unsubscribed from {}", topic);
            }
            Removal::Remaining => {}
            Removal::Missing => {
                tracing::debug!("Unknown subscription {:?} on {}", id, topic);
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        let _guard = self.ops.lock().await;

        let topics = self.registry.topics();
        tracing::info!("Releasing {} MQTT subscriptions", topics.len());
        self.registry.clear();

        for topic in topics {
            if let Err(e) = self.client.unsubscribe(topic.clone()).await {
                tracing::warn!("Failed to unsubscribe from {}: {}", topic, e);
            }
        }

        let disconnected = self.client.disconnect().await;

        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!("MQTT event loop did not stop in time");
            }
        }
        self.stop.cancel();

        disconnected.map_err(|e| BusError::Disconnect {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // Reserve a port, then free it so nothing listens there
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = MqttSettings {
            host: "127.0.0.1".to_string(),
            port,
            client_id: "burrow-test".to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
        };

        match MqttBus::connect(&settings).await {
            Err(BusError::Connect { broker, .. }) => {
                assert_eq!(broker, format!("127.0.0.1:{}", port));
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_reports_disconnect_failure() {
        let options = MqttOptions::new("burrow-test", "127.0.0.1", 1883);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        // Without an event loop nothing can accept the DISCONNECT request
        drop(eventloop);

        let bus = MqttBus {
            client,
            registry: SubscriptionRegistry::new(),
            ops: tokio::sync::Mutex::new(()),
            stop: CancellationToken::new(),
            event_loop: Mutex::new(None),
        };

        match bus.shutdown().await {
            Err(BusError::Disconnect { reason }) => assert!(!reason.is_empty()),
            other => panic!("unexpected shutdown result: {:?}", other),
        }
        assert!(bus.stop.is_cancelled());
    }
}
