//! Scripted tunnel client for E2E tests
//!
//! Subscribes to its `clients/<id>` topic, records every request dump it
//! receives and publishes a raw HTTP reply produced by a configurable
//! responder.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use burrow_protocol::{decode, dump_request_id, encode_reply, topic, ClientId, REQUEST_ID_HEADER};
use burrow_server::{MessageBus, MessageHandler, SubscriptionId};

/// A request dump as seen by the tunnel client
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Request target as written in the dump
    pub path: String,
    /// Headers in dump order
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Vec<u8>,
    /// Correlation id stamped by the server
    pub request_id: Option<String>,
    /// The dump exactly as received
    pub raw: Vec<u8>,
}

impl RecordedRequest {
    /// First header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Builds the raw HTTP reply for a request, or `None` to stay silent
pub type Responder = Arc<dyn Fn(&RecordedRequest) -> Option<Vec<u8>> + Send + Sync>;

struct Behaviour {
    responder: Responder,
    echo_request_id: bool,
    stray_reply: Option<Vec<u8>>,
    delay: Duration,
}

/// A tunnel client attached directly to the server's message bus
pub struct TestTunnelClient {
    pub client_id: ClientId,
    topic: String,
    bus: Arc<dyn MessageBus>,
    subscription: Option<SubscriptionId>,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    behaviour: Arc<RwLock<Behaviour>>,
    task: JoinHandle<()>,
}

impl TestTunnelClient {
    /// Subscribe to the client's topic and start answering requests
    pub async fn connect(bus: Arc<dyn MessageBus>, client_id: &str) -> anyhow::Result<Self> {
        let client_id = ClientId::from(client_id);
        let topic = topic(&client_id);

        let requests: Arc<RwLock<Vec<RecordedRequest>>> = Arc::new(RwLock::new(Vec::new()));
        let behaviour = Arc::new(RwLock::new(Behaviour {
            responder: Arc::new(|_: &RecordedRequest| {
                Some(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK".to_vec())
            }),
            echo_request_id: false,
            stray_reply: None,
            delay: Duration::ZERO,
        }));

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let handler: MessageHandler = Arc::new(move |payload: &Bytes| {
            // Our own replies come back on the same topic
            if decode(payload).is_none() {
                let _ = tx.send(payload.clone());
            }
        });
        let subscription = bus.subscribe(&topic, handler).await?;

        let task_bus = bus.clone();
        let task_topic = topic.clone();
        let task_requests = requests.clone();
        let task_behaviour = behaviour.clone();
        let task = tokio::spawn(async move {
            while let Some(dump) = rx.recv().await {
                let request = match parse_dump(&dump) {
                    Some(request) => request,
                    None => {
                        tracing::warn!("Test client got an unparseable dump on {}", task_topic);
                        continue;
                    }
                };
                tracing::debug!(
                    "Test client got {} {} ({:?})",
                    request.method,
                    request.path,
                    request.request_id
                );
                task_requests.write().push(request.clone());

                let (reply, stray, delay) = {
                    let behaviour = task_behaviour.read();
                    let reply = (behaviour.responder)(&request).map(|reply| {
                        match (&request.request_id, behaviour.echo_request_id) {
                            (Some(id), true) => tag_reply(&reply, id),
                            _ => reply,
                        }
                    });
                    let stray = behaviour
                        .stray_reply
                        .as_ref()
                        .map(|stray| tag_reply(stray, "00000000000000000000000000000000"));
                    (reply, stray, behaviour.delay)
                };

                let bus = task_bus.clone();
                let topic = task_topic.clone();
                tokio::spawn(async move {
                    // Let the server finish subscribing before answering
                    tokio::task::yield_now().await;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    for payload in stray.into_iter().chain(reply) {
                        if let Err(e) = bus.publish(&topic, encode_reply(&payload)).await {
                            tracing::warn!("Test client failed to reply on {}: {}", topic, e);
                        }
                    }
                });
            }
        });

        Ok(Self {
            client_id,
            topic,
            bus,
            subscription: Some(subscription),
            requests,
            behaviour,
            task,
        })
    }

    /// Reply with the same raw response to every request
    pub fn set_reply(&self, reply: impl Into<Vec<u8>>) {
        let reply = reply.into();
        self.set_responder(move |_| Some(reply.clone()));
    }

    /// Reply with whatever `responder` builds for each request
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&RecordedRequest) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.behaviour.write().responder = Arc::new(responder);
    }

    /// Record requests but never answer them
    pub fn set_silent(&self) {
        self.set_responder(|_| None);
    }

    /// Copy the request id header into every reply
    pub fn set_echo_request_id(&self, echo: bool) {
        self.behaviour.write().echo_request_id = echo;
    }

    /// Publish `reply` tagged with an unrelated request id before the real one
    pub fn set_stray_reply(&self, reply: impl Into<Vec<u8>>) {
        self.behaviour.write().stray_reply = Some(reply.into());
    }

    /// Wait this long before answering
    pub fn set_reply_delay(&self, delay: Duration) {
        self.behaviour.write().delay = delay;
    }

    /// Requests received so far
    pub fn get_requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().clone()
    }

    /// Stop answering and drop the subscription
    pub async fn disconnect(mut self) -> anyhow::Result<()> {
        if let Some(id) = self.subscription.take() {
            self.bus.unsubscribe(&self.topic, id).await?;
        }
        self.task.abort();
        Ok(())
    }
}

impl Drop for TestTunnelClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn parse_dump(dump: &[u8]) -> Option<RecordedRequest> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(dump).ok()? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return None,
    };

    Some(RecordedRequest {
        method: req.method?.to_string(),
        path: req.path?.to_string(),
        headers: req
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect(),
        body: dump[head_len..].to_vec(),
        request_id: dump_request_id(dump).map(str::to_string),
        raw: dump.to_vec(),
    })
}

/// Insert the request id header right after the status line
fn tag_reply(reply: &[u8], request_id: &str) -> Vec<u8> {
    let Some(end) = reply.windows(2).position(|w| w == b"\r\n") else {
        return reply.to_vec();
    };
    let header = format!("{}: {}\r\n", REQUEST_ID_HEADER, request_id);

    let mut tagged = Vec::with_capacity(reply.len() + header.len());
    tagged.extend_from_slice(&reply[..end + 2]);
    tagged.extend_from_slice(header.as_bytes());
    tagged.extend_from_slice(&reply[end + 2..]);
    tagged
}
