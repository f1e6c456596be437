//! Test server harness for E2E tests
//!
//! Starts an HTTP plane on an ephemeral port wired to a [`LocalBus`], so
//! tests can attach tunnel clients to the same bus.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use burrow_server::{HttpPlane, LocalBus, MessageBus, ServeLimits, WaitPolicy};

/// Domain every tunnel host name is placed under in tests
const BASE_DOMAIN: &str = "tunnel.example.com";

/// A running test server instance
pub struct TestServer {
    /// HTTP plane address
    pub http_addr: SocketAddr,
    /// Bus the server publishes requests on
    pub bus: Arc<LocalBus>,
    /// Policy the server waits for replies with
    pub policy: WaitPolicy,
    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// Start a test server with a short reply timeout
    pub async fn start() -> Self {
        Self::start_with_policy(WaitPolicy {
            reply_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(250),
            require_request_id: false,
        })
        .await
    }

    /// Start a test server with an explicit wait policy
    pub async fn start_with_policy(policy: WaitPolicy) -> Self {
        Self::start_with_limits(policy, ServeLimits::default()).await
    }

    /// Start a test server with explicit connection timeouts
    pub async fn start_with_limits(policy: WaitPolicy, limits: ServeLimits) -> Self {
        let bus = LocalBus::new();
        let http_plane =
            HttpPlane::with_limits(bus.clone() as Arc<dyn MessageBus>, policy.clone(), limits);

        let http_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind HTTP plane");
        let http_addr = http_listener.local_addr().unwrap();

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                result = http_plane.run_with_listener(http_listener) => {
                    if let Err(e) = result {
                        tracing::error!("HTTP plane error: {}", e);
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::debug!("HTTP plane shutting down");
                }
            }
        });

        Self {
            http_addr,
            bus,
            policy,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Base URL of the HTTP plane (e.g., "http://127.0.0.1:40000")
    pub fn url(&self) -> String {
        format!("http://{}", self.http_addr)
    }

    /// Get the Host header value for a client id
    pub fn host_for(&self, client_id: &str) -> String {
        format!("{}.{}", client_id, BASE_DOMAIN)
    }

    /// Shutdown the test server
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
