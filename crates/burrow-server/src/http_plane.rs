use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use burrow_protocol::{encode, no_reply_response, ClientId, RequestId};

use crate::bus::MessageBus;
use crate::correlator::{Correlator, Outcome, WaitPolicy};
use crate::relay::{relay, takeover_io, RelayError, Takeover};

/// Bounds on how long a single caller may hold a connection
#[derive(Debug, Clone)]
pub struct ServeLimits {
    /// Time allowed to receive a complete request head
    pub header_read_timeout: Duration,
    /// Total lifetime of one connection
    pub connection_timeout: Duration,
}

impl Default for ServeLimits {
    fn default() -> Self {
        Self {
            header_read_timeout: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(600),
        }
    }
}

/// Public HTTP endpoint that tunnels every request over the message bus
pub struct HttpPlane {
    correlator: Correlator,
    limits: ServeLimits,
}

impl HttpPlane {
    pub fn new(bus: Arc<dyn MessageBus>, policy: WaitPolicy) -> Arc<Self> {
        Self::with_limits(bus, policy, ServeLimits::default())
    }

    pub fn with_limits(
        bus: Arc<dyn MessageBus>,
        policy: WaitPolicy,
        limits: ServeLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            correlator: Correlator::new(bus, policy),
            limits,
        })
    }

    /// Serve an HTTP connection on any AsyncRead + AsyncWrite stream
    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (io, takeover) = takeover_io(stream);
        let io = TokioIo::new(io);
        let limits = self.limits.clone();

        let service = service_fn(move |mut req: Request<Incoming>| {
            let this = self.clone();
            req.extensions_mut().insert(takeover.clone());
            async move { this.handle_request(req).await }
        });

        // Callers may half-close after sending the request and still expect
        // the response
        let conn = http1::Builder::new()
            .half_close(true)
            .timer(TokioTimer::new())
            .header_read_timeout(limits.header_read_timeout)
            .serve_connection(io, service);

        match tokio::time::timeout(limits.connection_timeout, conn).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("HTTP connection error from {}: {}", peer_addr, e);
            }
            Err(_) => {
                tracing::debug!(
                    "HTTP connection from {} exceeded {:?}, closing",
                    peer_addr,
                    limits.connection_timeout
                );
            }
        }
    }

    /// Start listening for HTTP traffic
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve HTTP traffic on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("Launching the server on http://{}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!("HTTP connection from {}", peer_addr);
            let this = self.clone();

            tokio::spawn(async move {
                this.serve_connection(stream, peer_addr).await;
            });
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        tracing::debug!(
            "HTTP request: {} {} (Host: {:?})",
            req.method(),
            req.uri(),
            req.headers().get(HOST)
        );

        let client = match request_host(&req) {
            Some(host) => ClientId::from_host(host),
            None => {
                tracing::warn!("Request without a host name");
                return Ok(plain_response(
                    StatusCode::BAD_REQUEST,
                    "Missing Host header".to_string(),
                ));
            }
        };

        let takeover = match req.extensions().get::<Takeover>() {
            Some(t) => t.clone(),
            None => {
                tracing::error!("Webserver doesn't support hijacking");
                return Ok(plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Webserver doesn't support hijacking".to_string(),
                ));
            }
        };

        let request_id = RequestId::new();
        tracing::info!("Sending request {} to remote name {}", request_id, client);

        let dump = match encode(req, &request_id).await {
            Ok(dump) => dump,
            Err(e) => {
                tracing::error!("Error converting the incoming request to plain-text: {}", e);
                return Ok(plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error converting the incoming request to plain-text: {}", e),
                ));
            }
        };

        // hyper stops reading while the handler runs, so watch the socket
        // for a reset ourselves
        let exchange = self
            .correlator
            .exchange(&client, &request_id, dump, takeover.peer_gone());
        tokio::pin!(exchange);
        let result = tokio::select! {
            result = &mut exchange => result,
            _ = takeover.watch_peer() => exchange.as_mut().await,
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Tunnel to {} failed: {}", client, e);
                return Ok(plain_response(
                    StatusCode::BAD_GATEWAY,
                    format!("Error tunnelling to {}: {}", client, e),
                ));
            }
        };

        let payload = match outcome {
            Outcome::Fulfilled(reply) => reply,
            Outcome::TimedOut => no_reply_response(self.correlator.policy().reply_timeout),
            Outcome::Cancelled => {
                tracing::debug!("Caller for {} disconnected before a reply", request_id);
                return Ok(Response::new(Full::new(Bytes::new())));
            }
        };

        match relay(&takeover, &payload).await {
            Ok(()) => {
                tracing::debug!("Relayed {} bytes for {}", payload.len(), request_id);
            }
            Err(RelayError::AlreadyTaken) => {
                tracing::error!("Error running hijack for {}", request_id);
                return Ok(plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Connection takeover failed".to_string(),
                ));
            }
            Err(RelayError::Io(e)) => {
                tracing::debug!("Caller for {} went away during relay: {}", request_id, e);
            }
        }

        // Never reaches the wire once the connection has been taken over
        Ok(Response::new(Full::new(Bytes::new())))
    }
}

/// Host name the request was addressed to
fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
}

fn plain_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_host_prefers_header() {
        let req = Request::builder()
            .uri("http://other.example.com/")
            .header("host", "foo.tunnel.example.com")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), Some("foo.tunnel.example.com"));
    }

    #[test]
    fn test_request_host_from_absolute_uri() {
        let req = Request::builder()
            .uri("http://bar:8080/path")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), Some("bar:8080"));
    }

    #[test]
    fn test_request_host_missing() {
        let req = Request::builder().uri("/path").body(()).unwrap();
        assert_eq!(request_host(&req), None);
    }

    #[test]
    fn test_plain_response() {
        let response = plain_response(StatusCode::BAD_GATEWAY, "down".to_string());
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
