//! Connection takeover
//!
//! Tunnel replies are complete HTTP responses, status line included, so they
//! cannot go through hyper's response path. Every accepted connection is
//! wrapped in a [`TakeoverIo`] before hyper sees it, and a [`Takeover`]
//! handle travels with each request. Taking over flips the adapter so that
//! hyper reads EOF and writes into the void while the relay owns the socket.
//!
//! A clean EOF from the peer is a half-close: the caller may still be
//! waiting for its response. Only a read error or a failed write marks the
//! peer as gone.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Errors from relaying a reply onto the caller's connection
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connection already taken over")]
    AlreadyTaken,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

trait RawConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawConn for T {}

/// Read chunk used while watching an idle connection
const WATCH_CHUNK: usize = 4096;

struct Shared {
    io: Box<dyn RawConn>,
    taken: bool,
    /// Bytes read by the watcher, served to hyper before the socket
    buffered: BytesMut,
    read_closed: bool,
}

/// Stream handed to hyper in place of the raw connection
pub struct TakeoverIo {
    shared: Arc<Mutex<Shared>>,
    peer_gone: CancellationToken,
}

/// Per-connection handle allowing one request to seize the socket
#[derive(Clone)]
pub struct Takeover {
    shared: Arc<Mutex<Shared>>,
    peer_gone: CancellationToken,
}

/// Exclusive writer over a connection that has been taken over
pub struct TakenConn {
    shared: Arc<Mutex<Shared>>,
}

/// Wrap an accepted connection so that it can later be taken over
pub fn takeover_io<S>(stream: S) -> (TakeoverIo, Takeover)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let shared = Arc::new(Mutex::new(Shared {
        io: Box::new(stream),
        taken: false,
        buffered: BytesMut::new(),
        read_closed: false,
    }));
    let peer_gone = CancellationToken::new();

    (
        TakeoverIo {
            shared: shared.clone(),
            peer_gone: peer_gone.clone(),
        },
        Takeover { shared, peer_gone },
    )
}

impl Takeover {
    /// Cancelled once the peer's side of the connection is seen closing
    pub fn peer_gone(&self) -> &CancellationToken {
        &self.peer_gone
    }

    /// Watch the connection while hyper is not reading from it
    ///
    /// Resolves once the peer is gone, after cancelling [`Self::peer_gone`].
    /// Data arriving meanwhile is kept for hyper, and a clean EOF is treated
    /// as a half-close, so on a healthy connection this never resolves.
    pub async fn watch_peer(&self) {
        poll_fn(|cx| {
            let mut shared = self.shared.lock();
            loop {
                if self.peer_gone.is_cancelled() {
                    return Poll::Ready(());
                }
                if shared.taken || shared.read_closed {
                    return Poll::Pending;
                }

                let mut chunk = [0u8; WATCH_CHUNK];
                let mut buf = ReadBuf::new(&mut chunk);
                match Pin::new(&mut shared.io).poll_read(cx, &mut buf) {
                    Poll::Ready(Ok(())) if buf.filled().is_empty() => {
                        shared.read_closed = true;
                    }
                    Poll::Ready(Ok(())) => {
                        shared.buffered.extend_from_slice(buf.filled());
                    }
                    Poll::Ready(Err(e)) => {
                        tracing::debug!("Peer connection failed: {}", e);
                        self.peer_gone.cancel();
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
        })
        .await
    }

    /// Seize the connection. Only the first caller succeeds.
    pub fn take(&self) -> Result<TakenConn, RelayError> {
        let mut shared = self.shared.lock();
        if shared.taken {
            return Err(RelayError::AlreadyTaken);
        }
        shared.taken = true;
        Ok(TakenConn {
            shared: self.shared.clone(),
        })
    }
}

/// Write `payload` verbatim onto the caller's connection, then close it
///
/// Fails with [`RelayError::AlreadyTaken`] before touching the socket if the
/// connection cannot be seized.
pub async fn relay(takeover: &Takeover, payload: &[u8]) -> Result<(), RelayError> {
    let mut conn = takeover.take()?;
    conn.write_all(payload).await?;
    conn.flush().await?;
    conn.shutdown().await?;
    Ok(())
}

impl AsyncRead for TakeoverIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut shared = self.shared.lock();
        if shared.taken {
            return Poll::Ready(Ok(()));
        }

        if shared.buffered.has_remaining() {
            let n = shared.buffered.len().min(buf.remaining());
            buf.put_slice(&shared.buffered[..n]);
            shared.buffered.advance(n);
            return Poll::Ready(Ok(()));
        }
        if shared.read_closed {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        let result = Pin::new(&mut shared.io).poll_read(cx, buf);
        match &result {
            Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                shared.read_closed = true;
            }
            Poll::Ready(Err(_)) => self.peer_gone.cancel(),
            _ => {}
        }
        result
    }
}

impl AsyncWrite for TakeoverIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut shared = self.shared.lock();
        if shared.taken {
            return Poll::Ready(Ok(buf.len()));
        }
        let result = Pin::new(&mut shared.io).poll_write(cx, buf);
        if let Poll::Ready(Err(_)) = &result {
            self.peer_gone.cancel();
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut shared = self.shared.lock();
        if shared.taken {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut shared.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut shared = self.shared.lock();
        if shared.taken {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut shared.io).poll_shutdown(cx)
    }
}

impl AsyncWrite for TakenConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.shared.lock().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.shared.lock().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.shared.lock().io).poll_shutdown(cx)
    }
}
