//! # Transport Layer
//!
//! The seam between connections and the async socket runtime.
//!
//! A [`Connection`] never touches a socket. It hands encoded frames to a
//! [`Transport`], which queues them for an asynchronous writer. The session
//! driver in [`stream`] owns the socket: it feeds inbound frames to a
//! [`SessionHandler`] and reports how the session ended.
//!
//! Dialing and accepting are abstracted behind [`Dialer`] and [`Acceptor`] so
//! the same server, client and bridge code runs over TLS in production and
//! over plain TCP or in-memory pipes in tests.
//!
//! ## Components
//! - **ChannelTransport**: unbounded write queue plus a close signal
//! - **Stream driver**: reader/writer loops over any `AsyncRead + AsyncWrite`
//! - **TLS**: rustls acceptor and dialer

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::constants::ERR_TRANSPORT_CLOSED;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{Connection, DisconnectReason};

pub mod stream;
pub mod tls;

/// Sink for encoded frames
pub trait Transport: Send + Sync + 'static {
    /// Queue a complete frame for asynchronous write
    fn submit(&self, frame: Bytes) -> Result<()>;

    /// Stop accepting frames and ask the driver to end the session
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Transport backed by an unbounded channel drained by the session driver
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
}

/// Driver-side half of a [`ChannelTransport`]
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        (
            Arc::new(Self {
                tx,
                closed: closed.clone(),
            }),
            OutboundQueue { rx, closed },
        )
    }
}

impl Transport for ChannelTransport {
    fn submit(&self, frame: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .map_err(|_| ProtocolError::TransportError(ERR_TRANSPORT_CLOSED.to_string()))
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("open", &self.is_open())
            .finish()
    }
}

impl OutboundQueue {
    /// Next queued frame without waiting
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Token cancelled when the transport is closed
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) fn into_parts(self) -> (mpsc::UnboundedReceiver<Bytes>, CancellationToken) {
        (self.rx, self.closed)
    }
}

/// Receives the lifecycle of one driven session
pub trait SessionHandler<C>: Send + Sync + 'static {
    /// The session is usable. Build and register the connection.
    fn on_ready(&self, transport: Arc<dyn Transport>) -> Result<Arc<Connection<C>>>;

    /// One complete inbound frame
    fn on_frame(&self, conn: &Arc<Connection<C>>, frame: &[u8]);

    /// The session ended. Called once per driven session.
    fn on_closed(&self, conn: &Arc<Connection<C>>, reason: DisconnectReason);

    /// An asynchronous write failed
    fn on_write_error(&self, conn: &Arc<Connection<C>>, error: &ProtocolError);
}

/// Bidirectional byte stream usable by the session driver
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// Type-erased session stream
pub type BoxedIo = Box<dyn AsyncIo>;

/// Opens outbound sessions
pub trait Dialer: Send + Sync + 'static {
    /// Connect and complete any handshake; the returned stream is ready for
    /// frames
    fn dial(&self, host: &str, port: u16) -> BoxFuture<'static, Result<BoxedIo>>;
}

/// Completes the handshake on accepted sockets
pub trait Acceptor: Send + Sync + 'static {
    fn accept(&self, stream: TcpStream) -> BoxFuture<'static, Result<BoxedIo>>;
}

/// Unencrypted TCP dialer for local development and tests
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, host: &str, port: u16) -> BoxFuture<'static, Result<BoxedIo>> {
        let address = format!("{host}:{port}");
        Box::pin(async move {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedIo)
        })
    }
}

/// Pass-through acceptor for unencrypted TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainAcceptor;

impl Acceptor for PlainAcceptor {
    fn accept(&self, stream: TcpStream) -> BoxFuture<'static, Result<BoxedIo>> {
        Box::pin(async move {
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedIo)
        })
    }
}
