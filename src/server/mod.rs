//! # Server
//!
//! Accepts sessions, registers each connection in the [`ShardRegistry`] under
//! [`UNASSIGNED_SHARD`], and fans lifecycle and packet events out through a
//! [`Dispatcher`].
//!
//! Connections that go inactive stay registered. Removal is a deliberate
//! caller action through [`Server::remove_connection`], so inactive
//! connections remain inspectable until then.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use mesh_protocol::server::Server;
//! use mesh_protocol::transport::PlainAcceptor;
//! use mesh_protocol::{PacketCodec, PacketRegistry, Ping};
//!
//! # async fn run() -> mesh_protocol::Result<()> {
//! let registry = PacketRegistry::builder().register::<Ping>()?.build();
//! let server = Server::builder()
//!     .codec(Arc::new(PacketCodec::new(registry)))
//!     .context_factory(|| ())
//!     .build()?;
//! let addr = server.start(Arc::new(PlainAcceptor)).await?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

pub mod shard;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{MeshConfig, ServerConfig};
use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::core::registry::PacketRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{Connection, ConnectionId, DisconnectReason};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::listener::{ConnectionEvent, Listener};
use crate::protocol::packets::Ping;
use crate::transport::stream::run_session;
use crate::transport::{Acceptor, SessionHandler, Transport};
use crate::utils::metrics::{global_metrics, Timer};
use crate::utils::timeout::with_timeout_error;

use self::shard::{OwnershipRange, ShardId, ShardRegistry, UNASSIGNED_SHARD};

type ContextFactory<C> = Arc<dyn Fn() -> C + Send + Sync>;

/// Builder for [`Server`]
pub struct ServerBuilder<C> {
    codec: Option<Arc<PacketCodec>>,
    context_factory: Option<ContextFactory<C>>,
    config: ServerConfig,
    shards: HashMap<ShardId, Vec<OwnershipRange>>,
}

impl<C: Send + Sync + 'static> Default for ServerBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send + Sync + 'static> ServerBuilder<C> {
    pub fn new() -> Self {
        Self {
            codec: None,
            context_factory: None,
            config: ServerConfig::default(),
            shards: HashMap::new(),
        }
    }

    /// Codec, server settings and shard table from a node configuration
    pub fn from_config(config: &MeshConfig, registry: Arc<PacketRegistry>) -> Self {
        Self::new()
            .codec(Arc::new(PacketCodec::from_config(registry, &config.codec)))
            .config(config.server.clone())
            .shards(config.shard_map())
    }

    pub fn codec(mut self, codec: Arc<PacketCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Produces the application context for each new connection
    pub fn context_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.context_factory = Some(Arc::new(factory));
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Static ownership table for the shard registry
    pub fn shards(mut self, shards: HashMap<ShardId, Vec<OwnershipRange>>) -> Self {
        self.shards = shards;
        self
    }

    /// Validate and build. Misconfiguration is fatal here rather than at the
    /// first connection.
    pub fn build(self) -> Result<Arc<Server<C>>> {
        let codec = self
            .codec
            .ok_or_else(|| ProtocolError::ConfigError("Server requires a packet codec".into()))?;
        let context_factory = self.context_factory.ok_or_else(|| {
            ProtocolError::ConfigError("Server requires a connection context factory".into())
        })?;

        let errors = self.config.validate();
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }

        let registry = ShardRegistry::new();
        registry.configure_shards(self.shards)?;

        Ok(Arc::new(Server {
            config: self.config,
            codec,
            registry,
            dispatcher: Dispatcher::new(),
            context_factory,
            next_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            accept_task: Mutex::new(None),
            local_addr: OnceLock::new(),
        }))
    }
}

/// Accepting side of the protocol
pub struct Server<C> {
    config: ServerConfig,
    codec: Arc<PacketCodec>,
    registry: ShardRegistry<C>,
    dispatcher: Dispatcher<C>,
    context_factory: ContextFactory<C>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<Result<()>>>>,
    local_addr: OnceLock<SocketAddr>,
}

impl<C: Send + Sync + 'static> Server<C> {
    pub fn builder() -> ServerBuilder<C> {
        ServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn codec(&self) -> &Arc<PacketCodec> {
        &self.codec
    }

    pub fn registry(&self) -> &ShardRegistry<C> {
        &self.registry
    }

    /// Bound address once [`Server::start`] has run
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Subscribe a listener on its own worker thread
    pub fn add_listener<L: Listener<C>>(&self, name: &str, listener: L) -> Result<()> {
        self.dispatcher.add(name, listener)
    }

    pub fn add_shared_listener(&self, name: &str, listener: Arc<dyn Listener<C>>) -> Result<()> {
        self.dispatcher.add_shared(name, listener)
    }

    pub fn remove_listener(&self, name: &str) -> Result<bool> {
        self.dispatcher.remove(name)
    }

    /// Bind the configured address and accept in the background.
    ///
    /// Port 0 binds an ephemeral port; the chosen address is returned.
    #[instrument(skip(self, acceptor), fields(server = %self.config.server_id))]
    pub async fn start(self: &Arc<Self>, acceptor: Arc<dyn Acceptor>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);

        let handle = tokio::spawn(self.clone().serve(listener, acceptor));
        let previous = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(addr)
    }

    /// Accept until shutdown, completing each handshake through `acceptor`
    /// and driving every session on its own task
    #[instrument(skip_all, fields(server = %self.config.server_id))]
    pub async fn serve(self: Arc<Self>, listener: TcpListener, acceptor: Arc<dyn Acceptor>) -> Result<()> {
        info!(address = ?listener.local_addr().ok(), "Server listening");
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        trace!(%peer, "Socket accepted");
                        let server = self.clone();
                        let handshake = acceptor.accept(stream);
                        sessions.spawn(async move {
                            let read_timeout = server.config.read_timeout;
                            let io = match with_timeout_error(handshake, read_timeout).await {
                                Ok(io) => io,
                                Err(e) => {
                                    warn!(%peer, error = %e, "Handshake failed");
                                    return;
                                }
                            };
                            if let Err(e) = run_session(io, server, read_timeout).await {
                                warn!(%peer, error = %e, "Session rejected");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }

        // Sessions end as their connections close; the caller bounds this wait
        while sessions.join_next().await.is_some() {}
        info!("Accept loop stopped");
        Ok(())
    }

    /// Close every connection, stop accepting and stop listener workers.
    ///
    /// Waits up to `timeout` for sessions to wind down, then aborts them.
    #[instrument(skip(self), fields(server = %self.config.server_id))]
    pub async fn shutdown(&self, timeout: Duration) {
        let _timer = Timer::start("server_shutdown");
        self.shutdown.cancel();
        for conn in self.registry.connections() {
            conn.close();
        }

        let handle = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!(timeout_ms = timeout.as_millis() as u64, "Sessions did not stop in time; aborting");
                handle.abort();
            }
        }

        self.dispatcher.shutdown();
        info!("Server shut down");
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection<C>>> {
        self.registry.connection(id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Move a connection between shards
    pub fn move_connection_to_shard(&self, id: ConnectionId, shard: ShardId) -> Result<()> {
        self.registry.move_connection_to_shard(id, shard)
    }

    /// Move a connection to the shard owning `key`
    pub fn assign_to_owner(&self, id: ConnectionId, key: u64) -> Result<ShardId> {
        let shard = self.registry.owner_shard_of(key);
        self.registry.move_connection_to_shard(id, shard)?;
        Ok(shard)
    }

    /// Unregister a connection and close it
    pub fn remove_connection(&self, id: ConnectionId) -> Option<Arc<Connection<C>>> {
        let conn = self.registry.remove_connection(id)?;
        conn.close();
        debug!(connection = id, "Connection removed");
        Some(conn)
    }

    /// See [`ShardRegistry::broadcast`]
    pub fn broadcast(
        &self,
        packet: &dyn Packet,
        shard: Option<ShardId>,
        predicate: Option<&dyn Fn(&Connection<C>) -> bool>,
    ) -> usize {
        self.registry.broadcast(packet, shard, predicate)
    }

    /// Send to every active connection in every shard
    pub fn broadcast_all(&self, packet: &dyn Packet) -> usize {
        self.registry.broadcast(packet, None, None)
    }

    fn dispatch(&self, event: ConnectionEvent<C>) {
        if let Err(e) = self.dispatcher.dispatch(event) {
            warn!(error = %e, "Event dispatch failed");
        }
    }
}

impl<C: Send + Sync + 'static> SessionHandler<C> for Server<C> {
    fn on_ready(&self, transport: Arc<dyn Transport>) -> Result<Arc<Connection<C>>> {
        if self.shutdown.is_cancelled() {
            transport.close();
            return Err(ProtocolError::ConnectionClosed);
        }

        let conn = Arc::new(Connection::new(
            (self.context_factory)(),
            self.codec.clone(),
            transport,
        ));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        conn.assign_id(id)?;
        self.registry
            .add_connection(id, conn.clone(), UNASSIGNED_SHARD)?;

        global_metrics().connection_established();
        debug!(connection = id, "Connection active");
        self.dispatch(ConnectionEvent::Active(conn.clone()));
        Ok(conn)
    }

    fn on_frame(&self, conn: &Arc<Connection<C>>, frame: &[u8]) {
        if conn.is_inactive() {
            return;
        }
        let Some(packet) = conn.receive(frame) else {
            return;
        };

        if packet.is::<Ping>() {
            if let Err(e) = conn.send(&*packet) {
                debug!(connection = ?conn.id(), error = %e, "Ping echo failed");
            }
        }

        self.dispatch(ConnectionEvent::Packet(conn.clone(), Arc::from(packet)));
    }

    fn on_closed(&self, conn: &Arc<Connection<C>>, reason: DisconnectReason) {
        if !conn.mark_inactive(reason) {
            return;
        }
        global_metrics().connection_closed();

        if reason.is_error() {
            debug!(connection = ?conn.id(), %reason, "Connection error");
            self.dispatch(ConnectionEvent::Error(conn.clone()));
        } else {
            debug!(connection = ?conn.id(), "Connection inactive");
            self.dispatch(ConnectionEvent::Inactive(conn.clone()));
        }
    }

    fn on_write_error(&self, conn: &Arc<Connection<C>>, error: &ProtocolError) {
        warn!(connection = ?conn.id(), error = %error, "Write failed; resetting connection");
        self.on_closed(conn, DisconnectReason::Reset);
        conn.close();
    }
}

impl<C> std::fmt::Debug for Server<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("server_id", &self.config.server_id)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, OutboundQueue};
    use std::sync::mpsc;

    fn server() -> Arc<Server<String>> {
        let registry = PacketRegistry::builder().register::<Ping>().unwrap().build();
        let mut shards = HashMap::new();
        shards.insert(0, vec![OwnershipRange::new(0, 99)]);
        Server::builder()
            .codec(Arc::new(PacketCodec::new(registry)))
            .context_factory(|| String::from("player"))
            .shards(shards)
            .build()
            .unwrap()
    }

    fn accept(server: &Arc<Server<String>>) -> (Arc<Connection<String>>, OutboundQueue) {
        let (transport, outbound) = ChannelTransport::new();
        (server.on_ready(transport).unwrap(), outbound)
    }

    struct Events(mpsc::Sender<&'static str>);

    impl Listener<String> for Events {
        fn on_active(&self, _conn: &Arc<Connection<String>>) -> Result<()> {
            self.0.send("active").unwrap();
            Ok(())
        }

        fn on_packet(&self, _conn: &Arc<Connection<String>>, packet: &Arc<dyn Packet>) -> Result<()> {
            self.0.send(packet.kind_name()).unwrap();
            Ok(())
        }

        fn on_inactive(&self, _conn: &Arc<Connection<String>>) -> Result<()> {
            self.0.send("inactive").unwrap();
            Ok(())
        }

        fn on_error(&self, _conn: &Arc<Connection<String>>) -> Result<()> {
            self.0.send("error").unwrap();
            Ok(())
        }
    }

    fn next(rx: &mpsc::Receiver<&'static str>) -> &'static str {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_builder_requires_codec_and_factory() {
        assert!(matches!(
            Server::<()>::builder().context_factory(|| ()).build(),
            Err(ProtocolError::ConfigError(_))
        ));
        let registry = PacketRegistry::builder().build();
        assert!(matches!(
            Server::<()>::builder()
                .codec(Arc::new(PacketCodec::new(registry)))
                .build(),
            Err(ProtocolError::ConfigError(_))
        ));
    }

    #[test]
    fn test_new_connection_is_unassigned_with_fresh_id() {
        let server = server();
        let (a, _qa) = accept(&server);
        let (b, _qb) = accept(&server);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.context(), "player");
        assert_eq!(server.registry().shard_of(a.id().unwrap()), Some(UNASSIGNED_SHARD));

        assert_eq!(server.assign_to_owner(a.id().unwrap(), 42).unwrap(), 0);
        assert_eq!(server.registry().shard_of(a.id().unwrap()), Some(0));
    }

    #[test]
    fn test_ping_is_echoed_and_dispatched() {
        let server = server();
        let (tx, rx) = mpsc::channel();
        server.add_listener("events", Events(tx)).unwrap();
        let (conn, mut outbound) = accept(&server);
        assert_eq!(next(&rx), "active");

        let frame = conn.codec().encode(&Ping::with_timestamp(9)).unwrap();
        server.on_frame(&conn, &frame);

        assert_eq!(outbound.try_recv().unwrap(), frame);
        assert_eq!(next(&rx), "Ping");
    }

    #[test]
    fn test_close_fires_once_and_keeps_registration() {
        let server = server();
        let (tx, rx) = mpsc::channel();
        server.add_listener("events", Events(tx)).unwrap();
        let (conn, _outbound) = accept(&server);
        assert_eq!(next(&rx), "active");

        server.on_closed(&conn, DisconnectReason::ReadTimeout);
        server.on_closed(&conn, DisconnectReason::Closed);
        assert_eq!(next(&rx), "error");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        assert!(conn.is_inactive());
        assert_eq!(server.connection_count(), 1);
        assert!(server.remove_connection(conn.id().unwrap()).is_some());
        assert_eq!(server.connection_count(), 0);
    }
}
