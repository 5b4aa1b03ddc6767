//! # Bridge Mesh
//!
//! Server-to-server links. A [`ServerBridge`] keeps one
//! [`BridgeConnection`] per configured peer; each link redials on failure
//! after a fixed delay, with at most one retry pending per peer.
//!
//! Sends over a link that is not connected are dropped with a warning. There
//! is no queuing across an outage.
//!
//! Peers may own a range of ownership keys; [`ServerBridge::find_peer_for`]
//! routes a key to its owner. Ranges are validated as disjoint when the bridge
//! is built.
//!
//! ## Example
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use mesh_protocol::bridge::ServerBridge;
//! use mesh_protocol::config::RemoteServerConfig;
//! use mesh_protocol::transport::TcpDialer;
//! use mesh_protocol::{PacketCodec, PacketRegistry, Ping};
//!
//! # async fn run() -> mesh_protocol::Result<()> {
//! let mut peers = BTreeMap::new();
//! peers.insert(
//!     "game-1".to_string(),
//!     RemoteServerConfig::new("10.0.0.12", 7100).with_key_range(0..=9999),
//! );
//!
//! let registry = PacketRegistry::builder().register::<Ping>()?.build();
//! let bridge = ServerBridge::new(
//!     "lobby-1",
//!     peers,
//!     Arc::new(PacketCodec::new(registry)),
//!     Arc::new(TcpDialer),
//!     || (),
//! )?;
//! bridge.connect_all();
//! assert_eq!(bridge.find_peer_for(42), Some("game-1"));
//! # Ok(())
//! # }
//! ```

mod connection;

pub use self::connection::{BridgeConnection, BridgeState};

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use crate::config::{validate_peers, MeshConfig, RemoteServerConfig};
use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::constants::ERR_BRIDGE_LOCK;
use crate::error::{ProtocolError, Result};
use crate::transport::Dialer;
use crate::utils::metrics::Timer;
use crate::utils::timeout::{DEFAULT_TIMEOUT, RECONNECT_DELAY, SHUTDOWN_TIMEOUT};

/// Mesh-wide observer of peer links.
///
/// Callbacks run on the link's listener thread. Errors and panics are logged
/// and never affect link state.
pub trait BridgeListener: Send + Sync + 'static {
    fn on_peer_connected(&self, peer_id: &str) -> Result<()>;

    fn on_peer_disconnected(&self, peer_id: &str) -> Result<()>;

    fn on_packet_received(&self, peer_id: &str, packet: &Arc<dyn Packet>) -> Result<()>;
}

pub(crate) type ContextFactory<C> = Arc<dyn Fn() -> C + Send + Sync>;

pub(crate) type Observers = Arc<RwLock<Vec<(Arc<str>, Arc<dyn BridgeListener>)>>>;

/// Timing for every link of a bridge
#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub read_timeout: Duration,
    pub reconnect_delay: Duration,
    pub close_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_TIMEOUT,
            reconnect_delay: RECONNECT_DELAY,
            close_timeout: SHUTDOWN_TIMEOUT,
        }
    }
}

/// All of this node's links into the mesh
pub struct ServerBridge<C> {
    local_id: String,
    peers: BTreeMap<String, RemoteServerConfig>,
    codec: Arc<PacketCodec>,
    dialer: Arc<dyn Dialer>,
    context_factory: ContextFactory<C>,
    settings: BridgeSettings,
    links: DashMap<String, Arc<BridgeConnection<C>>>,
    observers: Observers,
    runtime: Handle,
}

impl<C: Send + Sync + 'static> ServerBridge<C> {
    /// Validate the peer table and capture the current tokio runtime, which
    /// runs dials and retries.
    pub fn new<S, F>(
        local_id: S,
        peers: BTreeMap<String, RemoteServerConfig>,
        codec: Arc<PacketCodec>,
        dialer: Arc<dyn Dialer>,
        context_factory: F,
    ) -> Result<Self>
    where
        S: Into<String>,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let local_id = local_id.into();
        let errors = validate_peers(&local_id, &peers);
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }
        let runtime = Handle::try_current().map_err(|e| {
            ProtocolError::ConfigError(format!("Server bridge requires a tokio runtime: {e}"))
        })?;

        Ok(Self {
            local_id,
            peers,
            codec,
            dialer,
            context_factory: Arc::new(context_factory),
            settings: BridgeSettings::default(),
            links: DashMap::new(),
            observers: Arc::new(RwLock::new(Vec::new())),
            runtime,
        })
    }

    /// Peers and timing from a node configuration
    pub fn from_config<F>(
        config: &MeshConfig,
        codec: Arc<PacketCodec>,
        dialer: Arc<dyn Dialer>,
        context_factory: F,
    ) -> Result<Self>
    where
        F: Fn() -> C + Send + Sync + 'static,
    {
        let bridge = Self::new(
            config.server.server_id.clone(),
            config.bridge.peers.clone(),
            codec,
            dialer,
            context_factory,
        )?;
        Ok(bridge.with_settings(BridgeSettings {
            read_timeout: config.server.read_timeout,
            reconnect_delay: config.bridge.reconnect_delay,
            close_timeout: config.bridge.close_timeout,
        }))
    }

    /// Applies to links created afterwards
    pub fn with_settings(mut self, settings: BridgeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn peers(&self) -> &BTreeMap<String, RemoteServerConfig> {
        &self.peers
    }

    /// Open a link to every configured peer
    pub fn connect_all(&self) {
        for peer_id in self.peers.keys() {
            if let Err(e) = self.connect(peer_id) {
                debug!(peer = %peer_id, error = %e, "Peer link not started");
            }
        }
    }

    /// Open a link to one peer. A peer that already has a link is left alone.
    pub fn connect(&self, peer_id: &str) -> Result<()> {
        let remote = self
            .peers
            .get(peer_id)
            .ok_or_else(|| ProtocolError::ConfigError(format!("Unknown peer '{peer_id}'")))?;

        let link = match self.links.entry(peer_id.to_string()) {
            Entry::Occupied(_) => {
                debug!(peer = peer_id, "Bridge link already exists");
                return Ok(());
            }
            Entry::Vacant(slot) => {
                let link = BridgeConnection::new(
                    self.local_id.clone(),
                    peer_id.to_string(),
                    remote.clone(),
                    self.codec.clone(),
                    self.dialer.clone(),
                    self.context_factory.clone(),
                    self.observers.clone(),
                    self.settings,
                    self.runtime.clone(),
                );
                slot.insert(link.clone());
                link
            }
        };
        link.connect();
        Ok(())
    }

    /// Shut one link down for good. Returns whether it existed.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, peer_id: &str) -> bool {
        match self.links.remove(peer_id) {
            Some((_, link)) => {
                link.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Shut every link down concurrently
    #[instrument(skip(self), fields(local = %self.local_id))]
    pub async fn disconnect_all(&self) {
        let _timer = Timer::start("bridge_disconnect_all");
        let peer_ids: Vec<String> = self.links.iter().map(|e| e.key().clone()).collect();
        let links: Vec<_> = peer_ids
            .iter()
            .filter_map(|id| self.links.remove(id).map(|(_, link)| link))
            .collect();
        futures::future::join_all(links.iter().map(|link| link.shutdown())).await;
    }

    pub fn connection(&self, peer_id: &str) -> Option<Arc<BridgeConnection<C>>> {
        self.links.get(peer_id).map(|e| e.value().clone())
    }

    /// Send to one peer. Returns `false` when there is no connected link.
    pub fn send_to_server(&self, peer_id: &str, packet: &dyn Packet) -> bool {
        match self.connection(peer_id) {
            Some(link) => link.send(packet),
            None => {
                debug!(peer = peer_id, packet = packet.kind_name(), "No bridge link to peer");
                false
            }
        }
    }

    /// Send to every linked peer; returns how many accepted the packet
    pub fn broadcast(&self, packet: &dyn Packet) -> usize {
        let links: Vec<_> = self.links.iter().map(|e| e.value().clone()).collect();
        links.iter().filter(|link| link.send(packet)).count()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.connection(peer_id).is_some_and(|link| link.is_connected())
    }

    /// Peer whose key range contains `key`
    pub fn find_peer_for(&self, key: u64) -> Option<&str> {
        self.peers
            .iter()
            .find(|(_, remote)| remote.owns_key(key))
            .map(|(id, _)| id.as_str())
    }

    /// Subscribe a mesh observer to every current and future link
    pub fn add_listener(&self, name: &str, listener: Arc<dyn BridgeListener>) -> Result<()> {
        let mut observers = self
            .observers
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_BRIDGE_LOCK.to_string()))?;
        if observers.iter().any(|(n, _)| &**n == name) {
            return Err(ProtocolError::DuplicateListener(name.to_string()));
        }
        observers.push((Arc::from(name), listener));
        Ok(())
    }

    /// Returns whether an observer by that name existed
    pub fn remove_listener(&self, name: &str) -> Result<bool> {
        let mut observers = self
            .observers
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_BRIDGE_LOCK.to_string()))?;
        let before = observers.len();
        observers.retain(|(n, _)| &**n != name);
        Ok(observers.len() != before)
    }

    pub fn connected_count(&self) -> usize {
        self.links.iter().filter(|e| e.value().is_connected()).count()
    }

    pub fn total_count(&self) -> usize {
        self.links.len()
    }
}

impl<C> std::fmt::Debug for ServerBridge<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBridge")
            .field("local_id", &self.local_id)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .field("links", &self.links.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::registry::PacketRegistry;
    use crate::protocol::packets::Ping;
    use crate::transport::BoxedIo;
    use futures::future::BoxFuture;
    use std::io;

    /// Every dial is refused
    struct Unreachable;

    impl Dialer for Unreachable {
        fn dial(&self, _host: &str, _port: u16) -> BoxFuture<'static, Result<BoxedIo>> {
            Box::pin(async {
                Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            })
        }
    }

    fn codec() -> Arc<PacketCodec> {
        let registry = PacketRegistry::builder().register::<Ping>().unwrap().build();
        Arc::new(PacketCodec::new(registry))
    }

    fn peers() -> BTreeMap<String, RemoteServerConfig> {
        let mut peers = BTreeMap::new();
        peers.insert(
            "game-1".to_string(),
            RemoteServerConfig::new("127.0.0.1", 7101).with_key_range(0..=999),
        );
        peers.insert(
            "game-2".to_string(),
            RemoteServerConfig::new("127.0.0.1", 7102).with_key_range(1000..=1999),
        );
        peers
    }

    fn bridge() -> ServerBridge<()> {
        ServerBridge::new("lobby-1", peers(), codec(), Arc::new(Unreachable), || ()).unwrap()
    }

    #[tokio::test]
    async fn test_ownership_routing() {
        let bridge = bridge();
        assert_eq!(bridge.find_peer_for(0), Some("game-1"));
        assert_eq!(bridge.find_peer_for(1500), Some("game-2"));
        assert_eq!(bridge.find_peer_for(2000), None);
    }

    #[tokio::test]
    async fn test_overlapping_peers_rejected() {
        let mut peers = peers();
        peers.insert(
            "game-3".to_string(),
            RemoteServerConfig::new("127.0.0.1", 7103).with_key_range(1999..=2999),
        );
        assert!(matches!(
            ServerBridge::new("lobby-1", peers, codec(), Arc::new(Unreachable), || ()),
            Err(ProtocolError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let bridge = bridge();
        assert!(bridge.connect("nope").is_err());
        assert!(!bridge.send_to_server("nope", &Ping::now()));
        assert_eq!(bridge.total_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dial_schedules_single_retry() {
        let bridge = bridge().with_settings(BridgeSettings {
            reconnect_delay: Duration::from_secs(5),
            ..BridgeSettings::default()
        });
        bridge.connect("game-1").unwrap();
        bridge.connect("game-1").unwrap();
        assert_eq!(bridge.total_count(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let link = bridge.connection("game-1").unwrap();
        assert_eq!(link.connect_attempts(), 1);
        assert_eq!(link.state(), BridgeState::Disconnected);
        assert!(link.has_pending_retry());

        // Further requests fold into the pending retry
        link.schedule_reconnect();
        link.schedule_reconnect();
        assert!(!bridge.send_to_server("game-1", &Ping::now()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(link.connect_attempts(), 2);

        bridge.disconnect_all().await;
        assert!(!link.has_pending_retry());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(link.connect_attempts(), 2);
        assert_eq!(bridge.total_count(), 0);
    }
}
