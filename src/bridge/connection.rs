//! One reconnecting link to a mesh peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bridge::{BridgeSettings, ContextFactory, Observers};
use crate::client::{Client, ClientOptions};
use crate::config::RemoteServerConfig;
use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::Result;
use crate::protocol::connection::Connection;
use crate::protocol::listener::{guarded, Listener};
use crate::transport::Dialer;
use crate::utils::metrics::global_metrics;

/// Link lifecycle. A failed or dropped link returns to `Disconnected` with
/// one retry pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
}

struct LinkState<C> {
    state: BridgeState,
    client: Option<Arc<Client<C>>>,
    retry: Option<JoinHandle<()>>,
    shut_down: bool,
    /// Bumped per dial so events from a replaced client are ignored
    generation: u64,
}

/// Reconnecting link from this node to one peer.
///
/// Each dial uses a fresh [`Client`]; the link subscribes to it and only
/// reports `Connected` once the client's session is active.
pub struct BridgeConnection<C> {
    local_id: String,
    peer_id: String,
    remote: RemoteServerConfig,
    codec: Arc<PacketCodec>,
    dialer: Arc<dyn Dialer>,
    context_factory: ContextFactory<C>,
    observers: Observers,
    settings: BridgeSettings,
    link: Mutex<LinkState<C>>,
    attempts: AtomicU64,
    runtime: Handle,
    this: Weak<Self>,
}

impl<C: Send + Sync + 'static> BridgeConnection<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local_id: String,
        peer_id: String,
        remote: RemoteServerConfig,
        codec: Arc<PacketCodec>,
        dialer: Arc<dyn Dialer>,
        context_factory: ContextFactory<C>,
        observers: Observers,
        settings: BridgeSettings,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            local_id,
            peer_id,
            remote,
            codec,
            dialer,
            context_factory,
            observers,
            settings,
            link: Mutex::new(LinkState {
                state: BridgeState::Disconnected,
                client: None,
                retry: None,
                shut_down: false,
                generation: 0,
            }),
            attempts: AtomicU64::new(0),
            runtime,
            this: this.clone(),
        })
    }

    fn link(&self) -> MutexGuard<'_, LinkState<C>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn remote(&self) -> &RemoteServerConfig {
        &self.remote
    }

    pub fn state(&self) -> BridgeState {
        self.link().state
    }

    /// Connected and the underlying session still live
    pub fn is_connected(&self) -> bool {
        let link = self.link();
        link.state == BridgeState::Connected
            && link.client.as_ref().is_some_and(|c| c.is_connected())
    }

    pub fn has_pending_retry(&self) -> bool {
        self.link()
            .retry
            .as_ref()
            .is_some_and(|retry| !retry.is_finished())
    }

    /// Dials started so far
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Start a dial. No-op while connecting or connected, or after shutdown.
    pub fn connect(&self) {
        let (client, generation) = {
            let mut link = self.link();
            if link.shut_down || link.state != BridgeState::Disconnected || link.client.is_some() {
                return;
            }
            link.generation += 1;

            let options = ClientOptions::new(self.remote.host.clone(), self.remote.port)
                .with_read_timeout(self.settings.read_timeout)
                .with_label(format!("{} -> {}", self.local_id, self.peer_id));
            let client = Client::new(
                options,
                self.codec.clone(),
                self.dialer.clone(),
                (self.context_factory)(),
            );
            let subscriber = LinkListener {
                bridge: self.this.clone(),
                generation: link.generation,
            };
            if let Err(e) = client.add_listener(&format!("bridge-{}", self.peer_id), subscriber) {
                warn!(peer = %self.peer_id, error = %e, "Failed to subscribe to bridge client");
                return;
            }

            link.client = Some(client.clone());
            link.state = BridgeState::Connecting;
            (client, link.generation)
        };

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            peer = %self.peer_id,
            host = %self.remote.host,
            port = self.remote.port,
            attempt,
            "Bridge connecting"
        );

        let bridge = self.this.clone();
        self.runtime.spawn(async move {
            let result = client.connect().await;
            if let Some(bridge) = bridge.upgrade() {
                bridge.on_connect_result(generation, result);
            }
        });
    }

    fn on_connect_result(&self, generation: u64, result: Result<()>) {
        let Err(e) = result else {
            // Connected is set by the client's active event
            trace!(peer = %self.peer_id, "Bridge dial completed");
            return;
        };

        let client = {
            let mut link = self.link();
            if link.generation != generation || link.shut_down {
                return;
            }
            link.state = BridgeState::Disconnected;
            link.client.take()
        };
        debug!(peer = %self.peer_id, error = %e, "Bridge connect failed");
        self.close_in_background(client);
        self.schedule_reconnect();
    }

    fn on_link_active(&self, generation: u64) {
        {
            let mut link = self.link();
            if link.generation != generation || link.shut_down {
                return;
            }
            link.state = BridgeState::Connected;
        }
        global_metrics().bridge_connected();
        info!(local = %self.local_id, peer = %self.peer_id, "Bridge link up");
        self.notify("on_peer_connected", |observer| {
            observer.on_peer_connected(&self.peer_id)
        });
    }

    fn on_link_lost(&self, generation: u64) {
        let (client, was_connected) = {
            let mut link = self.link();
            if link.generation != generation || link.shut_down {
                return;
            }
            let was_connected = link.state == BridgeState::Connected;
            link.state = BridgeState::Disconnected;
            (link.client.take(), was_connected)
        };
        info!(local = %self.local_id, peer = %self.peer_id, "Bridge link down");
        self.close_in_background(client);
        if was_connected {
            self.notify("on_peer_disconnected", |observer| {
                observer.on_peer_disconnected(&self.peer_id)
            });
        }
        self.schedule_reconnect();
    }

    fn on_link_packet(&self, generation: u64, packet: &Arc<dyn Packet>) {
        if self.link().generation != generation {
            return;
        }
        trace!(local = %self.local_id, peer = %self.peer_id, packet = packet.kind_name(), "Bridge packet received");
        self.notify("on_packet_received", |observer| {
            observer.on_packet_received(&self.peer_id, packet)
        });
    }

    fn close_in_background(&self, client: Option<Arc<Client<C>>>) {
        if let Some(client) = client {
            let timeout = self.settings.close_timeout;
            self.runtime.spawn(async move { client.close(timeout).await });
        }
    }

    fn notify<F>(&self, operation: &str, callback: F)
    where
        F: Fn(&dyn super::BridgeListener) -> Result<()>,
    {
        let observers = match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for (name, observer) in observers {
            guarded(&name, operation, || callback(&*observer));
        }
    }

    /// Arm a single delayed redial. Never stacks: a pending retry absorbs
    /// further requests.
    pub fn schedule_reconnect(&self) {
        let mut link = self.link();
        if link.shut_down || link.retry.as_ref().is_some_and(|r| !r.is_finished()) {
            return;
        }

        let bridge = self.this.clone();
        let delay = self.settings.reconnect_delay;
        debug!(peer = %self.peer_id, delay_ms = delay.as_millis() as u64, "Bridge reconnect scheduled");
        link.retry = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(bridge) = bridge.upgrade() {
                bridge.retry_now();
            }
        }));
    }

    fn retry_now(&self) {
        let stale = {
            let mut link = self.link();
            link.retry = None;
            if link.shut_down || link.state != BridgeState::Disconnected {
                return;
            }
            link.client.take()
        };
        self.close_in_background(stale);
        global_metrics().bridge_reconnect();
        debug!(peer = %self.peer_id, "Bridge reconnecting");
        self.connect();
    }

    /// Send to the peer. Returns `false`, with a warning, when the link is not
    /// connected or the send fails.
    pub fn send(&self, packet: &dyn Packet) -> bool {
        let client = {
            let link = self.link();
            match link.state {
                BridgeState::Connected => link.client.clone(),
                _ => None,
            }
        };

        let Some(client) = client else {
            global_metrics().bridge_dropped_send();
            warn!(peer = %self.peer_id, packet = packet.kind_name(), "Bridge not connected; dropping packet");
            return false;
        };

        match client.send(packet) {
            Ok(()) => true,
            Err(e) => {
                global_metrics().bridge_dropped_send();
                warn!(peer = %self.peer_id, packet = packet.kind_name(), error = %e, "Bridge send failed");
                false
            }
        }
    }

    /// Stop for good: cancel any pending retry, close the link within the
    /// configured bound and mark it disconnected
    pub async fn shutdown(&self) {
        let (retry, client) = {
            let mut link = self.link();
            link.shut_down = true;
            (link.retry.take(), link.client.take())
        };
        if let Some(retry) = retry {
            retry.abort();
        }
        if let Some(client) = client {
            client.close(self.settings.close_timeout).await;
        }
        self.link().state = BridgeState::Disconnected;
        debug!(local = %self.local_id, peer = %self.peer_id, "Bridge shut down");
    }
}

impl<C> std::fmt::Debug for BridgeConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConnection")
            .field("peer", &self.peer_id)
            .field("host", &self.remote.host)
            .field("port", &self.remote.port)
            .finish_non_exhaustive()
    }
}

/// Subscribes a bridge to one of its clients without keeping it alive
struct LinkListener<C> {
    bridge: Weak<BridgeConnection<C>>,
    generation: u64,
}

impl<C: Send + Sync + 'static> Listener<C> for LinkListener<C> {
    fn on_active(&self, _conn: &Arc<Connection<C>>) -> Result<()> {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.on_link_active(self.generation);
        }
        Ok(())
    }

    fn on_packet(&self, _conn: &Arc<Connection<C>>, packet: &Arc<dyn Packet>) -> Result<()> {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.on_link_packet(self.generation, packet);
        }
        Ok(())
    }

    fn on_inactive(&self, _conn: &Arc<Connection<C>>) -> Result<()> {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.on_link_lost(self.generation);
        }
        Ok(())
    }

    fn on_error(&self, conn: &Arc<Connection<C>>) -> Result<()> {
        self.on_inactive(conn)
    }
}
