//! # Client
//!
//! Outbound side of the protocol. A client dials once through a [`Dialer`],
//! drives the session on a background task and delivers events to its own
//! listeners. While connected it sends a keep-alive [`Ping`] at a fraction of
//! the read timeout and records the round trip from the server's echo.
//!
//! A client is single use: after the session ends, build a new one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, instrument, trace, warn};

use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{Connection, DisconnectReason};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::listener::{ConnectionEvent, Listener};
use crate::protocol::packets::Ping;
use crate::transport::stream::drive;
use crate::transport::{ChannelTransport, Dialer, SessionHandler, Transport};
use crate::utils::metrics::global_metrics;
use crate::utils::time::current_timestamp_micros;
use crate::utils::timeout::{keepalive_interval, with_timeout_error, DEFAULT_TIMEOUT};

/// Where and how a client connects
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    /// Also bounds the dial and handshake
    pub read_timeout: Duration,
    /// `None` disables keep-alive pings
    pub keepalive_interval: Option<Duration>,
    /// Name used in logs
    pub label: String,
}

impl ClientOptions {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        let host = host.into();
        Self {
            label: format!("{host}:{port}"),
            host,
            port,
            read_timeout: DEFAULT_TIMEOUT,
            keepalive_interval: Some(keepalive_interval(DEFAULT_TIMEOUT)),
        }
    }

    /// Set the read timeout and derive the keep-alive interval from it
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        if self.keepalive_interval.is_some() {
            self.keepalive_interval = Some(keepalive_interval(read_timeout));
        }
        self
    }

    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval.filter(|d| !d.is_zero());
        self
    }

    pub fn with_label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = label.into();
        self
    }
}

pub struct Client<C> {
    options: ClientOptions,
    codec: Arc<PacketCodec>,
    dialer: Arc<dyn Dialer>,
    context: Mutex<Option<C>>,
    connection: OnceLock<Arc<Connection<C>>>,
    connected: AtomicBool,
    closed: AtomicBool,
    dispatcher: Dispatcher<C>,
    rtt_micros: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Send + Sync + 'static> Client<C> {
    /// `context` becomes the connection's application context on connect
    pub fn new(
        options: ClientOptions,
        codec: Arc<PacketCodec>,
        dialer: Arc<dyn Dialer>,
        context: C,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            codec,
            dialer,
            context: Mutex::new(Some(context)),
            connection: OnceLock::new(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dispatcher: Dispatcher::new(),
            rtt_micros: AtomicU64::new(0),
            driver: Mutex::new(None),
            keepalive: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn add_listener<L: Listener<C>>(&self, name: &str, listener: L) -> Result<()> {
        self.dispatcher.add(name, listener)
    }

    pub fn add_shared_listener(&self, name: &str, listener: Arc<dyn Listener<C>>) -> Result<()> {
        self.dispatcher.add_shared(name, listener)
    }

    pub fn remove_listener(&self, name: &str) -> Result<bool> {
        self.dispatcher.remove(name)
    }

    /// Dial, complete the handshake and start driving the session.
    ///
    /// Returns once the session is usable; listeners see `on_active` on
    /// their own threads.
    #[instrument(skip(self), fields(peer = %self.options.label))]
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::ConnectionClosed);
        }

        let io = with_timeout_error(
            self.dialer.dial(&self.options.host, self.options.port),
            self.options.read_timeout,
        )
        .await?;

        let (transport, outbound) = ChannelTransport::new();
        let conn = self.on_ready(transport)?;

        let driver = tokio::spawn(drive(
            io,
            conn,
            outbound,
            self.clone(),
            self.options.read_timeout,
        ));
        *self.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(driver);

        self.start_keepalive();
        Ok(())
    }

    fn start_keepalive(self: &Arc<Self>) {
        let Some(interval) = self.options.keepalive_interval else {
            return;
        };
        if !self.codec.registry().contains::<Ping>() {
            debug!(peer = %self.options.label, "Ping not registered; keep-alive disabled");
            return;
        }

        let client = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !ping_once(&client) {
                    break;
                }
            }
        });
        *self.keepalive.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Encode and queue a packet. Fails with `NotConnected` outside a live
    /// session.
    pub fn send(&self, packet: &dyn Packet) -> Result<()> {
        match self.connection.get() {
            Some(conn) if self.is_connected() => conn.send(packet),
            _ => Err(ProtocolError::NotConnected(self.options.label.clone())),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The session's connection, once connected
    pub fn connection(&self) -> Option<&Arc<Connection<C>>> {
        self.connection.get()
    }

    /// Last measured keep-alive round trip
    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.rtt_micros.load(Ordering::Relaxed))
    }

    /// Stop pinging, close the transport and wait up to `timeout` for the
    /// session driver, aborting it if it does not finish
    #[instrument(skip(self), fields(peer = %self.options.label))]
    pub async fn close(&self, timeout: Duration) {
        self.closed.store(true, Ordering::Release);

        let keepalive = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = keepalive {
            task.abort();
        }

        if let Some(conn) = self.connection.get() {
            conn.close();
        }

        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(timeout, &mut driver).await.is_err() {
                warn!(timeout_ms = timeout.as_millis() as u64, "Session driver did not stop in time; aborting");
                driver.abort();
            }
        }
        self.connected.store(false, Ordering::Release);
    }

    fn dispatch(&self, event: ConnectionEvent<C>) {
        if let Err(e) = self.dispatcher.dispatch(event) {
            warn!(peer = %self.options.label, error = %e, "Event dispatch failed");
        }
    }
}

/// Send one keep-alive ping. Returns whether pinging should continue.
fn ping_once<C: Send + Sync + 'static>(client: &Weak<Client<C>>) -> bool {
    let Some(client) = client.upgrade() else {
        return false;
    };
    if !client.is_connected() {
        return false;
    }
    if let Err(e) = client.send(&Ping::now()) {
        debug!(peer = %client.options.label, error = %e, "Keep-alive ping failed");
    } else {
        trace!(peer = %client.options.label, rtt_us = client.rtt().as_micros() as u64, "Ping sent");
    }
    true
}

impl<C: Send + Sync + 'static> SessionHandler<C> for Client<C> {
    fn on_ready(&self, transport: Arc<dyn Transport>) -> Result<Arc<Connection<C>>> {
        if self.closed.load(Ordering::Acquire) {
            transport.close();
            return Err(ProtocolError::ConnectionClosed);
        }

        let context = self
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                ProtocolError::Custom(format!("Client {} was already connected", self.options.label))
            })?;

        let conn = Arc::new(Connection::new(context, self.codec.clone(), transport));
        // The context was taken above, so no other session can get here
        let _ = self.connection.set(conn.clone());
        self.connected.store(true, Ordering::Release);

        global_metrics().connection_established();
        debug!(peer = %self.options.label, "Connected");
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

        if let Some(ping) = packet.downcast_ref::<Ping>() {
            let now = current_timestamp_micros().unwrap_or(ping.sent_at_micros);
            self.rtt_micros
                .store(now.saturating_sub(ping.sent_at_micros), Ordering::Relaxed);
        }

        self.dispatch(ConnectionEvent::Packet(conn.clone(), Arc::from(packet)));
    }

    fn on_closed(&self, conn: &Arc<Connection<C>>, reason: DisconnectReason) {
        if !conn.mark_inactive(reason) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        global_metrics().connection_closed();

        if reason.is_error() {
            debug!(peer = %self.options.label, %reason, "Connection lost");
            self.dispatch(ConnectionEvent::Error(conn.clone()));
        } else {
            debug!(peer = %self.options.label, "Connection closed");
            self.dispatch(ConnectionEvent::Inactive(conn.clone()));
        }
    }

    fn on_write_error(&self, conn: &Arc<Connection<C>>, error: &ProtocolError) {
        warn!(peer = %self.options.label, error = %error, "Write failed; resetting connection");
        self.on_closed(conn, DisconnectReason::Reset);
        conn.close();
    }
}

impl<C> std::fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.options.label)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
