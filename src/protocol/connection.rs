//! # Connection
//!
//! Per-session state wrapping one transport and one codec.
//!
//! A connection starts `Active` and moves to `Inactive` exactly once. Read
//! timeouts, resets, explicit closes and protocol exceptions all race for that
//! single transition through [`Connection::mark_inactive`]; only the winner
//! fires lifecycle notifications.
//!
//! The application context `C` is fixed at construction and shared by
//! reference. The connection id is assigned once by the owning server.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::constants::ERR_ID_ALREADY_ASSIGNED;
use crate::error::{ProtocolError, Result};
use crate::transport::Transport;
use crate::utils::metrics::global_metrics;

/// Server-assigned connection identifier
pub type ConnectionId = u64;

/// Liveness of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Inactive,
}

/// What ended a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly close by either side, or end of stream
    Closed,
    /// No frame arrived within the read timeout
    ReadTimeout,
    /// The transport failed
    Reset,
    /// The byte stream could not be framed
    ProtocolException,
}

impl DisconnectReason {
    /// Whether listeners see this as an error rather than a plain close
    pub fn is_error(self) -> bool {
        !matches!(self, DisconnectReason::Closed)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Closed => "closed",
            DisconnectReason::ReadTimeout => "read timeout",
            DisconnectReason::Reset => "reset",
            DisconnectReason::ProtocolException => "protocol exception",
        };
        f.write_str(text)
    }
}

/// Traffic counters for one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
}

pub struct Connection<C> {
    id: OnceLock<ConnectionId>,
    inactive: AtomicBool,
    context: C,
    codec: Arc<PacketCodec>,
    transport: Arc<dyn Transport>,
    created_at: Instant,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl<C> Connection<C> {
    pub fn new(context: C, codec: Arc<PacketCodec>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: OnceLock::new(),
            inactive: AtomicBool::new(false),
            context,
            codec,
            transport,
            created_at: Instant::now(),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Assigned id, or `None` before registration
    pub fn id(&self) -> Option<ConnectionId> {
        self.id.get().copied()
    }

    /// Set the id. Fails if one was already assigned.
    pub fn assign_id(&self, id: ConnectionId) -> Result<()> {
        self.id
            .set(id)
            .map_err(|_| ProtocolError::Custom(ERR_ID_ALREADY_ASSIGNED.to_string()))
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn codec(&self) -> &Arc<PacketCodec> {
        &self.codec
    }

    pub fn state(&self) -> ConnectionState {
        if self.inactive.load(Ordering::Acquire) {
            ConnectionState::Inactive
        } else {
            ConnectionState::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_inactive(&self) -> bool {
        !self.is_active()
    }

    /// Flip to `Inactive`. Returns `true` only for the caller that performed the
    /// transition.
    pub fn mark_inactive(&self, reason: DisconnectReason) -> bool {
        let won = self
            .inactive
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            debug!(connection = ?self.id(), %reason, "Connection inactive");
        }
        won
    }

    /// Encode and submit a packet for asynchronous write
    ///
    /// Sending on an inactive connection is a silent no-op.
    pub fn send(&self, packet: &dyn Packet) -> Result<()> {
        if self.is_inactive() {
            trace!(connection = ?self.id(), packet = packet.kind_name(), "Send on inactive connection ignored");
            return Ok(());
        }

        let frame = self.codec.encode(packet).inspect_err(|e| {
            global_metrics().send_failure();
            debug!(connection = ?self.id(), packet = packet.kind_name(), error = %e, "Failed to encode packet");
        })?;
        let len = frame.len() as u64;
        self.transport.submit(frame).inspect_err(|_| {
            global_metrics().send_failure();
        })?;

        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        global_metrics().packet_sent(len);
        trace!(connection = ?self.id(), packet = packet.kind_name(), bytes = len, "Packet queued");
        Ok(())
    }

    /// Decode one inbound frame
    pub fn receive(&self, frame: &[u8]) -> Option<Box<dyn Packet>> {
        let len = frame.len() as u64;
        self.bytes_received.fetch_add(len, Ordering::Relaxed);

        let packet = self.codec.decode(frame)?;
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        global_metrics().packet_received(len);
        trace!(connection = ?self.id(), packet = packet.kind_name(), bytes = len, "Packet received");
        Some(packet)
    }

    /// Close the transport. The session driver reports the close to the owner,
    /// which performs the state transition.
    pub fn close(&self) {
        if self.transport.is_open() {
            debug!(connection = ?self.id(), "Closing connection");
        }
        self.transport.close();
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Time since the connection was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl<C> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
