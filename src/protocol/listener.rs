//! # Listeners
//!
//! Application callbacks for connection events. Callbacks run on the
//! listener's own worker thread (see [`crate::protocol::dispatcher`]), never on
//! an I/O task, so they may block.
//!
//! A callback that returns an error or panics is logged with the listener name
//! and the operation; the listener keeps receiving later events.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::core::packet::Packet;
use crate::error::Result;
use crate::protocol::connection::Connection;
use crate::utils::metrics::global_metrics;

/// Subscriber for connection lifecycle and packet events
pub trait Listener<C>: Send + Sync + 'static {
    /// The session is established and ready for traffic
    fn on_active(&self, _conn: &Arc<Connection<C>>) -> Result<()> {
        Ok(())
    }

    fn on_packet(&self, conn: &Arc<Connection<C>>, packet: &Arc<dyn Packet>) -> Result<()>;

    /// The session closed cleanly or timed out
    fn on_inactive(&self, conn: &Arc<Connection<C>>) -> Result<()>;

    /// The session failed
    fn on_error(&self, _conn: &Arc<Connection<C>>) -> Result<()> {
        Ok(())
    }
}

/// One event, fanned out to every registered listener
pub enum ConnectionEvent<C> {
    Active(Arc<Connection<C>>),
    Packet(Arc<Connection<C>>, Arc<dyn Packet>),
    Inactive(Arc<Connection<C>>),
    Error(Arc<Connection<C>>),
}

impl<C: 'static> ConnectionEvent<C> {
    /// Name of the listener operation this event invokes
    pub fn operation(&self) -> &'static str {
        match self {
            ConnectionEvent::Active(_) => "on_active",
            ConnectionEvent::Packet(..) => "on_packet",
            ConnectionEvent::Inactive(_) => "on_inactive",
            ConnectionEvent::Error(_) => "on_error",
        }
    }

    pub fn connection(&self) -> &Arc<Connection<C>> {
        match self {
            ConnectionEvent::Active(conn)
            | ConnectionEvent::Packet(conn, _)
            | ConnectionEvent::Inactive(conn)
            | ConnectionEvent::Error(conn) => conn,
        }
    }

    /// Invoke the matching listener operation
    pub fn deliver(&self, listener: &dyn Listener<C>) -> Result<()> {
        match self {
            ConnectionEvent::Active(conn) => listener.on_active(conn),
            ConnectionEvent::Packet(conn, packet) => listener.on_packet(conn, packet),
            ConnectionEvent::Inactive(conn) => listener.on_inactive(conn),
            ConnectionEvent::Error(conn) => listener.on_error(conn),
        }
    }
}

impl<C> Clone for ConnectionEvent<C> {
    fn clone(&self) -> Self {
        match self {
            ConnectionEvent::Active(conn) => ConnectionEvent::Active(conn.clone()),
            ConnectionEvent::Packet(conn, packet) => {
                ConnectionEvent::Packet(conn.clone(), packet.clone())
            }
            ConnectionEvent::Inactive(conn) => ConnectionEvent::Inactive(conn.clone()),
            ConnectionEvent::Error(conn) => ConnectionEvent::Error(conn.clone()),
        }
    }
}

impl<C: 'static> std::fmt::Debug for ConnectionEvent<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEvent")
            .field("operation", &self.operation())
            .field("connection", &self.connection().id())
            .finish()
    }
}

/// Run a subscriber callback, logging and swallowing errors and panics.
/// Returns whether the callback completed successfully.
pub(crate) fn guarded<F>(subscriber: &str, operation: &str, callback: F) -> bool
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            global_metrics().listener_failure();
            error!(listener = subscriber, operation, error = %e, "Listener callback failed");
            false
        }
        Err(payload) => {
            global_metrics().listener_panic();
            error!(
                listener = subscriber,
                operation,
                panic = panic_message(payload.as_ref()),
                "Listener callback panicked"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
