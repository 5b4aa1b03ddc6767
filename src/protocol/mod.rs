//! # Protocol Layer
//!
//! Connection lifecycle and event delivery.
//!
//! ## Components
//! - **Connection**: per-session state with a single Active → Inactive transition
//! - **Listener**: application callbacks for connection events
//! - **Dispatcher**: isolated per-listener worker threads
//! - **Packets**: built-in packet kinds (keep-alive ping)

pub mod connection;
pub mod dispatcher;
pub mod listener;
pub mod packets;
