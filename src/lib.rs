//! # Mesh Protocol
//!
//! Binary packet protocol core for TLS-secured client/server and server/server
//! topologies.
//!
//! ## Layers
//! - [`core`]: packet trait, type registry, frame codec, wire helpers
//! - [`protocol`]: connection lifecycle, listeners, per-subscriber dispatch
//! - [`transport`]: the transport contract, the tokio stream driver and TLS
//! - [`server`]: sharded connection registry and the accepting server
//! - [`client`]: outbound connection with keep-alive pings
//! - [`bridge`]: reconnecting server-to-server mesh with ownership routing
//! - [`security`]: signed, time-limited session handoff tokens
//!
//! ## Wire Format
//! ```text
//! [Length(2, BE)] [TypeIndex(1)] [Payload(Length)]
//! payload = encrypt(compress(marshal(packet)))
//! ```
//!
//! Every communicating endpoint must register the same packet kinds in the same
//! order. There is no runtime schema exchange.

pub mod bridge;
pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod security;
pub mod server;
pub mod transport;
pub mod utils;

pub use crate::core::codec::PacketCodec;
pub use crate::core::packet::Packet;
pub use crate::core::registry::{PacketRegistry, PacketRegistryBuilder};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::connection::{Connection, ConnectionId, DisconnectReason};
pub use crate::protocol::listener::{ConnectionEvent, Listener};
pub use crate::protocol::packets::Ping;
pub use crate::server::shard::{ShardId, UNASSIGNED_SHARD};
