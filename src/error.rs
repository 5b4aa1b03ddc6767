//! # Error Types
//!
//! Error handling for the packet codec, connection lifecycle, shard registry,
//! listener dispatch and bridge mesh.
//!
//! ## Error Categories
//! - **Protocol Errors**: unknown packet type, truncated or malformed payloads.
//!   A protocol error drops the single packet; the connection stays active.
//! - **Transport Errors**: timeouts, resets and I/O failures. These flip a
//!   connection to inactive exactly once.
//! - **Configuration Errors**: oversized packet registries, invalid shard maps,
//!   missing factories. These are raised at startup and are fatal.
//! - **Security Errors**: TLS setup failures and rejected handoff tokens.
//!
//! ## Example Usage
//! ```rust
//! use mesh_protocol::error::{ProtocolError, Result};
//!
//! fn checked_len(len: usize) -> Result<u16> {
//!     u16::try_from(len).map_err(|_| ProtocolError::OversizedPacket(len))
//! }
//!
//! assert!(checked_len(70_000).is_err());
//! ```

use std::io;
use thiserror::Error;

use crate::protocol::connection::ConnectionId;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Registry-related error messages
    pub const ERR_SHARD_TABLE_LOCK: &str = "Failed to acquire lock on shard table";
    pub const ERR_BRIDGE_LOCK: &str = "Failed to acquire lock on bridge state";

    /// Connection errors
    pub const ERR_TRANSPORT_CLOSED: &str = "Transport write queue closed";
    pub const ERR_ID_ALREADY_ASSIGNED: &str = "Connection id already assigned";

    /// Codec errors
    pub const ERR_SCRATCH_OVERFLOW: &str = "Packet does not fit in the scratch buffer";
    pub const ERR_TRUNCATED_FRAME: &str = "Frame shorter than its header";

    /// Handoff token rejections
    pub const ERR_TOKEN_EMPTY: &str = "empty token";
    pub const ERR_TOKEN_FORMAT: &str = "malformed token";
    pub const ERR_TOKEN_SIGNATURE: &str = "signature mismatch";
    pub const ERR_TOKEN_EXPIRED: &str = "token expired";
    pub const ERR_TOKEN_FIELD: &str = "token field contains a reserved delimiter";

    /// Time errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Unknown packet type index: {0}")]
    UnknownPacketType(u8),

    #[error("Packet type not registered: {0}")]
    UnregisteredPacket(&'static str),

    #[error("Packet type registered twice: {0}")]
    DuplicatePacket(&'static str),

    #[error("Packet registry is full ({0} types maximum)")]
    RegistryFull(usize),

    #[error("Buffer underflow: need {needed} bytes at offset {offset}, have {available}")]
    BufferUnderflow {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Buffer overflow: need {needed} bytes at offset {offset}, capacity {capacity}")]
    BufferOverflow {
        offset: usize,
        needed: usize,
        capacity: usize,
    },

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Connection not found: {0}")]
    NotFound(ConnectionId),

    #[error("Unknown shard: {0}")]
    UnknownShard(i32),

    #[error("Connection {0} changed shard concurrently")]
    ConcurrentModification(ConnectionId),

    #[error("Listener already registered: {0}")]
    DuplicateListener(String),

    #[error("Peer not connected: {0}")]
    NotConnected(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Handoff token rejected: {0}")]
    TokenRejected(&'static str),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error concerns a single packet only, leaving the
    /// connection usable.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidHeader
                | ProtocolError::UnknownPacketType(_)
                | ProtocolError::BufferUnderflow { .. }
                | ProtocolError::Malformed(_)
                | ProtocolError::DecryptionFailure
                | ProtocolError::DecompressionFailure
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
