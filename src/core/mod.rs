//! # Core Protocol Components
//!
//! Low-level packet handling: the packet trait, the type registry, binary
//! read/write helpers and the frame codec.
//!
//! ## Components
//! - **Packet**: the marshal/unmarshal contract every message implements
//! - **Registry**: one-byte type indices in registration order
//! - **Wire**: bounds-checked big-endian cursors
//! - **Codec**: packet ↔ frame conversion plus stream framing for tokio
//!
//! ## Wire Format
//! ```text
//! [Length(2, BE)] [TypeIndex(1)] [Payload(Length)]
//! ```
//!
//! ## Limits
//! - At most 256 packet kinds
//! - Payload at most 65535 bytes after compression and encryption
//! - Marshaled packet at most one scratch buffer (4096 bytes by default)

pub mod codec;
pub mod packet;
pub mod registry;
pub mod wire;
