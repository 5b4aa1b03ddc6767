//! # Packet Trait
//!
//! Every message on the wire is a concrete type implementing [`Packet`]. The
//! codec never sees field layouts: it asks the packet to marshal itself into a
//! scratch buffer, and on decode asks a fresh `Default` instance of the
//! registered kind to unmarshal the payload.
//!
//! Consumers recover the concrete type by downcasting:
//!
//! ```rust
//! use mesh_protocol::{Packet, Ping};
//!
//! let packet: Box<dyn Packet> = Box::new(Ping::with_timestamp(42));
//! assert_eq!(packet.downcast_ref::<Ping>().map(|p| p.sent_at_micros), Some(42));
//! assert!(packet.is::<Ping>());
//! ```

use std::any::Any;
use std::fmt::Debug;

use crate::error::Result;

/// Type-erasure helper so `dyn Packet` can be downcast. Implemented for every
/// `'static` type; never implement it by hand.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;

    /// Fully qualified Rust type name, for diagnostics
    fn type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A message kind that can be written to and read from the wire.
///
/// `marshal` must write every field starting at `offset` and return the number
/// of bytes written. `unmarshal_range` must read only from `[offset, end)` and
/// return the number of bytes consumed. Use [`crate::core::wire`] for bounds
/// checked access.
pub trait Packet: AsAny + Debug + Send + Sync {
    /// Serialize into `buf` starting at `offset`
    fn marshal(&self, buf: &mut [u8], offset: usize) -> Result<usize>;

    /// Deserialize from `buf[offset..end]`
    fn unmarshal_range(&mut self, buf: &[u8], offset: usize, end: usize) -> Result<usize>;

    /// Deserialize from `buf[offset..]`
    fn unmarshal(&mut self, buf: &[u8], offset: usize) -> Result<usize> {
        self.unmarshal_range(buf, offset, buf.len())
    }
}

impl dyn Packet {
    /// Borrow the concrete packet if it is a `T`
    pub fn downcast_ref<T: Packet>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Whether the concrete packet is a `T`
    pub fn is<T: Packet>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Short type name (last path segment) for log fields
    pub fn kind_name(&self) -> &'static str {
        short_name(self.type_name())
    }
}

/// Last path segment of a Rust type name, keeping generic arguments intact
pub(crate) fn short_name(full: &'static str) -> &'static str {
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
