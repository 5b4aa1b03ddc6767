//! # Packet Registry
//!
//! Maps packet kinds to one-byte wire indices. The index of a kind is its
//! registration order, so every endpoint must register the same kinds in the
//! same order; there is no runtime negotiation.
//!
//! The registry is assembled once through [`PacketRegistryBuilder`] and frozen
//! into an `Arc<PacketRegistry>` shared by every codec.
//!
//! ```rust
//! use mesh_protocol::{PacketRegistry, Ping};
//!
//! let registry = PacketRegistry::builder().register::<Ping>().unwrap().build();
//! assert_eq!(registry.index_of_type::<Ping>(), Some(0));
//! assert!(registry.instantiate(1).is_none());
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::packet::{short_name, Packet};
use crate::error::{ProtocolError, Result};

/// Maximum number of packet kinds addressable by a one-byte index
pub const MAX_PACKET_KINDS: usize = 256;

type PacketFactory = fn() -> Box<dyn Packet>;

fn new_default<P: Packet + Default>() -> Box<dyn Packet> {
    Box::new(P::default())
}

#[derive(Clone)]
struct PacketKind {
    name: &'static str,
    type_id: TypeId,
    factory: PacketFactory,
}

/// Accumulates packet kinds in wire order
#[derive(Default)]
pub struct PacketRegistryBuilder {
    kinds: Vec<PacketKind>,
}

impl PacketRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `P` at the next index
    ///
    /// # Errors
    /// `DuplicatePacket` if `P` is already registered, `RegistryFull` once 256
    /// kinds are registered.
    pub fn register<P: Packet + Default>(mut self) -> Result<Self> {
        let type_id = TypeId::of::<P>();
        let name = short_name(std::any::type_name::<P>());

        if self.kinds.iter().any(|k| k.type_id == type_id) {
            return Err(ProtocolError::DuplicatePacket(name));
        }
        if self.kinds.len() >= MAX_PACKET_KINDS {
            return Err(ProtocolError::RegistryFull(MAX_PACKET_KINDS));
        }

        debug!(packet = name, index = self.kinds.len(), "Registered packet kind");
        self.kinds.push(PacketKind {
            name,
            type_id,
            factory: new_default::<P>,
        });
        Ok(self)
    }

    /// Freeze the registry
    pub fn build(self) -> Arc<PacketRegistry> {
        let index = self
            .kinds
            .iter()
            .enumerate()
            .map(|(i, k)| (k.type_id, i as u8))
            .collect();
        Arc::new(PacketRegistry {
            kinds: self.kinds,
            index,
        })
    }
}

/// Immutable packet kind table
pub struct PacketRegistry {
    kinds: Vec<PacketKind>,
    index: HashMap<TypeId, u8>,
}

impl PacketRegistry {
    pub fn builder() -> PacketRegistryBuilder {
        PacketRegistryBuilder::new()
    }

    /// Wire index of the packet's concrete type
    pub fn index_of(&self, packet: &dyn Packet) -> Option<u8> {
        self.index.get(&packet.as_any().type_id()).copied()
    }

    /// Wire index of `P`
    pub fn index_of_type<P: Packet>(&self) -> Option<u8> {
        self.index.get(&TypeId::of::<P>()).copied()
    }

    pub fn contains<P: Packet>(&self) -> bool {
        self.index.contains_key(&TypeId::of::<P>())
    }

    /// Fresh default instance of the kind at `index`, or `None` when the index
    /// is outside `[0, len)`
    pub fn instantiate(&self, index: u8) -> Option<Box<dyn Packet>> {
        self.kinds.get(index as usize).map(|k| (k.factory)())
    }

    /// Short type name of the kind at `index`
    pub fn name_of(&self, index: u8) -> Option<&'static str> {
        self.kinds.get(index as usize).map(|k| k.name)
    }

    /// Registered kind names in wire order
    pub fn names(&self) -> Vec<&'static str> {
        self.kinds.iter().map(|k| k.name).collect()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl std::fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRegistry")
            .field("kinds", &self.names())
            .finish()
    }
}
