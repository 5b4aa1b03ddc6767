//! # Sharded Connection Registry
//!
//! Partitions live connections into shards. A connection belongs to exactly
//! one shard at a time, except transiently while it is being moved: moves copy
//! into the target before removing from the source, so a concurrent broadcast
//! may reach a connection twice but never misses it.
//!
//! Ownership keys map to shards through a static [`ShardTable`] of disjoint
//! inclusive ranges. The table is an immutable snapshot swapped in whole.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::config::validate_shard_map;
use crate::core::packet::Packet;
use crate::error::constants::ERR_SHARD_TABLE_LOCK;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{Connection, ConnectionId};
use crate::utils::metrics::global_metrics;

pub use crate::config::OwnershipRange;

/// Shard identifier
pub type ShardId = i32;

/// Shard holding connections that have not been placed yet
pub const UNASSIGNED_SHARD: ShardId = -1;

/// Immutable ownership table, sorted by range start
#[derive(Debug, Clone, Default)]
pub struct ShardTable {
    entries: Vec<(OwnershipRange, ShardId)>,
}

impl ShardTable {
    /// Validate and build a table. Ranges must be non-empty and disjoint, and
    /// the unassigned sentinel cannot own keys.
    pub fn build(map: &HashMap<ShardId, Vec<OwnershipRange>>) -> Result<Self> {
        let errors = validate_shard_map(map);
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(format!(
                "Invalid shard map: {}",
                errors.join("; ")
            )));
        }

        let mut entries: Vec<_> = map
            .iter()
            .flat_map(|(id, ranges)| ranges.iter().map(move |r| (*r, *id)))
            .collect();
        entries.sort_by_key(|(range, _)| range.start);
        Ok(Self { entries })
    }

    /// Shard owning `key`, or [`UNASSIGNED_SHARD`]
    pub fn owner_of(&self, key: u64) -> ShardId {
        let idx = self.entries.partition_point(|(range, _)| range.start <= key);
        match idx.checked_sub(1).map(|i| &self.entries[i]) {
            Some((range, id)) if range.contains(key) => *id,
            _ => UNASSIGNED_SHARD,
        }
    }

    /// Distinct shard ids that own at least one range
    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<_> = self.entries.iter().map(|(_, id)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Number of ranges
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

type ShardSet<C> = Arc<DashMap<ConnectionId, Arc<Connection<C>>>>;

/// Concurrent shard membership with a reverse index from connection to shard
pub struct ShardRegistry<C> {
    table: RwLock<Arc<ShardTable>>,
    shards: DashMap<ShardId, ShardSet<C>>,
    reverse: DashMap<ConnectionId, ShardId>,
}

impl<C> Default for ShardRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ShardRegistry<C> {
    /// Empty registry with only the unassigned shard
    pub fn new() -> Self {
        let shards = DashMap::new();
        shards.insert(UNASSIGNED_SHARD, Arc::default());
        Self {
            table: RwLock::new(Arc::new(ShardTable::default())),
            shards,
            reverse: DashMap::new(),
        }
    }

    /// Install a new ownership table and create any missing shard sets.
    ///
    /// Existing memberships are kept; shards dropped from the table stay
    /// addressable until empty.
    pub fn configure_shards(&self, map: HashMap<ShardId, Vec<OwnershipRange>>) -> Result<()> {
        let table = ShardTable::build(&map)?;

        for id in map.keys().copied().chain(std::iter::once(UNASSIGNED_SHARD)) {
            self.shards.entry(id).or_default();
        }

        let mut current = self
            .table
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_SHARD_TABLE_LOCK.to_string()))?;
        *current = Arc::new(table);
        debug!(shards = map.len(), ranges = current.len(), "Shard table configured");
        Ok(())
    }

    /// Current ownership table snapshot
    pub fn table(&self) -> Arc<ShardTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Shard owning `key` under the current table
    pub fn owner_shard_of(&self, key: u64) -> ShardId {
        self.table().owner_of(key)
    }

    fn set(&self, shard: ShardId) -> Option<ShardSet<C>> {
        self.shards.get(&shard).map(|s| s.value().clone())
    }

    /// Register a connection in `shard`
    pub fn add_connection(
        &self,
        id: ConnectionId,
        conn: Arc<Connection<C>>,
        shard: ShardId,
    ) -> Result<()> {
        let set = self.set(shard).ok_or(ProtocolError::UnknownShard(shard))?;
        set.insert(id, conn);

        if let Some(previous) = self.reverse.insert(id, shard) {
            if previous != shard {
                if let Some(old) = self.set(previous) {
                    old.remove(&id);
                }
            }
        }
        trace!(connection = id, shard, "Connection added to shard");
        Ok(())
    }

    /// Move a connection to `target`.
    ///
    /// The connection is inserted into the target before it leaves the
    /// source. The reverse index is swapped only if it still names the source
    /// observed at the start; otherwise the target insert is rolled back and
    /// `ConcurrentModification` is returned.
    pub fn move_connection_to_shard(&self, id: ConnectionId, target: ShardId) -> Result<()> {
        let source = self
            .reverse
            .get(&id)
            .map(|entry| *entry.value())
            .ok_or(ProtocolError::NotFound(id))?;
        if source == target {
            return Ok(());
        }

        let target_set = self.set(target).ok_or(ProtocolError::UnknownShard(target))?;
        let source_set = self.set(source);
        let conn = source_set
            .as_ref()
            .and_then(|set| set.get(&id).map(|c| c.value().clone()))
            .ok_or(ProtocolError::ConcurrentModification(id))?;

        target_set.insert(id, conn.clone());

        let swapped = self.reverse.get_mut(&id).is_some_and(|mut entry| {
            if *entry == source {
                *entry = target;
                true
            } else {
                false
            }
        });

        if !swapped {
            // Keep the copy only if a concurrent move already landed here
            target_set.remove_if(&id, |_, _| !self.reverse_is(id, target));
            debug!(connection = id, source, target, "Shard move lost a race");
            return Err(ProtocolError::ConcurrentModification(id));
        }

        if let Some(set) = source_set {
            // A concurrent move back to the source owns that membership now
            set.remove_if(&id, |_, _| !self.reverse_is(id, source));
        }
        // Undo a removal by a racing mover that left before our swap
        if let Entry::Vacant(slot) = target_set.entry(id) {
            if self.reverse_is(id, target) {
                slot.insert(conn);
            }
        }

        global_metrics().shard_move();
        debug!(connection = id, source, target, "Connection moved");
        Ok(())
    }

    fn reverse_is(&self, id: ConnectionId, shard: ShardId) -> bool {
        self.reverse.get(&id).is_some_and(|entry| *entry.value() == shard)
    }

    /// Unregister a connection. Does not close it.
    pub fn remove_connection(&self, id: ConnectionId) -> Option<Arc<Connection<C>>> {
        let (_, shard) = self.reverse.remove(&id)?;
        let removed = self.set(shard)?.remove(&id).map(|(_, conn)| conn);
        trace!(connection = id, shard, "Connection removed from shard");
        removed
    }

    /// Shard currently holding `id`
    pub fn shard_of(&self, id: ConnectionId) -> Option<ShardId> {
        self.reverse.get(&id).map(|entry| *entry.value())
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection<C>>> {
        let shard = self.shard_of(id)?;
        self.set(shard)?.get(&id).map(|c| c.value().clone())
    }

    /// Snapshot of the connections in one shard
    pub fn connections_in(&self, shard: ShardId) -> Vec<Arc<Connection<C>>> {
        self.set(shard)
            .map(|set| set.iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of every registered connection
    pub fn connections(&self) -> Vec<Arc<Connection<C>>> {
        let ids: Vec<ConnectionId> = self.reverse.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter_map(|id| self.connection(id)).collect()
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }

    /// Known shard ids, ascending, including the unassigned shard
    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<_> = self.shards.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Send `packet` to every active connection of `shard` (all shards when
    /// `None`) that passes `predicate`.
    ///
    /// Per-connection failures are logged and skipped. Returns the number of
    /// successful submits.
    pub fn broadcast(
        &self,
        packet: &dyn Packet,
        shard: Option<ShardId>,
        predicate: Option<&dyn Fn(&Connection<C>) -> bool>,
    ) -> usize {
        let targets: Vec<Arc<Connection<C>>> = match shard {
            Some(id) => self.connections_in(id),
            None => {
                let sets: Vec<ShardSet<C>> =
                    self.shards.iter().map(|e| e.value().clone()).collect();
                sets.iter()
                    .flat_map(|set| set.iter().map(|e| e.value().clone()).collect::<Vec<_>>())
                    .collect()
            }
        };

        let mut delivered = 0;
        for conn in targets {
            if conn.is_inactive() || predicate.is_some_and(|keep| !keep(conn.as_ref())) {
                continue;
            }
            match conn.send(packet) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(connection = ?conn.id(), packet = packet.kind_name(), error = %e, "Broadcast send failed");
                }
            }
        }
        trace!(packet = packet.kind_name(), ?shard, delivered, "Broadcast complete");
        delivered
    }
}

impl<C> std::fmt::Debug for ShardRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRegistry")
            .field("shards", &self.shard_ids())
            .field("connections", &self.len())
            .finish()
    }
}
