//! Shard membership under moves, removals and concurrent traffic

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use mesh_protocol::server::shard::{OwnershipRange, ShardRegistry};
use mesh_protocol::transport::{ChannelTransport, OutboundQueue};
use mesh_protocol::{
    Connection, ConnectionId, PacketCodec, PacketRegistry, Ping, ProtocolError, ShardId,
    UNASSIGNED_SHARD,
};

/// Context carrying the ownership key a session was tagged with
#[derive(Debug)]
struct Session {
    key: u64,
}

fn codec() -> Arc<PacketCodec> {
    Arc::new(PacketCodec::new(
        PacketRegistry::builder().register::<Ping>().unwrap().build(),
    ))
}

fn session(
    codec: &Arc<PacketCodec>,
    id: ConnectionId,
    key: u64,
) -> (Arc<Connection<Session>>, OutboundQueue) {
    let (transport, outbound) = ChannelTransport::new();
    let conn = Arc::new(Connection::new(Session { key }, codec.clone(), transport));
    conn.assign_id(id).unwrap();
    (conn, outbound)
}

fn lobby_shards() -> HashMap<ShardId, Vec<OwnershipRange>> {
    let mut map = HashMap::new();
    map.insert(0, vec![OwnershipRange::new(100, 199)]);
    map.insert(1, vec![OwnershipRange::new(200, 299)]);
    map
}

/// Every tracked id sits in exactly the shard the reverse index names
fn assert_single_membership<C>(registry: &ShardRegistry<C>, ids: &[ConnectionId]) {
    for &id in ids {
        let home = registry.shard_of(id).unwrap();
        let holders: Vec<ShardId> = registry
            .shard_ids()
            .into_iter()
            .filter(|&shard| {
                registry
                    .connections_in(shard)
                    .iter()
                    .any(|c| c.id() == Some(id))
            })
            .collect();
        assert_eq!(holders, vec![home], "connection {id} in {holders:?}");
    }
}

#[test]
fn tagged_connection_lands_in_owner_shard() {
    let codec = codec();
    let registry = ShardRegistry::new();
    registry.configure_shards(lobby_shards()).unwrap();

    let (conn, mut outbound) = session(&codec, 1, 150);
    registry
        .add_connection(1, conn.clone(), UNASSIGNED_SHARD)
        .unwrap();

    let owner = registry.owner_shard_of(conn.context().key);
    registry.move_connection_to_shard(1, owner).unwrap();
    assert_eq!(registry.shard_of(1), Some(0));

    assert_eq!(registry.broadcast(&Ping::with_timestamp(1), Some(1), None), 0);
    assert!(outbound.try_recv().is_none());

    assert_eq!(registry.broadcast(&Ping::with_timestamp(2), Some(0), None), 1);
    assert!(outbound.try_recv().is_some());
}

#[test]
fn unknown_connection_move_leaves_state_untouched() {
    let codec = codec();
    let registry = ShardRegistry::new();
    registry.configure_shards(lobby_shards()).unwrap();
    let (conn, _out) = session(&codec, 5, 120);
    registry.add_connection(5, conn, 0).unwrap();

    assert!(matches!(
        registry.move_connection_to_shard(99, 1),
        Err(ProtocolError::NotFound(99))
    ));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.connections_in(0).len(), 1);
    assert!(registry.connections_in(1).is_empty());
    assert_single_membership(&registry, &[5]);
}

#[test]
fn keys_outside_every_range_stay_unassigned() {
    let registry: ShardRegistry<Session> = ShardRegistry::new();
    registry.configure_shards(lobby_shards()).unwrap();
    assert_eq!(registry.owner_shard_of(99), UNASSIGNED_SHARD);
    assert_eq!(registry.owner_shard_of(300), UNASSIGNED_SHARD);
    assert_eq!(registry.owner_shard_of(199), 0);
    assert_eq!(registry.owner_shard_of(200), 1);
}

#[test]
fn inactive_connections_are_skipped_by_broadcast() {
    let codec = codec();
    let registry = ShardRegistry::new();
    registry.configure_shards(lobby_shards()).unwrap();

    let (live, mut live_out) = session(&codec, 1, 110);
    let (dead, mut dead_out) = session(&codec, 2, 120);
    registry.add_connection(1, live, 0).unwrap();
    registry.add_connection(2, dead.clone(), 0).unwrap();
    dead.mark_inactive(mesh_protocol::DisconnectReason::Closed);

    assert_eq!(registry.broadcast(&Ping::with_timestamp(3), None, None), 1);
    assert!(live_out.try_recv().is_some());
    assert!(dead_out.try_recv().is_none());
}

#[test]
fn concurrent_moves_keep_single_membership() {
    const CONNECTIONS: u64 = 64;
    const ROUNDS: usize = 200;

    let codec = codec();
    let registry = Arc::new(ShardRegistry::new());
    let mut map = lobby_shards();
    map.insert(2, vec![OwnershipRange::new(300, 399)]);
    registry.configure_shards(map).unwrap();

    let mut queues = Vec::new();
    for id in 0..CONNECTIONS {
        let (conn, out) = session(&codec, id, 100 + id);
        registry
            .add_connection(id, conn, UNASSIGNED_SHARD)
            .unwrap();
        queues.push(out);
    }

    let shards: [ShardId; 4] = [UNASSIGNED_SHARD, 0, 1, 2];
    let workers: Vec<_> = (0..8usize)
        .map(|worker| {
            let registry = registry.clone();
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let id = ((worker * 31 + round * 7) as u64) % CONNECTIONS;
                    let target = shards[(worker + round) % shards.len()];
                    match registry.move_connection_to_shard(id, target) {
                        Ok(()) | Err(ProtocolError::ConcurrentModification(_)) => {}
                        Err(e) => panic!("unexpected move failure: {e}"),
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let ids: Vec<ConnectionId> = (0..CONNECTIONS).collect();
    assert_eq!(registry.len(), CONNECTIONS as usize);
    assert_single_membership(&registry, &ids);

    let total: usize = shards.iter().map(|&s| registry.connections_in(s).len()).sum();
    assert_eq!(total, CONNECTIONS as usize);
}

#[test]
fn removal_during_moves_never_resurrects() {
    let codec = codec();
    let registry = Arc::new(ShardRegistry::new());
    registry.configure_shards(lobby_shards()).unwrap();
    let (conn, _out) = session(&codec, 1, 150);
    registry.add_connection(1, conn, 0).unwrap();

    let mover = {
        let registry = registry.clone();
        thread::spawn(move || {
            for round in 0..500 {
                let _ = registry.move_connection_to_shard(1, (round % 2) as ShardId);
            }
        })
    };
    thread::yield_now();
    registry.remove_connection(1);
    mover.join().unwrap();

    assert!(registry.shard_of(1).is_none());
    assert!(registry.is_empty());
    assert!(registry.connections_in(0).is_empty());
    assert!(registry.connections_in(1).is_empty());
}
