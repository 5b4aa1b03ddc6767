//! Listener isolation and per-listener ordering

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use mesh_protocol::protocol::dispatcher::Dispatcher;
use mesh_protocol::transport::ChannelTransport;
use mesh_protocol::{
    Connection, ConnectionEvent, Listener, Packet, PacketCodec, PacketRegistry, Ping,
    ProtocolError, Result,
};

fn connection() -> Arc<Connection<()>> {
    let (transport, _outbound) = ChannelTransport::new();
    let codec = Arc::new(PacketCodec::new(
        PacketRegistry::builder().register::<Ping>().unwrap().build(),
    ));
    Arc::new(Connection::new((), codec, transport))
}

fn ping_event(conn: &Arc<Connection<()>>, n: u64) -> ConnectionEvent<()> {
    let packet: Arc<dyn Packet> = Arc::new(Ping::with_timestamp(n));
    ConnectionEvent::Packet(conn.clone(), packet)
}

/// Reports the sequence number of every ping it sees
struct Sequence {
    tx: mpsc::Sender<u64>,
    /// Sequence numbers on which the callback fails
    fail_on: Vec<u64>,
    panic_on: Vec<u64>,
    calls: Arc<AtomicUsize>,
}

impl Sequence {
    fn new(tx: mpsc::Sender<u64>) -> Self {
        Self {
            tx,
            fail_on: Vec::new(),
            panic_on: Vec::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Listener<()> for Sequence {
    fn on_packet(&self, _conn: &Arc<Connection<()>>, packet: &Arc<dyn Packet>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = packet.downcast_ref::<Ping>().unwrap().sent_at_micros;
        if self.panic_on.contains(&n) {
            panic!("listener blew up on {n}");
        }
        if self.fail_on.contains(&n) {
            return Err(ProtocolError::Custom(format!("rejected {n}")));
        }
        self.tx.send(n).unwrap();
        Ok(())
    }

    fn on_inactive(&self, _conn: &Arc<Connection<()>>) -> Result<()> {
        Ok(())
    }
}

fn collect(rx: &mpsc::Receiver<u64>, count: usize) -> Vec<u64> {
    (0..count)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect()
}

#[test]
fn failing_listener_keeps_receiving_and_does_not_affect_others() {
    let dispatcher = Dispatcher::new();
    let conn = connection();

    let (tx_a, rx_a) = mpsc::channel();
    let mut a = Sequence::new(tx_a);
    a.fail_on.push(1);
    let a_calls = a.calls.clone();

    let (tx_b, rx_b) = mpsc::channel();
    dispatcher.add("a", a).unwrap();
    dispatcher.add("b", Sequence::new(tx_b)).unwrap();

    dispatcher.dispatch(ping_event(&conn, 1)).unwrap();
    dispatcher.dispatch(ping_event(&conn, 2)).unwrap();

    assert_eq!(collect(&rx_b, 2), vec![1, 2]);
    assert_eq!(collect(&rx_a, 1), vec![2]);
    assert_eq!(a_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn panicking_listener_survives() {
    let dispatcher = Dispatcher::new();
    let conn = connection();

    let (tx_a, rx_a) = mpsc::channel();
    let mut a = Sequence::new(tx_a);
    a.panic_on.push(1);

    let (tx_b, rx_b) = mpsc::channel();
    dispatcher.add("a", a).unwrap();
    dispatcher.add("b", Sequence::new(tx_b)).unwrap();

    for n in 1..=3 {
        dispatcher.dispatch(ping_event(&conn, n)).unwrap();
    }

    assert_eq!(collect(&rx_a, 2), vec![2, 3]);
    assert_eq!(collect(&rx_b, 3), vec![1, 2, 3]);
}

#[test]
fn events_arrive_in_submission_order() {
    const EVENTS: u64 = 2_000;

    let dispatcher = Dispatcher::new();
    let conn = connection();
    let (tx, rx) = mpsc::channel();
    dispatcher.add("ordered", Sequence::new(tx)).unwrap();

    for n in 0..EVENTS {
        dispatcher.dispatch(ping_event(&conn, n)).unwrap();
    }

    let received = collect(&rx, EVENTS as usize);
    assert!(received.windows(2).all(|w| w[0] + 1 == w[1]));
}

#[test]
fn slow_listener_does_not_delay_fast_one() {
    struct Slow;

    impl Listener<()> for Slow {
        fn on_packet(&self, _conn: &Arc<Connection<()>>, _packet: &Arc<dyn Packet>) -> Result<()> {
            std::thread::sleep(Duration::from_secs(2));
            Ok(())
        }

        fn on_inactive(&self, _conn: &Arc<Connection<()>>) -> Result<()> {
            Ok(())
        }
    }

    let dispatcher = Dispatcher::new();
    let conn = connection();
    let (tx, rx) = mpsc::channel();
    dispatcher.add("slow", Slow).unwrap();
    dispatcher.add("fast", Sequence::new(tx)).unwrap();

    dispatcher.dispatch(ping_event(&conn, 7)).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_millis(1_000)).unwrap(), 7);

    dispatcher.shutdown();
    assert!(dispatcher.is_empty());
}
