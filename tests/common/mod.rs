//! Packet kinds and listeners shared by the integration tests

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::{mpsc, Arc};
use std::time::Duration;

use mesh_protocol::core::wire::{WireReader, WireWriter};
use mesh_protocol::{Connection, Listener, Packet, PacketRegistry, Ping, Result};

/// Symmetric key handed to a client after login
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SecretKey {
    pub key: Vec<u8>,
    pub unmarshal_calls: usize,
}

impl SecretKey {
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            unmarshal_calls: 0,
        }
    }
}

impl Packet for SecretKey {
    fn marshal(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let mut w = WireWriter::new(buf, offset);
        w.put_bytes(&self.key)?;
        Ok(w.written())
    }

    fn unmarshal_range(&mut self, buf: &[u8], offset: usize, end: usize) -> Result<usize> {
        let mut r = WireReader::new(buf, offset, end);
        self.key = r.get_bytes()?.to_vec();
        self.unmarshal_calls += 1;
        Ok(r.consumed())
    }
}

/// Server's public key with its owner
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub owner: String,
    pub modulus: Vec<u8>,
    pub exponent: u32,
}

impl Packet for PublicKey {
    fn marshal(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let mut w = WireWriter::new(buf, offset);
        w.put_str(&self.owner)?;
        w.put_bytes(&self.modulus)?;
        w.put_u32(self.exponent)?;
        Ok(w.written())
    }

    fn unmarshal_range(&mut self, buf: &[u8], offset: usize, end: usize) -> Result<usize> {
        let mut r = WireReader::new(buf, offset, end);
        self.owner = r.get_string()?;
        self.modulus = r.get_bytes()?.to_vec();
        self.exponent = r.get_u32()?;
        Ok(r.consumed())
    }
}

/// `[Ping, SecretKey, PublicKey]`, indices 0, 1, 2
pub fn registry() -> Arc<PacketRegistry> {
    PacketRegistry::builder()
        .register::<Ping>()
        .unwrap()
        .register::<SecretKey>()
        .unwrap()
        .register::<PublicKey>()
        .unwrap()
        .build()
}

/// Forwards every event as a label: `active`, `inactive`, `error` or the
/// packet kind name
pub struct Recorder(pub mpsc::Sender<String>);

impl<C: Send + Sync + 'static> Listener<C> for Recorder {
    fn on_active(&self, _conn: &Arc<Connection<C>>) -> Result<()> {
        let _ = self.0.send("active".to_string());
        Ok(())
    }

    fn on_packet(&self, _conn: &Arc<Connection<C>>, packet: &Arc<dyn Packet>) -> Result<()> {
        let label = match packet.downcast_ref::<SecretKey>() {
            Some(secret) => format!("SecretKey:{}", String::from_utf8_lossy(&secret.key)),
            None => packet.kind_name().to_string(),
        };
        let _ = self.0.send(label);
        Ok(())
    }

    fn on_inactive(&self, _conn: &Arc<Connection<C>>) -> Result<()> {
        let _ = self.0.send("inactive".to_string());
        Ok(())
    }

    fn on_error(&self, _conn: &Arc<Connection<C>>) -> Result<()> {
        let _ = self.0.send("error".to_string());
        Ok(())
    }
}

pub fn recorder() -> (Recorder, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel();
    (Recorder(tx), rx)
}

/// Next label other than keep-alive traffic
pub fn next_event(rx: &mpsc::Receiver<String>) -> String {
    loop {
        let label = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        if label != "Ping" {
            return label;
        }
    }
}
