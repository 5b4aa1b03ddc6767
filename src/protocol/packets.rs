//! Built-in packet kinds.

use crate::core::packet::Packet;
use crate::core::wire::{WireReader, WireWriter};
use crate::error::Result;
use crate::utils::time::current_timestamp_micros;

/// Keep-alive probe. Servers echo it unchanged; clients measure the round trip
/// from `sent_at_micros`.
///
/// Register it on both ends to enable keep-alive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Sender's wall clock in microseconds since the Unix epoch
    pub sent_at_micros: u64,
}

impl Ping {
    /// A ping stamped with the current time
    pub fn now() -> Self {
        Self {
            sent_at_micros: current_timestamp_micros().unwrap_or_default(),
        }
    }

    pub fn with_timestamp(sent_at_micros: u64) -> Self {
        Self { sent_at_micros }
    }
}

impl Packet for Ping {
    fn marshal(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let mut w = WireWriter::new(buf, offset);
        w.put_u64(self.sent_at_micros)?;
        Ok(w.written())
    }

    fn unmarshal_range(&mut self, buf: &[u8], offset: usize, end: usize) -> Result<usize> {
        let mut r = WireReader::new(buf, offset, end);
        self.sent_at_micros = r.get_u64()?;
        Ok(r.consumed())
    }
}
