//! # Packet Codec
//!
//! Converts packets to wire frames and back.
//!
//! ```text
//! [Length(2, BE)] [TypeIndex(1)] [Payload(Length)]
//! payload = encrypt(compress(marshal(packet)))
//! ```
//!
//! [`PacketCodec`] works on whole frames and owns the compression and
//! encryption stages. [`FrameCodec`] is the `tokio_util` codec that cuts an
//! ordered byte stream into whole frames using the length prefix, so framing
//! errors never reach the packet layer and a bad packet never desynchronizes
//! the stream.
//!
//! Decoding is forgiving by contract: an empty input, a truncated header, an
//! unknown type index or a payload the packet cannot unmarshal all yield `None`
//! and a log line. The connection carries on.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

use crate::config::CodecConfig;
use crate::core::packet::Packet;
use crate::core::registry::PacketRegistry;
use crate::error::constants::{ERR_SCRATCH_OVERFLOW, ERR_TRUNCATED_FRAME};
use crate::error::{ProtocolError, Result};
use crate::utils::buffer_pool::{BufferPool, DEFAULT_SCRATCH_SIZE};
use crate::utils::compression::{Compression, NoCompression};
use crate::utils::crypto::{Crypt, NoCrypt};
use crate::utils::metrics::global_metrics;

/// Length prefix plus type index
pub const HEADER_LEN: usize = 3;

/// Largest payload the 2-byte length prefix can describe
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Payloads at or above this size are unlikely to fit a single Ethernet frame
pub const MTU_HINT: usize = 1500;

/// Idle scratch buffers kept per codec
const SCRATCH_POOL_SIZE: usize = 8;

/// Encodes packets into frames and decodes frames into packets
pub struct PacketCodec {
    registry: Arc<PacketRegistry>,
    compression: Arc<dyn Compression>,
    crypt: Arc<dyn Crypt>,
    scratch: BufferPool,
}

impl PacketCodec {
    /// Codec with identity compression and encryption and a 4 KiB scratch buffer
    pub fn new(registry: Arc<PacketRegistry>) -> Self {
        Self {
            registry,
            compression: Arc::new(NoCompression),
            crypt: Arc::new(NoCrypt),
            scratch: BufferPool::new(SCRATCH_POOL_SIZE, DEFAULT_SCRATCH_SIZE),
        }
    }

    /// Codec configured from the `[codec]` config section
    pub fn from_config(registry: Arc<PacketRegistry>, config: &CodecConfig) -> Self {
        Self::new(registry)
            .with_scratch_size(config.scratch_buffer_size)
            .with_compression(config.compression.stage())
    }

    pub fn with_compression(mut self, compression: Arc<dyn Compression>) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_crypt(mut self, crypt: Arc<dyn Crypt>) -> Self {
        self.crypt = crypt;
        self
    }

    /// Largest marshaled size a packet may have
    pub fn with_scratch_size(mut self, size: usize) -> Self {
        self.scratch = BufferPool::new(SCRATCH_POOL_SIZE, size);
        self
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    pub fn scratch_size(&self) -> usize {
        self.scratch.buffer_size()
    }

    /// Encode a packet into a complete frame
    ///
    /// # Errors
    /// - `UnregisteredPacket` if the packet's type was never registered
    /// - `BufferOverflow` if marshaling does not fit the scratch buffer
    /// - `OversizedPacket` if the transformed payload exceeds 65535 bytes
    /// - compression or encryption failures
    pub fn encode(&self, packet: &dyn Packet) -> Result<Bytes> {
        let index = self
            .registry
            .index_of(packet)
            .ok_or_else(|| ProtocolError::UnregisteredPacket(packet.kind_name()))?;

        let mut scratch = self.scratch.acquire();
        let written = packet.marshal(&mut scratch[..], 0)?;
        if written > scratch.len() {
            return Err(ProtocolError::Malformed(ERR_SCRATCH_OVERFLOW.to_string()));
        }

        let compressed = self.compression.compress(&scratch[..written])?;
        let payload = self.crypt.encrypt(&compressed)?;
        let len =
            u16::try_from(payload.len()).map_err(|_| ProtocolError::OversizedPacket(payload.len()))?;

        if payload.len() >= MTU_HINT {
            debug!(
                packet = packet.kind_name(),
                payload_len = payload.len(),
                "Payload exceeds MTU, expect fragmentation"
            );
        }

        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
        frame.put_u16(len);
        frame.put_u8(index);
        frame.extend_from_slice(&payload);
        trace!(packet = packet.kind_name(), index, frame_len = frame.len(), "Encoded packet");
        Ok(frame.freeze())
    }

    /// Decode a frame, reporting why it was rejected
    ///
    /// Returns `Ok(None)` for empty input.
    pub fn try_decode(&self, frame: &[u8]) -> Result<Option<Box<dyn Packet>>> {
        if frame.is_empty() {
            return Ok(None);
        }
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::Malformed(ERR_TRUNCATED_FRAME.to_string()));
        }

        let declared = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let index = frame[2];
        let mut packet = self
            .registry
            .instantiate(index)
            .ok_or(ProtocolError::UnknownPacketType(index))?;

        let body = &frame[HEADER_LEN..];
        if body.len() < declared {
            return Err(ProtocolError::BufferUnderflow {
                offset: HEADER_LEN,
                needed: declared,
                available: body.len(),
            });
        }

        let decrypted = self.crypt.decrypt(&body[..declared])?;
        let plain = self.compression.decompress(&decrypted)?;
        let consumed = packet.unmarshal(&plain, 0)?;
        if consumed < plain.len() {
            trace!(
                packet = packet.kind_name(),
                trailing = plain.len() - consumed,
                "Ignoring trailing payload bytes"
            );
        }
        Ok(Some(packet))
    }

    /// Decode a frame; any failure is logged and yields `None`
    pub fn decode(&self, frame: &[u8]) -> Option<Box<dyn Packet>> {
        match self.try_decode(frame) {
            Ok(packet) => packet,
            Err(ProtocolError::UnknownPacketType(index)) => {
                global_metrics().protocol_error();
                warn!(
                    index,
                    registered = self.registry.len(),
                    "Received unknown packet type"
                );
                None
            }
            Err(e) => {
                global_metrics().protocol_error();
                debug!(error = %e, frame_len = frame.len(), "Dropping undecodable frame");
                None
            }
        }
    }
}

impl std::fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCodec")
            .field("registry", &self.registry)
            .field("compression", &self.compression)
            .field("crypt", &self.crypt)
            .field("scratch_size", &self.scratch.buffer_size())
            .finish()
    }
}

/// Splits a byte stream into whole frames
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(total)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::Malformed(ERR_TRUNCATED_FRAME.to_string())),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<()> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidHeader);
        }
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
