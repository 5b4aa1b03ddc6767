//! # Payload Compression
//!
//! The codec runs every marshaled packet through a [`Compression`] stage before
//! encryption, and the inverse on decode. Both endpoints must agree on the
//! stage out of band; the wire format carries no compression flag.
//!
//! The trait defaults are the identity transform, so [`NoCompression`] simply
//! borrows its input.
//!
//! Decompression enforces [`MAX_UNCOMPRESSED_SIZE`] so a hostile peer cannot make
//! us allocate gigabytes from a tiny frame.

use std::borrow::Cow;
use std::fmt::Debug;
use std::io::Read;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::MAX_UNCOMPRESSED_SIZE;
use crate::error::{ProtocolError, Result};

/// Maximum output size for decompression
const MAX_DECOMPRESSION_SIZE: usize = MAX_UNCOMPRESSED_SIZE;

/// Zstd level used for packet payloads
const ZSTD_LEVEL: i32 = 1;

/// Pluggable compression stage. Defaults are the identity transform.
pub trait Compression: Send + Sync + Debug + 'static {
    fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(data))
    }

    fn decompress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(data))
    }
}

/// Identity compression
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl Compression for NoCompression {}

/// LZ4 block compression with a prepended size header
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compression;

impl Compression for Lz4Compression {
    fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Owned(lz4_flex::compress_prepend_size(data)))
    }

    fn decompress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        // Little-endian output length, checked before lz4_flex allocates it
        let header: [u8; 4] = data
            .get(..4)
            .and_then(|h| h.try_into().ok())
            .ok_or(ProtocolError::DecompressionFailure)?;
        if u32::from_le_bytes(header) as usize > MAX_DECOMPRESSION_SIZE {
            return Err(ProtocolError::DecompressionFailure);
        }

        lz4_flex::decompress_size_prepended(data)
            .map(Cow::Owned)
            .map_err(|_| ProtocolError::DecompressionFailure)
    }
}

/// Zstd stream compression
#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdCompression;

impl Compression for ZstdCompression {
    fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        zstd::stream::encode_all(data, ZSTD_LEVEL)
            .map(Cow::Owned)
            .map_err(|_| ProtocolError::CompressionFailure)
    }

    fn decompress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        let decoder =
            zstd::stream::Decoder::new(data).map_err(|_| ProtocolError::DecompressionFailure)?;

        // One byte past the limit is enough to tell an oversized frame apart
        let mut out = Vec::new();
        decoder
            .take(MAX_DECOMPRESSION_SIZE as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|_| ProtocolError::DecompressionFailure)?;
        if out.len() > MAX_DECOMPRESSION_SIZE {
            return Err(ProtocolError::DecompressionFailure);
        }
        Ok(Cow::Owned(out))
    }
}

/// Compression selected by configuration
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    None,
    Lz4,
    Zstd,
}

impl CompressionKind {
    /// Build the codec stage for this kind
    pub fn stage(self) -> Arc<dyn Compression> {
        match self {
            CompressionKind::None => Arc::new(NoCompression),
            CompressionKind::Lz4 => Arc::new(Lz4Compression),
            CompressionKind::Zstd => Arc::new(ZstdCompression),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_identity_borrows_input() {
        let data = b"plain";
        let out = NoCompression.compress(data).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*NoCompression.decompress(&out).unwrap(), data);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_lz4_stage_roundtrip() {
        let stage = CompressionKind::Lz4.stage();
        let original = b"Hello, World! Hello, World! Hello, World!";
        let compressed = stage.compress(original).unwrap().into_owned();
        assert_eq!(&*stage.decompress(&compressed).unwrap(), original);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zstd_stage_roundtrip() {
        let stage = CompressionKind::Zstd.stage();
        let original = vec![3u8; 2048];
        let compressed = stage.compress(&original).unwrap().into_owned();
        assert!(compressed.len() < original.len());
        assert_eq!(stage.decompress(&compressed).unwrap().as_ref(), &original[..]);
    }

    #[test]
    fn test_lz4_rejects_huge_length_header() {
        // Header alone claims a ~3 GiB block
        let result = CompressionKind::Lz4.stage().decompress(&[0x2b, 0x60, 0xbb, 0xbb]);
        assert!(matches!(result, Err(ProtocolError::DecompressionFailure)));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_lz4_length_header_bounds() {
        let stage = CompressionKind::Lz4.stage();

        let mut past_limit = ((MAX_DECOMPRESSION_SIZE + 1) as u32).to_le_bytes().to_vec();
        past_limit.extend_from_slice(&[0u8; 16]);
        assert!(stage.decompress(&past_limit).is_err());

        // Exactly at the limit is still accepted
        let at_limit = vec![0u8; MAX_DECOMPRESSION_SIZE];
        let compressed = stage.compress(&at_limit).unwrap().into_owned();
        assert_eq!(stage.decompress(&compressed).unwrap().len(), MAX_DECOMPRESSION_SIZE);
    }

    #[test]
    fn test_lz4_truncated_or_corrupt_block() {
        let stage = CompressionKind::Lz4.stage();
        assert!(stage.decompress(&[]).is_err());
        assert!(stage.decompress(&[0x2b, 0x60]).is_err());
        assert!(stage
            .decompress(&[0x10, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff])
            .is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zstd_output_capped() {
        let stage = CompressionKind::Zstd.stage();
        let bomb = vec![0u8; MAX_DECOMPRESSION_SIZE + 1];
        let compressed = stage.compress(&bomb).unwrap().into_owned();
        assert!(compressed.len() < 1024);
        assert!(matches!(
            stage.decompress(&compressed),
            Err(ProtocolError::DecompressionFailure)
        ));
    }

    #[test]
    fn test_zstd_garbage_rejected() {
        let result = ZstdCompression.decompress(b"definitely not zstd");
        assert!(matches!(result, Err(ProtocolError::DecompressionFailure)));
    }
}
