//! # Utility Modules
//!
//! Supporting utilities shared by the codec, connections and the mesh.
//!
//! ## Components
//! - **Buffer Pool**: fixed-size scratch buffers for marshaling
//! - **Compression**: identity, LZ4 and Zstd stages with size limits
//! - **Crypto**: identity and XChaCha20-Poly1305 stages
//! - **Logging**: `tracing` subscriber setup
//! - **Metrics**: thread-safe observability counters
//! - **Time**: timestamp utilities for expiry checks and ping round trips
//! - **Timeout**: default durations and async timeout wrappers

pub mod buffer_pool;
pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod time;
pub mod timeout;

pub use compression::{Compression, CompressionKind, Lz4Compression, NoCompression, ZstdCompression};
pub use crypto::{ChaChaCrypt, Crypt, NoCrypt};
