#![no_main]

use std::sync::Arc;

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use mesh_protocol::core::codec::FrameCodec;
use mesh_protocol::utils::{ChaChaCrypt, CompressionKind};
use mesh_protocol::{PacketCodec, PacketRegistry, Ping};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let registry = PacketRegistry::builder()
        .register::<Ping>()
        .expect("empty registry accepts a packet")
        .build();
    let plain = PacketCodec::new(registry.clone());
    let sealed = PacketCodec::new(registry)
        .with_compression(CompressionKind::Lz4.stage())
        .with_crypt(Arc::new(ChaChaCrypt::new([3u8; 32])));

    // Single frame straight into the codecs
    let _ = plain.decode(data);
    let _ = sealed.decode(data);

    // Same bytes treated as a stream
    let mut buf = BytesMut::from(data);
    let mut framer = FrameCodec;
    while let Ok(Some(frame)) = framer.decode(&mut buf) {
        let _ = plain.decode(&frame);
    }
    let _ = framer.decode_eof(&mut buf);
});
