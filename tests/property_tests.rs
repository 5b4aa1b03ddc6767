//! Property-based tests using proptest
//!
//! These exercise the codec pipeline, compression stages and shard ownership
//! lookups across randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{registry, PublicKey, SecretKey};
use mesh_protocol::server::shard::{OwnershipRange, ShardTable};
use mesh_protocol::utils::compression::CompressionKind;
use mesh_protocol::utils::ChaChaCrypt;
use mesh_protocol::{Packet, PacketCodec, UNASSIGNED_SHARD};
use proptest::prelude::*;

fn compression_kind() -> impl Strategy<Value = CompressionKind> {
    prop_oneof![
        Just(CompressionKind::None),
        Just(CompressionKind::Lz4),
        Just(CompressionKind::Zstd),
    ]
}

// Property: a packet survives marshal and unmarshal on its own
proptest! {
    #[test]
    fn prop_public_key_marshal_roundtrip(
        owner in "[a-z0-9-]{0,64}",
        modulus in prop::collection::vec(any::<u8>(), 0..512),
        exponent in any::<u32>(),
    ) {
        let original = PublicKey { owner, modulus, exponent };
        let mut buf = vec![0u8; 1024];
        let written = original.marshal(&mut buf, 0).expect("Marshal should not fail");

        let mut decoded = PublicKey::default();
        let consumed = decoded.unmarshal(&buf[..written], 0).expect("Unmarshal should not fail");

        prop_assert_eq!(consumed, written);
        prop_assert_eq!(decoded, original);
    }
}

// Property: encode then decode yields the same packet for every pipeline
proptest! {
    #[test]
    fn prop_codec_roundtrip(
        key in prop::collection::vec(any::<u8>(), 0..2048),
        kind in compression_kind(),
        encrypted in any::<bool>(),
    ) {
        let mut codec = PacketCodec::new(registry()).with_compression(kind.stage());
        if encrypted {
            codec = codec.with_crypt(Arc::new(ChaChaCrypt::new([9u8; 32])));
        }

        let frame = codec.encode(&SecretKey::new(&key)).expect("Encode should not fail");
        let declared = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        prop_assert_eq!(declared + 3, frame.len());
        prop_assert_eq!(frame[2], 1);

        let decoded = codec.decode(&frame).expect("Frame should decode");
        let secret = decoded.downcast_ref::<SecretKey>().expect("Should be a SecretKey");
        prop_assert_eq!(&secret.key, &key);
    }
}

// Property: decoding arbitrary bytes never panics
proptest! {
    #[test]
    fn prop_decode_garbage_does_not_panic(frame in prop::collection::vec(any::<u8>(), 0..512)) {
        let codec = PacketCodec::new(registry());
        let _ = codec.decode(&frame);
    }
}

// Property: every compression kind round-trips, including empty input
proptest! {
    #[test]
    fn prop_compression_roundtrip(
        data in prop::collection::vec(any::<u8>(), 0..20000),
        kind in compression_kind(),
    ) {
        let stage = kind.stage();
        let compressed = stage.compress(&data).expect("Compression should not fail").into_owned();
        let decompressed = stage.decompress(&compressed).expect("Decompression should not fail");
        prop_assert_eq!(decompressed.as_ref(), &data[..]);
    }
}

// Property: the table agrees with a linear scan of its ranges
proptest! {
    #[test]
    fn prop_owner_matches_linear_scan(
        widths in prop::collection::vec(1u64..500, 1..8),
        gaps in prop::collection::vec(0u64..200, 8),
        probes in prop::collection::vec(0u64..6000, 1..64),
    ) {
        let mut map: HashMap<i32, Vec<OwnershipRange>> = HashMap::new();
        let mut start = 0;
        for (i, width) in widths.iter().enumerate() {
            start += gaps[i];
            let range = OwnershipRange::new(start, start + width - 1);
            map.entry((i % 3) as i32).or_default().push(range);
            start += width;
        }

        let table = ShardTable::build(&map).expect("Disjoint ranges should build");
        for key in probes {
            let expected = map
                .iter()
                .find(|(_, ranges)| ranges.iter().any(|r| r.contains(key)))
                .map(|(id, _)| *id)
                .unwrap_or(UNASSIGNED_SHARD);
            prop_assert_eq!(table.owner_of(key), expected);
        }
    }
}
