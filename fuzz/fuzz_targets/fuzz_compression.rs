#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_protocol::utils::compression::CompressionKind;

fuzz_target!(|data: &[u8]| {
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        let stage = kind.stage();
        if let Ok(compressed) = stage.compress(data) {
            let restored = stage.decompress(&compressed).expect("own output must decompress");
            assert_eq!(&*restored, data);
        }

        // Hostile input must fail cleanly within the size limit
        let _ = stage.decompress(data);
    }
});
