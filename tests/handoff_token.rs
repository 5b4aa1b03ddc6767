//! Handoff tokens issued by one node and checked by another

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use mesh_protocol::config::SecurityConfig;
use mesh_protocol::security::handoff::{self, HandoffRequest, HandoffSigner};
use mesh_protocol::ProtocolError;

const SECRET: &[u8] = b"0123456789abcdef-mesh";

fn request() -> HandoffRequest {
    HandoffRequest {
        subject_id: 7,
        username: "bob".to_string(),
        from_server: "lobby-1".to_string(),
        to_server: "game-3".to_string(),
        ownership_key: 31_337,
    }
}

#[test]
fn fresh_token_carries_issued_claims() {
    let token = handoff::generate(&request(), SECRET, 30).unwrap();
    let claims = handoff::validate(&token, SECRET).unwrap();
    assert_eq!(claims.subject_id, 7);
    assert_eq!(claims.username, "bob");
    assert_eq!(claims.from_server, "lobby-1");
    assert_eq!(claims.to_server, "game-3");
    assert_eq!(claims.ownership_key, 31_337);
}

#[test]
fn token_expires() {
    let token = handoff::generate(&request(), SECRET, 1).unwrap();
    std::thread::sleep(Duration::from_secs(2));
    assert!(matches!(
        handoff::validate(&token, SECRET),
        Err(ProtocolError::TokenRejected(_))
    ));
}

#[test]
fn thirty_second_window() {
    let issued_at = 1_700_000_000_000;
    let token = handoff::generate_at(&request(), SECRET, 30, issued_at).unwrap();
    assert!(handoff::validate_at(&token, SECRET, issued_at + 29_999).is_ok());
    assert!(handoff::validate_at(&token, SECRET, issued_at + 30_001).is_err());
}

#[test]
fn mismatched_secret_and_tampering_rejected() {
    let token = handoff::generate(&request(), SECRET, 30).unwrap();
    assert!(handoff::validate(&token, b"some-other-secret-value").is_err());

    // Flip one character of the payload
    let mut bytes = token.into_bytes();
    bytes[0] = if bytes[0] == b'A' { b'B' } else { b'A' };
    let tampered = String::from_utf8(bytes).unwrap();
    assert!(handoff::validate(&tampered, SECRET).is_err());

    assert!(handoff::validate("no-separator", SECRET).is_err());
    assert!(handoff::validate("", SECRET).is_err());
}

#[test]
fn nonces_differ_between_tokens() {
    let a = handoff::generate(&request(), SECRET, 30).unwrap();
    let b = handoff::generate(&request(), SECRET, 30).unwrap();
    assert_ne!(a, b);
    let na = handoff::validate(&a, SECRET).unwrap().nonce;
    let nb = handoff::validate(&b, SECRET).unwrap().nonce;
    assert_ne!(na, nb);
}

#[test]
fn signer_from_config_crosses_nodes() {
    let config = SecurityConfig {
        handoff_secret: "shared-across-the-mesh".to_string(),
        handoff_expiry_seconds: 10,
        ..SecurityConfig::default()
    };
    let lobby = HandoffSigner::from_config(&config).unwrap();
    let game = HandoffSigner::from_config(&config).unwrap();
    assert_eq!(lobby.expiry(), Duration::from_secs(10));

    let token = lobby.issue(&request()).unwrap();
    assert_eq!(game.verify(&token).unwrap().to_server, "game-3");
}
