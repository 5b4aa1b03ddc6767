//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use mesh_protocol::config::{
    LoggingConfig, MeshConfig, OwnershipRange, RemoteServerConfig, ServerType, ShardConfig,
};
use std::time::Duration;

#[test]
fn test_default_config_validates() {
    let config = MeshConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_empty_server_id() {
    let config = MeshConfig::default_with_overrides(|c| c.server.server_id = String::new());
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Server id cannot be empty")));
}

#[test]
fn test_read_timeout_bounds() {
    let short = MeshConfig::default_with_overrides(|c| {
        c.server.read_timeout = Duration::from_millis(50)
    });
    assert!(short
        .validate()
        .iter()
        .any(|e| e.contains("Read timeout too short")));

    let long = MeshConfig::default_with_overrides(|c| {
        c.server.read_timeout = Duration::from_secs(600)
    });
    assert!(long
        .validate()
        .iter()
        .any(|e| e.contains("Read timeout too long")));
}

#[test]
fn test_overlapping_shards_rejected() {
    let config = MeshConfig::default_with_overrides(|c| {
        c.shards = vec![
            ShardConfig {
                id: 0,
                ranges: vec![OwnershipRange::new(0, 999)],
            },
            ShardConfig {
                id: 1,
                ranges: vec![OwnershipRange::new(999, 1999)],
            },
        ];
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Shard ranges overlap")));
}

#[test]
fn test_duplicate_and_reserved_shard_ids() {
    let config = MeshConfig::default_with_overrides(|c| {
        c.shards = vec![
            ShardConfig {
                id: 3,
                ranges: vec![OwnershipRange::new(0, 9)],
            },
            ShardConfig {
                id: 3,
                ranges: vec![OwnershipRange::new(10, 19)],
            },
            ShardConfig {
                id: -1,
                ranges: vec![],
            },
        ];
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("listed more than once")));
    assert!(errors.iter().any(|e| e.contains("reserved")));
}

#[test]
fn test_peer_validation() {
    let config = MeshConfig::default_with_overrides(|c| {
        c.bridge.peers.insert(
            "node-1".to_string(),
            RemoteServerConfig::new("10.0.0.2", 7001),
        );
        c.bridge
            .peers
            .insert("game-a".to_string(), RemoteServerConfig::new("", 7002));
        c.bridge.peers.insert(
            "game-b".to_string(),
            RemoteServerConfig::new("10.0.0.3", 7003).with_key_range(0..=500),
        );
        c.bridge.peers.insert(
            "game-c".to_string(),
            RemoteServerConfig::new("10.0.0.4", 7004).with_key_range(500..=900),
        );
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("same id as this server")));
    assert!(errors.iter().any(|e| e.contains("empty host")));
    assert!(errors.iter().any(|e| e.contains("Peer key ranges overlap")));
}

#[test]
fn test_handoff_secret_length() {
    let weak = MeshConfig::default_with_overrides(|c| {
        c.security.handoff_secret = "short".to_string()
    });
    assert!(weak
        .validate()
        .iter()
        .any(|e| e.contains("Handoff secret too short")));

    let strong = MeshConfig::default_with_overrides(|c| {
        c.security.handoff_secret = "0123456789abcdef0123".to_string()
    });
    assert!(strong.validate().is_empty());
}

#[test]
fn test_half_configured_tls_rejected() {
    let config = MeshConfig::default_with_overrides(|c| {
        c.security.cert_path = Some("cert.pem".to_string())
    });
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("cert_path and key_path")));
    assert!(config.security.tls_server_config().is_none());
}

#[test]
fn test_validate_strict_collects_errors() {
    let config = MeshConfig::default_with_overrides(|c| {
        c.server.server_id = String::new();
        c.bridge.reconnect_delay = Duration::from_millis(1);
    });
    let err = config.validate_strict().unwrap_err().to_string();
    assert!(err.contains("Server id cannot be empty"));
    assert!(err.contains("Reconnect delay too short"));
}

#[test]
fn test_partial_toml_uses_defaults() {
    let config = MeshConfig::from_toml(
        r#"
        [server]
        server_id = "lobby-1"
        port = 7100
        read_timeout = 5000

        [bridge.peers.game-1]
        host = "10.0.0.5"
        port = 7200
        server_type = "game"
        key_range = { start = 0, end = 4999 }

        [[shards]]
        id = 0
        ranges = [{ start = 0, end = 999 }, { start = 2000, end = 2999 }]

        [[shards]]
        id = 1
        ranges = [{ start = 1000, end = 1999 }]
        "#,
    )
    .unwrap();

    assert_eq!(config.server.server_id, "lobby-1");
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.read_timeout, Duration::from_secs(5));
    assert_eq!(config.server.server_type, ServerType::Lobby);

    let peer = &config.bridge.peers["game-1"];
    assert_eq!(peer.server_type, ServerType::Game);
    assert!(peer.owns_key(4999));
    assert!(!peer.owns_key(5000));

    let shards = config.shard_map();
    assert_eq!(shards[&0].len(), 2);
    assert!(config.validate().is_empty());
}

#[test]
fn test_malformed_toml_is_config_error() {
    let result = MeshConfig::from_toml("[server\nport = ");
    assert!(matches!(
        result,
        Err(mesh_protocol::ProtocolError::ConfigError(_))
    ));
}

#[test]
fn test_example_config_parses_back() {
    let example = MeshConfig::example_config();
    let parsed = MeshConfig::from_toml(&example).unwrap();
    assert_eq!(parsed.server.port, MeshConfig::default().server.port);
}

#[test]
fn test_save_and_reload_from_file() {
    let path = std::env::temp_dir().join(format!("mesh-protocol-{}-config.toml", std::process::id()));
    let config = MeshConfig::default_with_overrides(|c| {
        c.server.server_id = "game-7".to_string();
        c.server.port = 7107;
        c.shards.push(ShardConfig {
            id: 3,
            ranges: vec![OwnershipRange::new(10, 20)],
        });
    });

    config.save_to_file(&path).unwrap();
    let loaded = MeshConfig::from_file(&path).unwrap();
    let _ = std::fs::remove_file(&path);

    assert_eq!(loaded.server.server_id, "game-7");
    assert_eq!(loaded.server.port, 7107);
    assert_eq!(loaded.shard_map()[&3], vec![OwnershipRange::new(10, 20)]);
    assert!(MeshConfig::from_file("/nonexistent/mesh.toml").is_err());
}

#[test]
fn test_environment_overrides() {
    std::env::set_var("MESH_PROTOCOL_SERVER_ID", "env-node");
    std::env::set_var("MESH_PROTOCOL_READ_TIMEOUT_MS", "2500");
    std::env::set_var("MESH_PROTOCOL_PORT", "not-a-port");

    let config = MeshConfig::from_env().unwrap();
    assert_eq!(config.server.server_id, "env-node");
    assert_eq!(config.server.read_timeout, Duration::from_millis(2500));
    // Unparseable values keep the default
    assert_eq!(config.server.port, MeshConfig::default().server.port);

    std::env::remove_var("MESH_PROTOCOL_SERVER_ID");
    std::env::remove_var("MESH_PROTOCOL_READ_TIMEOUT_MS");
    std::env::remove_var("MESH_PROTOCOL_PORT");
}

#[test]
fn test_logging_outputs() {
    let silent = LoggingConfig {
        log_to_console: false,
        log_to_file: false,
        ..LoggingConfig::default()
    };
    assert!(silent.validate().is_empty());

    let no_path = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };
    assert_eq!(no_path.validate().len(), 1);

    let missing_dir = LoggingConfig {
        log_to_file: true,
        log_file_path: Some("/nonexistent/mesh/server.log".to_string()),
        ..LoggingConfig::default()
    };
    assert!(missing_dir.validate()[0].contains("/nonexistent/mesh"));

    let level = MeshConfig::from_toml("[logging]\nlog_level = \"warn\"\n");
    assert!(level.is_ok());
    assert!(MeshConfig::from_toml("[logging]\nlog_level = \"loud\"\n").is_err());
}
