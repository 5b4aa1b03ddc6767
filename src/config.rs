//! # Configuration Management
//!
//! Centralized configuration for a mesh node: its own listener, the packet
//! codec, bridge peers, shard ownership, handoff security and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`MESH_PROTOCOL_*`)
//!
//! ## Example
//! ```toml
//! [server]
//! server_id = "lobby-1"
//! server_type = "lobby"
//! host = "0.0.0.0"
//! port = 7000
//! read_timeout = 10000
//!
//! [bridge.peers.game-1]
//! host = "10.0.0.12"
//! port = 7100
//! server_type = "game"
//! key_range = { start = 0, end = 9999 }
//!
//! [[shards]]
//! id = 0
//! ranges = [{ start = 0, end = 4999 }]
//! ```
//!
//! Durations are expressed in milliseconds.

use crate::error::{ProtocolError, Result};
use crate::server::shard::{ShardId, UNASSIGNED_SHARD};
use crate::transport::tls::{TlsClientConfig, TlsServerConfig};
use crate::utils::buffer_pool::DEFAULT_SCRATCH_SIZE;
use crate::utils::compression::CompressionKind;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Upper bound on a decompressed packet payload (1 MiB)
pub const MAX_UNCOMPRESSED_SIZE: usize = 1024 * 1024;

/// Default lifetime of a handoff token
pub const DEFAULT_HANDOFF_EXPIRY_SECONDS: u64 = 30;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MeshConfig {
    /// This node's listener and identity
    #[serde(default)]
    pub server: ServerConfig,

    /// Packet codec settings
    #[serde(default)]
    pub codec: CodecConfig,

    /// Server-to-server links
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// TLS material and handoff token settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Static ownership table for the shard registry
    #[serde(default)]
    pub shards: Vec<ShardConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MeshConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `MESH_PROTOCOL_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Apply `MESH_PROTOCOL_*` environment overrides in place
    pub fn apply_env(&mut self) {
        if let Ok(id) = std::env::var("MESH_PROTOCOL_SERVER_ID") {
            self.server.server_id = id;
        }

        if let Ok(host) = std::env::var("MESH_PROTOCOL_HOST") {
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("MESH_PROTOCOL_PORT") {
            if let Ok(val) = port.parse::<u16>() {
                self.server.port = val;
            }
        }

        if let Ok(host) = std::env::var("MESH_PROTOCOL_PUBLIC_HOST") {
            self.server.public_host = Some(host);
        }

        if let Ok(timeout) = std::env::var("MESH_PROTOCOL_READ_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                self.server.read_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(delay) = std::env::var("MESH_PROTOCOL_RECONNECT_DELAY_MS") {
            if let Ok(val) = delay.parse::<u64>() {
                self.bridge.reconnect_delay = Duration::from_millis(val);
            }
        }

        if let Ok(secret) = std::env::var("MESH_PROTOCOL_HANDOFF_SECRET") {
            self.security.handoff_secret = secret;
        }
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Shard table in the form the registry consumes
    pub fn shard_map(&self) -> HashMap<ShardId, Vec<OwnershipRange>> {
        self.shards
            .iter()
            .map(|s| (s.id, s.ranges.clone()))
            .collect()
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.codec.validate());
        errors.extend(self.bridge.validate(&self.server.server_id));
        errors.extend(self.security.validate());
        errors.extend(validate_shards(&self.shards));
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Role of a node in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    #[default]
    Lobby,
    Game,
}

/// Inclusive range of ownership keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct OwnershipRange {
    pub start: u64,
    pub end: u64,
}

impl OwnershipRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, key: u64) -> bool {
        self.start <= key && key <= self.end
    }

    pub fn overlaps(&self, other: &OwnershipRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }
}

impl From<std::ops::RangeInclusive<u64>> for OwnershipRange {
    fn from(range: std::ops::RangeInclusive<u64>) -> Self {
        Self::new(*range.start(), *range.end())
    }
}

impl std::fmt::Display for OwnershipRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// First pair of owners whose ranges overlap, if any
pub(crate) fn find_overlap<K: Clone>(
    entries: impl IntoIterator<Item = (OwnershipRange, K)>,
) -> Option<(K, OwnershipRange, K, OwnershipRange)> {
    let mut sorted: Vec<_> = entries.into_iter().collect();
    sorted.sort_by_key(|(range, _)| range.start);
    sorted.windows(2).find_map(|pair| {
        let (a, ka) = &pair[0];
        let (b, kb) = &pair[1];
        a.overlaps(b).then(|| (ka.clone(), *a, kb.clone(), *b))
    })
}

/// This node's listener settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unique identifier of this node within the mesh
    pub server_id: String,

    pub server_type: ServerType,

    /// Bind address
    pub host: String,

    pub port: u16,

    /// Address advertised to clients during a handoff
    #[serde(default)]
    pub public_host: Option<String>,

    #[serde(default)]
    pub public_port: Option<u16>,

    /// A connection with no inbound frame for this long is closed
    #[serde(with = "millis")]
    pub read_timeout: Duration,

    /// Bound on graceful shutdown
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,

    /// Keys owned by this node, if it owns any
    #[serde(default)]
    pub key_range: Option<OwnershipRange>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: String::from("node-1"),
            server_type: ServerType::Lobby,
            host: String::from("127.0.0.1"),
            port: 7000,
            public_host: None,
            public_port: None,
            read_timeout: timeout::DEFAULT_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            key_range: None,
        }
    }
}

impl ServerConfig {
    /// `host:port` to bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address clients should be redirected to
    pub fn public_address(&self) -> (String, u16) {
        (
            self.public_host.clone().unwrap_or_else(|| self.host.clone()),
            self.public_port.unwrap_or(self.port),
        )
    }

    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.server_id.is_empty() {
            errors.push("Server id cannot be empty".to_string());
        } else if self.server_id.contains('|') {
            errors.push(format!(
                "Server id '{}' cannot contain '|'",
                self.server_id
            ));
        }

        if self.host.is_empty() {
            errors.push("Server host cannot be empty".to_string());
        }

        if self.public_port == Some(0) {
            errors.push("Public port cannot be 0".to_string());
        }

        if self.read_timeout.as_millis() < 100 {
            errors.push("Read timeout too short (minimum: 100ms)".to_string());
        } else if self.read_timeout.as_secs() > 300 {
            errors.push("Read timeout too long (maximum: 300s)".to_string());
        }

        if self.shutdown_timeout.as_millis() < 100 {
            errors.push("Shutdown timeout too short (minimum: 100ms)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if let Some(range) = &self.key_range {
            if !range.is_valid() {
                errors.push(format!("Server key range {range} is empty (start > end)"));
            }
        }

        errors
    }
}

/// Packet codec settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Largest marshaled packet in bytes
    pub scratch_buffer_size: usize,

    /// Payload compression; must match on every endpoint
    pub compression: CompressionKind,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            scratch_buffer_size: DEFAULT_SCRATCH_SIZE,
            compression: CompressionKind::None,
        }
    }
}

impl CodecConfig {
    /// Validate codec configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.scratch_buffer_size < 64 {
            errors.push("Scratch buffer too small (minimum: 64 bytes)".to_string());
        } else if self.scratch_buffer_size > MAX_UNCOMPRESSED_SIZE {
            errors.push(format!(
                "Scratch buffer too large: {} bytes (maximum: {MAX_UNCOMPRESSED_SIZE})",
                self.scratch_buffer_size
            ));
        }

        errors
    }
}

/// A mesh peer this node links to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteServerConfig {
    pub host: String,
    pub port: u16,

    #[serde(default)]
    pub public_host: Option<String>,

    #[serde(default)]
    pub public_port: Option<u16>,

    #[serde(default)]
    pub server_type: ServerType,

    /// Keys routed to this peer
    #[serde(default)]
    pub key_range: Option<OwnershipRange>,
}

impl RemoteServerConfig {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            public_host: None,
            public_port: None,
            server_type: ServerType::Game,
            key_range: None,
        }
    }

    pub fn with_key_range(mut self, range: std::ops::RangeInclusive<u64>) -> Self {
        self.key_range = Some(range.into());
        self
    }

    pub fn with_server_type(mut self, server_type: ServerType) -> Self {
        self.server_type = server_type;
        self
    }

    /// Whether `key` falls in this peer's inclusive range
    pub fn owns_key(&self, key: u64) -> bool {
        self.key_range.is_some_and(|r| r.contains(key))
    }

    /// Address clients should be redirected to
    pub fn public_address(&self) -> (String, u16) {
        (
            self.public_host.clone().unwrap_or_else(|| self.host.clone()),
            self.public_port.unwrap_or(self.port),
        )
    }
}

/// Check a peer table for unusable entries and overlapping ranges
pub(crate) fn validate_peers(
    local_id: &str,
    peers: &BTreeMap<String, RemoteServerConfig>,
) -> Vec<String> {
    let mut errors = Vec::new();

    for (id, peer) in peers {
        if id.is_empty() {
            errors.push("Peer id cannot be empty".to_string());
        }
        if id == local_id {
            errors.push(format!("Peer '{id}' has the same id as this server"));
        }
        if peer.host.is_empty() {
            errors.push(format!("Peer '{id}' has an empty host"));
        }
        if peer.port == 0 {
            errors.push(format!("Peer '{id}' has port 0"));
        }
        if let Some(range) = &peer.key_range {
            if !range.is_valid() {
                errors.push(format!("Peer '{id}' key range {range} is empty (start > end)"));
            }
        }
    }

    let ranges = peers
        .iter()
        .filter_map(|(id, p)| p.key_range.map(|r| (r, id.clone())));
    if let Some((a, ra, b, rb)) = find_overlap(ranges) {
        errors.push(format!(
            "Peer key ranges overlap: '{a}' {ra} and '{b}' {rb}"
        ));
    }

    errors
}

/// Server-to-server link settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Delay before a failed or dropped link is redialed
    #[serde(with = "millis")]
    pub reconnect_delay: Duration,

    /// Bound on closing a link during shutdown
    #[serde(with = "millis")]
    pub close_timeout: Duration,

    /// Peers keyed by server id
    #[serde(default)]
    pub peers: BTreeMap<String, RemoteServerConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: timeout::RECONNECT_DELAY,
            close_timeout: timeout::SHUTDOWN_TIMEOUT,
            peers: BTreeMap::new(),
        }
    }
}

impl BridgeConfig {
    /// Validate bridge configuration
    pub fn validate(&self, local_id: &str) -> Vec<String> {
        let mut errors = Vec::new();

        if self.reconnect_delay.as_millis() < 10 {
            errors.push("Reconnect delay too short (minimum: 10ms)".to_string());
        } else if self.reconnect_delay.as_secs() > 60 {
            errors.push("Reconnect delay too long (maximum: 60s)".to_string());
        }

        if self.close_timeout.as_millis() < 100 {
            errors.push("Bridge close timeout too short (minimum: 100ms)".to_string());
        }

        errors.extend(validate_peers(local_id, &self.peers));
        errors
    }
}

/// TLS material and handoff token settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// PEM certificate chain served by this node
    #[serde(default)]
    pub cert_path: Option<String>,

    /// PKCS8 PEM private key for `cert_path`
    #[serde(default)]
    pub key_path: Option<String>,

    /// PEM certificate(s) trusted when dialing peers
    #[serde(default)]
    pub trusted_cert_path: Option<String>,

    /// Name presented in SNI and checked against the peer certificate
    pub tls_server_name: String,

    /// HMAC key for handoff tokens. Empty disables handoff.
    pub handoff_secret: String,

    pub handoff_expiry_seconds: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            trusted_cert_path: None,
            tls_server_name: String::from("localhost"),
            handoff_secret: String::new(),
            handoff_expiry_seconds: DEFAULT_HANDOFF_EXPIRY_SECONDS,
        }
    }
}

impl SecurityConfig {
    /// Server-side TLS settings, when a certificate and key are configured
    pub fn tls_server_config(&self) -> Option<TlsServerConfig> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Some(TlsServerConfig::new(cert, key)),
            _ => None,
        }
    }

    /// Client-side TLS settings, when a trusted certificate is configured
    pub fn tls_client_config(&self) -> Option<TlsClientConfig> {
        self.trusted_cert_path
            .as_ref()
            .map(|path| TlsClientConfig::new(self.tls_server_name.clone(), path.clone()))
    }

    /// Validate security configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.cert_path.is_some() != self.key_path.is_some() {
            errors.push("cert_path and key_path must be set together".to_string());
        }

        if self.tls_server_name.is_empty() {
            errors.push("TLS server name cannot be empty".to_string());
        }

        if !self.handoff_secret.is_empty() && self.handoff_secret.len() < 16 {
            errors.push("Handoff secret too short (minimum: 16 bytes)".to_string());
        }

        if self.handoff_expiry_seconds == 0 {
            errors.push("Handoff expiry must be greater than 0".to_string());
        } else if self.handoff_expiry_seconds > 3600 {
            errors.push("Handoff expiry too long (maximum: 1 hour)".to_string());
        }

        errors
    }
}

/// One shard and the keys it owns
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ShardConfig {
    pub id: ShardId,

    #[serde(default)]
    pub ranges: Vec<OwnershipRange>,
}

/// Check a shard table: ids unique and not the sentinel, ranges non-empty and
/// disjoint
pub(crate) fn validate_shard_map(map: &HashMap<ShardId, Vec<OwnershipRange>>) -> Vec<String> {
    let mut errors = Vec::new();

    let mut ids: Vec<_> = map.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        if id == UNASSIGNED_SHARD {
            errors.push(format!("Shard id {UNASSIGNED_SHARD} is reserved for unassigned connections"));
        }
        for range in &map[&id] {
            if !range.is_valid() {
                errors.push(format!("Shard {id} range {range} is empty (start > end)"));
            }
        }
    }

    let ranges = map
        .iter()
        .flat_map(|(id, ranges)| ranges.iter().map(move |r| (*r, *id)));
    if let Some((a, ra, b, rb)) = find_overlap(ranges) {
        errors.push(format!("Shard ranges overlap: shard {a} {ra} and shard {b} {rb}"));
    }

    errors
}

fn validate_shards(shards: &[ShardConfig]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut map = HashMap::new();
    for shard in shards {
        if map.insert(shard.id, shard.ranges.clone()).is_some() {
            errors.push(format!("Shard {} is listed more than once", shard.id));
        }
    }
    errors.extend(validate_shard_map(&map));
    errors
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "level_name")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("mesh-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Problems that would stop the subscriber from installing.
    ///
    /// Console and file output may both be off; events are then discarded.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.trim().is_empty() {
            errors.push("Logging app name cannot be empty".to_string());
        }

        match (self.log_to_file, self.log_file_path.as_deref()) {
            (true, None) => {
                errors.push("Log file path required when log_to_file is enabled".to_string());
            }
            (true, Some(path)) => {
                let dir = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty());
                if let Some(dir) = dir.filter(|d| !d.is_dir()) {
                    errors.push(format!("Log directory {} does not exist", dir.display()));
                }
            }
            (false, _) => {}
        }

        errors
    }
}

/// Durations as whole milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `tracing::Level` as its lowercase name
mod level_name {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| D::Error::custom(format!("unknown log level '{name}'")))
    }
}
