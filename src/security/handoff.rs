//! # Handoff Tokens
//!
//! Signed, short-lived tokens that let a client move from one node to another
//! without re-authenticating. The issuing node signs the claims with a secret
//! shared across the mesh; the receiving node validates the signature and the
//! expiry before admitting the client.
//!
//! ## Format
//! ```text
//! base64url(subject|username|from|to|key|expires_at_ms|nonce) "." base64url(hmac_sha256)
//! ```
//! Both parts are unpadded. The signature covers the encoded payload.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::config::SecurityConfig;
use crate::error::constants::{
    ERR_TOKEN_EMPTY, ERR_TOKEN_EXPIRED, ERR_TOKEN_FIELD, ERR_TOKEN_FORMAT, ERR_TOKEN_SIGNATURE,
};
use crate::error::{ProtocolError, Result};
use crate::utils::time::current_timestamp_millis;

type HmacSha256 = Hmac<Sha256>;

const FIELD_DELIMITER: char = '|';
const SIGNATURE_DELIMITER: char = '.';
const FIELD_COUNT: usize = 7;

/// Who is moving where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRequest {
    pub subject_id: u64,
    pub username: String,
    pub from_server: String,
    pub to_server: String,
    /// Ownership key that selected the destination
    pub ownership_key: u64,
}

/// Validated token contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffClaims {
    pub subject_id: u64,
    pub username: String,
    pub from_server: String,
    pub to_server: String,
    pub ownership_key: u64,
    /// Absolute expiry, milliseconds since the Unix epoch
    pub expires_at_millis: u64,
    pub nonce: String,
}

/// Issue a token for `request`, valid for `expiry_seconds` from now
pub fn generate(request: &HandoffRequest, secret: &[u8], expiry_seconds: u64) -> Result<String> {
    generate_at(request, secret, expiry_seconds, current_timestamp_millis()?)
}

/// [`generate`] against an explicit clock
pub fn generate_at(
    request: &HandoffRequest,
    secret: &[u8],
    expiry_seconds: u64,
    now_millis: u64,
) -> Result<String> {
    for field in [&request.username, &request.from_server, &request.to_server] {
        if field.contains(FIELD_DELIMITER) {
            return Err(ProtocolError::TokenRejected(ERR_TOKEN_FIELD));
        }
    }

    let expires_at = now_millis.saturating_add(expiry_seconds.saturating_mul(1000));
    let nonce = format!("{:032x}", rand::random::<u128>());
    let payload = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        request.subject_id,
        request.username,
        request.from_server,
        request.to_server,
        request.ownership_key,
        expires_at,
        nonce
    );

    let encoded = URL_SAFE_NO_PAD.encode(payload.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(sign(secret, &encoded)?.finalize().into_bytes());
    Ok(format!("{encoded}{SIGNATURE_DELIMITER}{signature}"))
}

/// Check a token's signature and expiry
pub fn validate(token: &str, secret: &[u8]) -> Result<HandoffClaims> {
    validate_at(token, secret, current_timestamp_millis()?)
}

/// [`validate`] against an explicit clock
pub fn validate_at(token: &str, secret: &[u8], now_millis: u64) -> Result<HandoffClaims> {
    if token.is_empty() {
        return Err(ProtocolError::TokenRejected(ERR_TOKEN_EMPTY));
    }

    let (encoded, signature) = token
        .rsplit_once(SIGNATURE_DELIMITER)
        .filter(|(payload, _)| !payload.is_empty())
        .ok_or(ProtocolError::TokenRejected(ERR_TOKEN_FORMAT))?;

    let provided = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| ProtocolError::TokenRejected(ERR_TOKEN_SIGNATURE))?;
    sign(secret, encoded)?
        .verify_slice(&provided)
        .map_err(|_| ProtocolError::TokenRejected(ERR_TOKEN_SIGNATURE))?;

    let payload = URL_SAFE_NO_PAD
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(ProtocolError::TokenRejected(ERR_TOKEN_FORMAT))?;

    let claims = parse_claims(&payload).ok_or(ProtocolError::TokenRejected(ERR_TOKEN_FORMAT))?;
    if now_millis > claims.expires_at_millis {
        return Err(ProtocolError::TokenRejected(ERR_TOKEN_EXPIRED));
    }
    Ok(claims)
}

fn sign(secret: &[u8], encoded_payload: &str) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| ProtocolError::SecurityError(format!("Invalid HMAC key: {e}")))?;
    mac.update(encoded_payload.as_bytes());
    Ok(mac)
}

fn parse_claims(payload: &str) -> Option<HandoffClaims> {
    let parts: Vec<&str> = payload.split(FIELD_DELIMITER).collect();
    if parts.len() != FIELD_COUNT {
        return None;
    }
    Some(HandoffClaims {
        subject_id: parts[0].parse().ok()?,
        username: parts[1].to_string(),
        from_server: parts[2].to_string(),
        to_server: parts[3].to_string(),
        ownership_key: parts[4].parse().ok()?,
        expires_at_millis: parts[5].parse().ok()?,
        nonce: parts[6].to_string(),
    })
}

/// Holds the mesh secret and token lifetime for one node
pub struct HandoffSigner {
    secret: Zeroizing<Vec<u8>>,
    expiry: Duration,
}

impl HandoffSigner {
    pub fn new(secret: impl Into<Vec<u8>>, expiry: Duration) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            expiry,
        }
    }

    /// Fails when no handoff secret is configured
    pub fn from_config(config: &SecurityConfig) -> Result<Self> {
        if config.handoff_secret.is_empty() {
            return Err(ProtocolError::ConfigError(
                "Handoff secret is not configured".to_string(),
            ));
        }
        Ok(Self::new(
            config.handoff_secret.as_bytes(),
            Duration::from_secs(config.handoff_expiry_seconds),
        ))
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn issue(&self, request: &HandoffRequest) -> Result<String> {
        generate(request, &self.secret, self.expiry.as_secs())
    }

    pub fn verify(&self, token: &str) -> Result<HandoffClaims> {
        validate(token, &self.secret)
    }
}

impl std::fmt::Debug for HandoffSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffSigner")
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}
