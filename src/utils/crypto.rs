//! # Payload Encryption
//!
//! The outermost codec stage. [`Crypt`] defaults to the identity transform
//! (TLS already protects the link); [`ChaChaCrypt`] adds XChaCha20-Poly1305 on
//! top for deployments that want packet-level confidentiality independent of
//! the transport.
//!
//! ChaChaCrypt output layout: `[nonce(24)] [ciphertext + tag]`.

use std::borrow::Cow;
use std::fmt::Debug;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::Zeroize;

use crate::error::{ProtocolError, Result};

/// XChaCha20 nonce length in bytes
pub const NONCE_LEN: usize = 24;

/// Pluggable encryption stage. Defaults are the identity transform.
pub trait Crypt: Send + Sync + Debug + 'static {
    fn encrypt<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(data))
    }

    fn decrypt<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(data))
    }
}

/// Identity encryption
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCrypt;

impl Crypt for NoCrypt {}

/// XChaCha20-Poly1305 with a random nonce per packet
pub struct ChaChaCrypt {
    cipher: XChaCha20Poly1305,
}

impl ChaChaCrypt {
    /// Build the cipher and wipe the caller's key copy
    pub fn new(mut key: [u8; 32]) -> Self {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        Self { cipher }
    }

    /// Generate a random 24-byte nonce from the OS RNG
    pub fn generate_nonce() -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce).map_err(|_| ProtocolError::EncryptionFailure)?;
        Ok(nonce)
    }
}

impl Debug for ChaChaCrypt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChaChaCrypt")
    }
}

impl Crypt for ChaChaCrypt {
    fn encrypt<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        let mut nonce = Self::generate_nonce()?;
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), data)
            .map_err(|_| ProtocolError::EncryptionFailure)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        nonce.zeroize();
        Ok(Cow::Owned(out))
    }

    fn decrypt<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        if data.len() < NONCE_LEN {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map(Cow::Owned)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}
