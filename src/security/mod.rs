//! # Security
//!
//! Session handoff between mesh nodes. Transport security lives in
//! [`crate::transport::tls`].

pub mod handoff;

pub use self::handoff::{HandoffClaims, HandoffRequest, HandoffSigner};
