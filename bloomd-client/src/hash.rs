//! # Key Pre-Hashing
//!
//! Purpose: Optionally replace each key with a fixed-width hex digest before
//! it is placed on the wire, bounding key length and keeping reserved
//! characters (spaces, line breaks) out of the command line.
//!
//! The hook is a pure per-key function; the protocol is unchanged.

use std::fmt;

use sha2::{Digest, Sha256};

/// Per-key transformation applied by a client configured to pre-hash keys.
///
/// Implementations must be deterministic: the same key always maps to the
/// same wire token, and the token must contain no whitespace.
pub trait KeyHasher: fmt::Debug + Send + Sync {
    /// Maps a caller key to the token sent to the server.
    fn hash_key(&self, key: &str) -> String;
}

/// SHA-256 digest rendered as 64 lowercase hex characters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sha256KeyHasher;

impl KeyHasher for Sha256KeyHasher {
    fn hash_key(&self, key: &str) -> String {
        to_hex(&Sha256::digest(key.as_bytes()))
    }
}

/// Sends keys unchanged. Keys must still be valid wire tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityHasher;

impl KeyHasher for IdentityHasher {
    fn hash_key(&self, key: &str) -> String {
        key.to_string()
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
