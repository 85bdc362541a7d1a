// Public key addressing — full keys and the truncated prefixes the firmware correlates on

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Length of a node public key on the wire
pub const PUBLIC_KEY_LEN: usize = 32;

/// Prefix length used for login, CLI and status correlation
pub const CORRELATION_PREFIX_LEN: usize = 6;

/// Prefix length used to attribute incoming messages to a sender
pub const SENDER_PREFIX_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),
}

/// A 32-byte mesh node public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a key from a byte slice of exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let array: [u8; PUBLIC_KEY_LEN] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// Parse a key from its 64-character hex form
    pub fn from_hex(encoded: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(encoded).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// 6-byte prefix used by login, CLI and status responses
    pub fn prefix(&self) -> KeyPrefix {
        let mut prefix = [0u8; CORRELATION_PREFIX_LEN];
        prefix.copy_from_slice(&self.0[..CORRELATION_PREFIX_LEN]);
        KeyPrefix(prefix)
    }

    /// Whether this key starts with the given (possibly shorter) prefix
    pub fn matches_prefix(&self, prefix: &[u8]) -> bool {
        !prefix.is_empty() && prefix.len() <= PUBLIC_KEY_LEN && self.0.starts_with(prefix)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A 6-byte public key prefix.
///
/// Collisions are possible and are not resolved at this layer: the first
/// pending entry registered under a prefix receives the response.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPrefix([u8; CORRELATION_PREFIX_LEN]);

impl KeyPrefix {
    pub const fn from_bytes(bytes: [u8; CORRELATION_PREFIX_LEN]) -> Self {
        Self(bytes)
    }

    /// Take the first six bytes of a longer slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() < CORRELATION_PREFIX_LEN {
            return Err(KeyError::InvalidLength {
                expected: CORRELATION_PREFIX_LEN,
                actual: bytes.len(),
            });
        }
        let mut prefix = [0u8; CORRELATION_PREFIX_LEN];
        prefix.copy_from_slice(&bytes[..CORRELATION_PREFIX_LEN]);
        Ok(Self(prefix))
    }

    pub fn as_bytes(&self) -> &[u8; CORRELATION_PREFIX_LEN] {
        &self.0
    }

    /// The shorter 4-byte form used for sender attribution
    pub fn sender_prefix(&self) -> &[u8] {
        &self.0[..SENDER_PREFIX_LEN]
    }
}

impl fmt::Debug for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPrefix({})", hex::encode(self.0))
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> PublicKey {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        PublicKey::from_bytes(bytes)
    }

    #[test]
    fn test_prefix_is_first_six_bytes() {
        let key = sample_key();
        assert_eq!(key.prefix().as_bytes(), &[0, 1, 2, 3, 4, 5]);
        assert_eq!(key.prefix().sender_prefix(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_hex_parsing() {
        let key = sample_key();
        let parsed = PublicKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed, key);

        assert!(matches!(
            PublicKey::from_hex("0011"),
            Err(KeyError::InvalidLength { expected: 32, actual: 2 })
        ));
        assert!(matches!(PublicKey::from_hex("zz"), Err(KeyError::InvalidHex(_))));
    }

    #[test]
    fn test_matches_prefix() {
        let key = sample_key();
        assert!(key.matches_prefix(&[0, 1, 2, 3]));
        assert!(!key.matches_prefix(&[1, 2, 3, 4]));
        assert!(!key.matches_prefix(&[]));
    }

    #[test]
    fn test_short_prefix_rejected() {
        assert!(KeyPrefix::from_slice(&[1, 2, 3]).is_err());
        assert!(KeyPrefix::from_slice(&[1, 2, 3, 4, 5, 6, 7]).is_ok());
    }
}
