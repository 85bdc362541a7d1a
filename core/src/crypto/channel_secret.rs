// Channel secrets: 16-byte keys shared by every member of a channel
//
// Derivation: first 16 bytes of SHA-256(passphrase as UTF-8).
// An empty passphrase maps to the all-zero key rather than SHA-256("").
// The reserved public channel uses a fixed, well-known key.

use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Length of a channel secret
pub const CHANNEL_SECRET_LEN: usize = 16;

/// Well-known secret of the public channel (slot 0 on a factory device)
pub const PUBLIC_CHANNEL_SECRET: [u8; CHANNEL_SECRET_LEN] = [
    0x8b, 0x33, 0x87, 0xe9, 0xc5, 0xcd, 0xea, 0x6a, 0xc9, 0xe5, 0xed, 0xba, 0xa1, 0x15, 0xcd, 0x72,
];

/// Display name of the public channel
pub const PUBLIC_CHANNEL_NAME: &str = "Public";

/// Derive a channel secret from a passphrase
pub fn derive_channel_secret(passphrase: &str) -> [u8; CHANNEL_SECRET_LEN] {
    let mut secret = [0u8; CHANNEL_SECRET_LEN];
    if passphrase.is_empty() {
        return secret;
    }

    let mut digest = Sha256::digest(passphrase.as_bytes());
    secret.copy_from_slice(&digest[..CHANNEL_SECRET_LEN]);
    digest.as_mut_slice().zeroize();
    secret
}

/// Whether a secret is the public channel's key
pub fn is_public_secret(secret: &[u8; CHANNEL_SECRET_LEN]) -> bool {
    secret == &PUBLIC_CHANNEL_SECRET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_passphrase_is_zero_key() {
        assert_eq!(derive_channel_secret(""), [0u8; CHANNEL_SECRET_LEN]);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let first = derive_channel_secret("#hamradio");
        let second = derive_channel_secret("#hamradio");
        assert_eq!(first, second);
        assert_ne!(first, derive_channel_secret("#HamRadio"));
    }

    #[test]
    fn test_derivation_matches_sha256_prefix() {
        // SHA-256("abc") = ba7816bf 8f01cfea 414140de 5dae2223 ...
        let secret = derive_channel_secret("abc");
        assert_eq!(hex::encode(secret), "ba7816bf8f01cfea414140de5dae2223");
    }

    #[test]
    fn test_public_secret_is_not_derived() {
        assert!(is_public_secret(&PUBLIC_CHANNEL_SECRET));
        assert!(!is_public_secret(&derive_channel_secret(PUBLIC_CHANNEL_NAME)));
    }
}
