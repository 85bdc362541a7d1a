// Cryptography module — channel key derivation

pub mod channel_secret;

pub use channel_secret::{
    derive_channel_secret, is_public_secret, CHANNEL_SECRET_LEN, PUBLIC_CHANNEL_NAME,
    PUBLIC_CHANNEL_SECRET,
};
