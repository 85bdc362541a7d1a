// Identity — node addressing, contact routing records and local identifiers

mod contact;
mod keys;

pub use contact::{Contact, ContactKind, FLOOD_PATH_LEN};
pub use keys::{
    KeyError, KeyPrefix, PublicKey, CORRELATION_PREFIX_LEN, PUBLIC_KEY_LEN, SENDER_PREFIX_LEN,
};

/// Identifier of a paired companion device
pub type DeviceId = uuid::Uuid;
