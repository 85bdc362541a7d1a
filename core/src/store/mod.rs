// Store module — persistence contract for messages, contacts, sessions and channels

pub mod backend;
pub mod kv;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use kv::KvStore;

use crate::channels::ChannelRecord;
use crate::identity::{Contact, DeviceId, PublicKey};
use crate::message::{IncomingMessage, MessageId, OutboundMessage};
use crate::session::{RemoteSession, SessionId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Record not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Record-level persistence used by every component.
///
/// Calls are synchronous and short; implementations must make each
/// `update_*` an atomic read-modify-write with respect to other writers.
pub trait Persistence: Send + Sync {
    // Outbound messages
    fn save_message(&self, message: &OutboundMessage) -> Result<(), StoreError>;
    fn get_message(&self, id: &MessageId) -> Result<Option<OutboundMessage>, StoreError>;
    fn update_message(
        &self,
        id: &MessageId,
        apply: &mut dyn FnMut(&mut OutboundMessage),
    ) -> Result<OutboundMessage, StoreError>;
    fn messages_for_device(&self, device_id: &DeviceId)
        -> Result<Vec<OutboundMessage>, StoreError>;

    // Received traffic
    /// Persist a received message; `false` when its dedup key was already seen
    fn record_incoming(&self, message: &IncomingMessage) -> Result<bool, StoreError>;
    fn incoming_messages(&self, device_id: &DeviceId) -> Result<Vec<IncomingMessage>, StoreError>;

    // Contacts
    fn save_contact(&self, contact: &Contact) -> Result<(), StoreError>;
    fn get_contact(
        &self,
        device_id: &DeviceId,
        key: &PublicKey,
    ) -> Result<Option<Contact>, StoreError>;
    /// First contact whose key starts with `prefix`
    fn contact_by_prefix(
        &self,
        device_id: &DeviceId,
        prefix: &[u8],
    ) -> Result<Option<Contact>, StoreError>;

    // Remote sessions
    fn save_session(&self, session: &RemoteSession) -> Result<(), StoreError>;
    fn get_session(&self, id: &SessionId) -> Result<Option<RemoteSession>, StoreError>;
    fn sessions_for_key(
        &self,
        device_id: &DeviceId,
        key: &PublicKey,
    ) -> Result<Vec<RemoteSession>, StoreError>;
    fn sessions(&self, device_id: &DeviceId) -> Result<Vec<RemoteSession>, StoreError>;
    fn update_session(
        &self,
        id: &SessionId,
        apply: &mut dyn FnMut(&mut RemoteSession),
    ) -> Result<RemoteSession, StoreError>;
    fn delete_session(&self, id: &SessionId) -> Result<(), StoreError>;

    // Channels
    fn save_channel(&self, channel: &ChannelRecord) -> Result<(), StoreError>;
    fn get_channel(&self, device_id: &DeviceId, index: u8)
        -> Result<Option<ChannelRecord>, StoreError>;
    fn channels(&self, device_id: &DeviceId) -> Result<Vec<ChannelRecord>, StoreError>;
    fn delete_channel(&self, device_id: &DeviceId, index: u8) -> Result<(), StoreError>;
}
