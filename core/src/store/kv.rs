// KvStore — serde_json records over a StorageBackend
//
// Key layout:
//   msg_<message id>                      outbound messages
//   in_<dedup key>                        received messages (dedup key leads with the device id)
//   contact_<device>_<key hex>            contact routing records
//   session_<session id>                  remote sessions
//   channel_<device>_<slot, 3 digits>     channel slots

use super::{Persistence, StorageBackend, StoreError};
use crate::channels::ChannelRecord;
use crate::identity::{Contact, DeviceId, PublicKey};
use crate::message::{IncomingMessage, MessageId, OutboundMessage};
use crate::session::{RemoteSession, SessionId};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

const MESSAGE_PREFIX: &str = "msg_";
const INCOMING_PREFIX: &str = "in_";
const CONTACT_PREFIX: &str = "contact_";
const SESSION_PREFIX: &str = "session_";
const CHANNEL_PREFIX: &str = "channel_";

/// Persistence adapter over any key-value backend
pub struct KvStore {
    backend: Arc<dyn StorageBackend>,
    /// Serialises read-modify-write cycles
    write_lock: Mutex<()>,
}

impl KvStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    /// Store backed by process memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(super::MemoryStorage::new()))
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush()
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.backend.put(key.as_bytes(), &bytes)
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.backend.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decode every record under a prefix, skipping entries that fail to parse
    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
        let mut records = Vec::new();
        for (key, value) in self.backend.scan_prefix(prefix.as_bytes())? {
            match serde_json::from_slice(&value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping unreadable record {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(records)
    }

    fn update<T, F>(&self, key: &str, apply: F) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let _guard = self.write_lock.lock();
        let mut record: T = self
            .load(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        apply(&mut record);
        self.put(key, &record)?;
        Ok(record)
    }
}

fn message_key(id: &MessageId) -> String {
    format!("{}{}", MESSAGE_PREFIX, id)
}

fn contact_key(device_id: &DeviceId, key: &PublicKey) -> String {
    format!("{}{}_{}", CONTACT_PREFIX, device_id, key.to_hex())
}

fn session_key(id: &SessionId) -> String {
    format!("{}{}", SESSION_PREFIX, id)
}

fn channel_key(device_id: &DeviceId, index: u8) -> String {
    format!("{}{}_{:03}", CHANNEL_PREFIX, device_id, index)
}

impl Persistence for KvStore {
    fn save_message(&self, message: &OutboundMessage) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.put(&message_key(&message.id), message)
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<OutboundMessage>, StoreError> {
        self.load(&message_key(id))
    }

    fn update_message(
        &self,
        id: &MessageId,
        apply: &mut dyn FnMut(&mut OutboundMessage),
    ) -> Result<OutboundMessage, StoreError> {
        self.update(&message_key(id), |m: &mut OutboundMessage| apply(m))
    }

    fn messages_for_device(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<OutboundMessage>, StoreError> {
        let mut messages: Vec<OutboundMessage> = self
            .scan::<OutboundMessage>(MESSAGE_PREFIX)?
            .into_iter()
            .filter(|m| &m.device_id == device_id)
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    fn record_incoming(&self, message: &IncomingMessage) -> Result<bool, StoreError> {
        let key = format!("{}{}", INCOMING_PREFIX, message.dedup_key());
        let _guard = self.write_lock.lock();
        if self.backend.get(key.as_bytes())?.is_some() {
            return Ok(false);
        }
        self.put(&key, message)?;
        Ok(true)
    }

    fn incoming_messages(&self, device_id: &DeviceId) -> Result<Vec<IncomingMessage>, StoreError> {
        let mut messages: Vec<IncomingMessage> =
            self.scan(&format!("{}{}:", INCOMING_PREFIX, device_id))?;
        messages.sort_by_key(|m| (m.received_at, m.sender_timestamp));
        Ok(messages)
    }

    fn save_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        self.put(&contact_key(&contact.device_id, &contact.public_key), contact)
    }

    fn get_contact(
        &self,
        device_id: &DeviceId,
        key: &PublicKey,
    ) -> Result<Option<Contact>, StoreError> {
        self.load(&contact_key(device_id, key))
    }

    fn contact_by_prefix(
        &self,
        device_id: &DeviceId,
        prefix: &[u8],
    ) -> Result<Option<Contact>, StoreError> {
        // Hex keys sort like the raw bytes, so the scan stays narrow
        let scan_prefix = format!("{}{}_{}", CONTACT_PREFIX, device_id, hex::encode(prefix));
        Ok(self
            .scan::<Contact>(&scan_prefix)?
            .into_iter()
            .find(|c| c.public_key.matches_prefix(prefix)))
    }

    fn save_session(&self, session: &RemoteSession) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.put(&session_key(&session.id), session)
    }

    fn get_session(&self, id: &SessionId) -> Result<Option<RemoteSession>, StoreError> {
        self.load(&session_key(id))
    }

    fn sessions_for_key(
        &self,
        device_id: &DeviceId,
        key: &PublicKey,
    ) -> Result<Vec<RemoteSession>, StoreError> {
        Ok(self
            .sessions(device_id)?
            .into_iter()
            .filter(|s| &s.public_key == key)
            .collect())
    }

    fn sessions(&self, device_id: &DeviceId) -> Result<Vec<RemoteSession>, StoreError> {
        let mut sessions: Vec<RemoteSession> = self
            .scan::<RemoteSession>(SESSION_PREFIX)?
            .into_iter()
            .filter(|s| &s.device_id == device_id)
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    fn update_session(
        &self,
        id: &SessionId,
        apply: &mut dyn FnMut(&mut RemoteSession),
    ) -> Result<RemoteSession, StoreError> {
        self.update(&session_key(id), |s: &mut RemoteSession| apply(s))
    }

    fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.backend.remove(session_key(id).as_bytes())
    }

    fn save_channel(&self, channel: &ChannelRecord) -> Result<(), StoreError> {
        self.put(&channel_key(&channel.device_id, channel.index), channel)
    }

    fn get_channel(
        &self,
        device_id: &DeviceId,
        index: u8,
    ) -> Result<Option<ChannelRecord>, StoreError> {
        self.load(&channel_key(device_id, index))
    }

    fn channels(&self, device_id: &DeviceId) -> Result<Vec<ChannelRecord>, StoreError> {
        self.scan(&format!("{}{}_", CHANNEL_PREFIX, device_id))
    }

    fn delete_channel(&self, device_id: &DeviceId, index: u8) -> Result<(), StoreError> {
        self.backend.remove(channel_key(device_id, index).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ContactKind;
    use crate::message::{MessageSource, MessageStatus};
    use crate::session::SessionRole;

    fn device() -> DeviceId {
        uuid::Uuid::new_v4()
    }

    #[test]
    fn test_update_message_is_applied_and_persisted() {
        let store = KvStore::in_memory();
        let msg = OutboundMessage::direct(device(), PublicKey::from_bytes([1u8; 32]), "hi");
        store.save_message(&msg).unwrap();

        let updated = store
            .update_message(&msg.id, &mut |m| m.status = MessageStatus::Sent)
            .unwrap();
        assert_eq!(updated.status, MessageStatus::Sent);
        assert_eq!(
            store.get_message(&msg.id).unwrap().unwrap().status,
            MessageStatus::Sent
        );
    }

    #[test]
    fn test_update_missing_message_is_not_found() {
        let store = KvStore::in_memory();
        let result = store.update_message(&uuid::Uuid::new_v4(), &mut |_| {});
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_incoming_dedup() {
        let store = KvStore::in_memory();
        let dev = device();
        let msg = IncomingMessage::new(dev, MessageSource::Channel { slot: 1 }, "hello", 42);
        let copy = IncomingMessage::new(dev, MessageSource::Channel { slot: 1 }, "hello", 42);

        assert!(store.record_incoming(&msg).unwrap());
        assert!(!store.record_incoming(&copy).unwrap());
        assert_eq!(store.incoming_messages(&dev).unwrap().len(), 1);
        assert!(store.incoming_messages(&device()).unwrap().is_empty());
    }

    #[test]
    fn test_contact_by_prefix() {
        let store = KvStore::in_memory();
        let dev = device();
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let key = PublicKey::from_bytes(bytes);
        store
            .save_contact(&Contact::new(dev, key, "alice", ContactKind::Chat))
            .unwrap();

        let found = store
            .contact_by_prefix(&dev, &[0xde, 0xad, 0xbe, 0xef])
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "alice");
        assert!(store.contact_by_prefix(&dev, &[0xde, 0xad, 0x00]).unwrap().is_none());
        assert!(store.contact_by_prefix(&device(), &[0xde]).unwrap().is_none());
    }

    #[test]
    fn test_sessions_filtered_by_key() {
        let store = KvStore::in_memory();
        let dev = device();
        let room = PublicKey::from_bytes([5u8; 32]);
        let other = PublicKey::from_bytes([6u8; 32]);
        store
            .save_session(&RemoteSession::new(dev, room, SessionRole::Room, 90))
            .unwrap();
        store
            .save_session(&RemoteSession::new(dev, other, SessionRole::Repeater, 90))
            .unwrap();

        assert_eq!(store.sessions(&dev).unwrap().len(), 2);
        assert_eq!(store.sessions_for_key(&dev, &room).unwrap().len(), 1);
    }

    #[test]
    fn test_channels_scoped_to_device() {
        let store = KvStore::in_memory();
        let dev = device();
        for index in [0u8, 3, 12] {
            store
                .save_channel(&ChannelRecord {
                    device_id: dev,
                    index,
                    name: format!("ch{}", index),
                    secret: [index; 16],
                })
                .unwrap();
        }
        store.delete_channel(&dev, 3).unwrap();

        let indices: Vec<u8> = store.channels(&dev).unwrap().iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 12]);
        assert!(store.channels(&device()).unwrap().is_empty());
    }
}
