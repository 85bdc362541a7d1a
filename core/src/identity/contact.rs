// Contacts — cached routing records for known mesh nodes

use super::keys::PublicKey;
use super::DeviceId;
use serde::{Deserialize, Serialize};

/// Path length value the firmware reports when no direct path is known
pub const FLOOD_PATH_LEN: i8 = -1;

/// Node class advertised by a contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContactKind {
    /// Companion/chat node that accepts direct messages
    Chat,
    /// Repeater: relays traffic, accepts admin sessions but not chat
    Repeater,
    /// Room server: accepts posts and guest/admin sessions
    Room,
    /// Sensor node, telemetry only
    Sensor,
}

impl ContactKind {
    /// Map the advert type byte (1 = chat, 2 = repeater, 3 = room, 4 = sensor)
    pub fn from_advert_type(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Chat),
            2 => Some(Self::Repeater),
            3 => Some(Self::Room),
            4 => Some(Self::Sensor),
            _ => None,
        }
    }

    /// Whether a direct text message to this node class makes sense
    pub fn accepts_direct_messages(&self) -> bool {
        matches!(self, Self::Chat | Self::Room)
    }
}

/// A contact as cached from the device's contact table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Device whose contact table this record mirrors
    pub device_id: DeviceId,
    /// Full public key
    pub public_key: PublicKey,
    /// Advertised name
    pub name: String,
    /// Node class
    pub kind: ContactKind,
    /// Outbound path length in hops; negative means flood routing
    pub out_path_len: i8,
    /// Outbound path (one byte per hop)
    pub out_path: Vec<u8>,
    /// Timestamp of the last advert heard (unix seconds)
    pub last_advert: u32,
}

impl Contact {
    pub fn new(device_id: DeviceId, public_key: PublicKey, name: &str, kind: ContactKind) -> Self {
        Self {
            device_id,
            public_key,
            name: name.to_string(),
            kind,
            out_path_len: FLOOD_PATH_LEN,
            out_path: Vec::new(),
            last_advert: 0,
        }
    }

    /// Set a direct path of the given hops
    pub fn with_direct_path(mut self, path: Vec<u8>) -> Self {
        self.out_path_len = path.len() as i8;
        self.out_path = path;
        self
    }

    /// No direct path is known; traffic is flooded
    pub fn is_flood(&self) -> bool {
        self.out_path_len < 0
    }

    /// Hop count of the direct path, if there is one
    pub fn hop_count(&self) -> Option<u8> {
        if self.is_flood() {
            None
        } else {
            Some(self.out_path_len as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flood_by_default() {
        let contact = Contact::new(
            uuid::Uuid::new_v4(),
            PublicKey::from_bytes([7u8; 32]),
            "node",
            ContactKind::Chat,
        );
        assert!(contact.is_flood());
        assert_eq!(contact.hop_count(), None);

        let direct = contact.with_direct_path(vec![0xaa, 0xbb]);
        assert!(!direct.is_flood());
        assert_eq!(direct.hop_count(), Some(2));
    }

    #[test]
    fn test_zero_hop_path_is_direct() {
        let contact = Contact::new(
            uuid::Uuid::new_v4(),
            PublicKey::from_bytes([1u8; 32]),
            "neighbour",
            ContactKind::Repeater,
        )
        .with_direct_path(Vec::new());
        assert!(!contact.is_flood());
        assert_eq!(contact.hop_count(), Some(0));
    }

    #[test]
    fn test_direct_message_recipients() {
        assert!(ContactKind::Chat.accepts_direct_messages());
        assert!(ContactKind::Room.accepts_direct_messages());
        assert!(!ContactKind::Repeater.accepts_direct_messages());
        assert!(!ContactKind::Sensor.accepts_direct_messages());
        assert_eq!(ContactKind::from_advert_type(3), Some(ContactKind::Room));
        assert_eq!(ContactKind::from_advert_type(9), None);
    }
}
