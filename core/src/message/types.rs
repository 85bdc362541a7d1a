// Message types — outbound messages, their delivery status and received traffic

use crate::identity::{DeviceId, KeyPrefix, PublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier of an outbound message
pub type MessageId = uuid::Uuid;

/// Maximum text payload the firmware accepts in one frame (bytes of UTF-8)
pub const MAX_TEXT_BYTES: usize = 160;

/// Acknowledgement correlation token.
///
/// The transport hands back an opaque blob when a message is queued; the
/// first four bytes, read little-endian, identify the eventual acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckToken(u32);

impl AckToken {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Extract the token from an acknowledgement blob (None if shorter than 4 bytes)
    pub fn from_blob(blob: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
        Some(Self(u32::from_le_bytes(bytes)))
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Encode as the 4-byte blob the firmware uses
    pub fn to_blob(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Where an outbound message is headed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Direct message to a contact
    Contact(PublicKey),
    /// Broadcast on a channel slot
    Channel(u8),
}

/// Delivery status of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Persisted, not yet handed to the transport
    Pending,
    /// Handed to the transport, waiting for it to accept
    Sending,
    /// Accepted by the device, waiting for an acknowledgement
    Sent,
    /// Acknowledged by the recipient
    Delivered,
    /// Waiting for the next attempt of a retry loop
    Retrying,
    /// Gave up
    Failed,
}

impl MessageStatus {
    /// Whether no further transition is expected without user action
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

/// A message sent from this device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Unique message ID (UUID v4)
    pub id: MessageId,
    /// Device that sends the message
    pub device_id: DeviceId,
    /// Recipient contact or channel slot
    pub destination: Destination,
    /// UTF-8 text
    pub text: String,
    /// When the message was created (unix seconds)
    pub created_at: u64,
    /// Timestamp of the most recent send attempt (unix seconds)
    pub sent_at: Option<u64>,
    /// Current delivery status
    pub status: MessageStatus,
    /// Correlation token of the most recent attempt
    pub ack_token: Option<AckToken>,
    /// Attempts made so far
    pub attempt: u8,
    /// Attempts allowed by the active retry policy
    pub max_attempts: u8,
    /// Additional acknowledgements heard after delivery
    pub heard_repeats: u32,
    /// Round trip from send to first acknowledgement
    pub round_trip_ms: Option<u64>,
}

impl OutboundMessage {
    /// Create a pending direct message
    pub fn direct(device_id: DeviceId, recipient: PublicKey, text: &str) -> Self {
        Self::new(device_id, Destination::Contact(recipient), text)
    }

    /// Create a pending channel message
    pub fn channel(device_id: DeviceId, slot: u8, text: &str) -> Self {
        Self::new(device_id, Destination::Channel(slot), text)
    }

    fn new(device_id: DeviceId, destination: Destination, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            device_id,
            destination,
            text: text.to_string(),
            created_at: unix_timestamp(),
            sent_at: None,
            status: MessageStatus::Pending,
            ack_token: None,
            attempt: 0,
            max_attempts: 1,
            heard_repeats: 0,
            round_trip_ms: None,
        }
    }

    /// Recipient key for direct messages
    pub fn recipient(&self) -> Option<PublicKey> {
        match self.destination {
            Destination::Contact(key) => Some(key),
            Destination::Channel(_) => None,
        }
    }
}

/// Payload type of a received contact message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextType {
    /// Ordinary chat text
    Plain,
    /// Reply to a remote CLI command
    CliData,
    /// Room post relayed with the original author's key prefix
    SignedPlain,
}

impl TextType {
    /// Map the firmware text type byte
    pub fn from_byte(value: u8) -> Self {
        match value {
            1 => Self::CliData,
            2 => Self::SignedPlain,
            _ => Self::Plain,
        }
    }
}

/// Where a received message came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSource {
    /// Direct message; the contact is resolved from the key prefix when known
    Contact {
        sender_prefix: KeyPrefix,
        sender: Option<PublicKey>,
    },
    /// Channel broadcast
    Channel { slot: u8 },
}

/// A received text message as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: MessageId,
    pub device_id: DeviceId,
    pub source: MessageSource,
    pub text: String,
    /// Sender's clock at send time (unix seconds)
    pub sender_timestamp: u32,
    /// Local receive time (unix seconds)
    pub received_at: u64,
}

impl IncomingMessage {
    pub fn new(device_id: DeviceId, source: MessageSource, text: &str, sender_timestamp: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            device_id,
            source,
            text: text.to_string(),
            sender_timestamp,
            received_at: unix_timestamp(),
        }
    }

    /// Deduplication key: the same message relayed twice yields the same key
    pub fn dedup_key(&self) -> String {
        let origin = match &self.source {
            MessageSource::Contact { sender_prefix, .. } => format!("c{}", sender_prefix),
            MessageSource::Channel { slot } => format!("ch{}", slot),
        };
        let digest = Sha256::digest(self.text.as_bytes());
        format!(
            "{}:{}:{}:{}",
            self.device_id,
            origin,
            self.sender_timestamp,
            hex::encode(&digest[..8])
        )
    }
}

pub(crate) fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_token_from_blob() {
        let token = AckToken::from_blob(&[0x78, 0x56, 0x34, 0x12, 0xff]).unwrap();
        assert_eq!(token.value(), 0x1234_5678);
        assert_eq!(token.to_blob(), [0x78, 0x56, 0x34, 0x12]);
        assert!(AckToken::from_blob(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_create_direct_message() {
        let device = uuid::Uuid::new_v4();
        let recipient = PublicKey::from_bytes([9u8; 32]);
        let msg = OutboundMessage::direct(device, recipient, "hello mesh");

        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.recipient(), Some(recipient));
        assert_eq!(msg.heard_repeats, 0);
        assert!(msg.created_at > 0);
        assert!(msg.ack_token.is_none());
    }

    #[test]
    fn test_channel_message_has_no_recipient() {
        let msg = OutboundMessage::channel(uuid::Uuid::new_v4(), 2, "hi all");
        assert_eq!(msg.destination, Destination::Channel(2));
        assert!(msg.recipient().is_none());
    }

    #[test]
    fn test_dedup_key_stable_across_copies() {
        let device = uuid::Uuid::new_v4();
        let source = MessageSource::Contact {
            sender_prefix: KeyPrefix::from_bytes([1, 2, 3, 4, 5, 6]),
            sender: None,
        };
        let first = IncomingMessage::new(device, source.clone(), "ping", 1_700_000_000);
        let relayed = IncomingMessage::new(device, source, "ping", 1_700_000_000);
        assert_ne!(first.id, relayed.id);
        assert_eq!(first.dedup_key(), relayed.dedup_key());

        let other = IncomingMessage::new(
            device,
            MessageSource::Channel { slot: 0 },
            "ping",
            1_700_000_000,
        );
        assert_ne!(first.dedup_key(), other.dedup_key());
    }

    #[test]
    fn test_text_type_mapping() {
        assert_eq!(TextType::from_byte(0), TextType::Plain);
        assert_eq!(TextType::from_byte(1), TextType::CliData);
        assert_eq!(TextType::from_byte(2), TextType::SignedPlain);
        assert_eq!(TextType::from_byte(42), TextType::Plain);
    }

    #[test]
    fn test_message_serialization() {
        let msg = OutboundMessage::direct(
            uuid::Uuid::new_v4(),
            PublicKey::from_bytes([3u8; 32]),
            "hello",
        );
        let bytes = serde_json::to_vec(&msg).unwrap();
        let restored: OutboundMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(msg, restored);
    }
}
