//! Transport abstraction layer
//!
//! Defines the contract between the protocol core and the link to the radio.
//! The transport owns framing and the physical connection; the core only sees
//! typed requests, typed failures and a stream of tagged events.

use crate::identity::{Contact, KeyPrefix, PublicKey};
use crate::message::TextType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors reported by the transport for any request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,
    #[error("Device rejected request (code {0})")]
    DeviceRejected(u8),
    #[error("Connection lost")]
    ConnectionLost,
}

impl TransportError {
    /// Failures that say more about the link than about the request
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionLost)
    }
}

/// What the device reports when it accepts an outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentInfo {
    /// Opaque acknowledgement blob; the first four bytes are the token
    pub ack_code: Vec<u8>,
    /// Device's estimate of the round trip, in milliseconds
    pub suggested_timeout_ms: u32,
    /// Whether the device chose to flood this frame
    pub flood: bool,
}

/// A channel slot as configured on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub index: u8,
    pub name: String,
    pub secret: [u8; 16],
}

/// Status block returned by a remote repeater or room server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub battery_mv: u16,
    pub uptime_secs: u32,
    pub queue_len: u16,
    pub last_rssi: i16,
    pub last_snr: f32,
    pub packets_sent: u32,
    pub packets_received: u32,
}

/// A contact message as pushed by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedText {
    pub sender_prefix: KeyPrefix,
    pub text_type: TextType,
    pub text: String,
    pub sender_timestamp: u32,
    /// Hops travelled; negative when the frame was flooded
    pub path_len: i8,
}

/// Events emitted by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An acknowledgement arrived (code carries the token)
    Acknowledgement { code: Vec<u8> },
    /// A remote node accepted a login
    LoginSuccess {
        prefix: KeyPrefix,
        is_admin: bool,
        acl: Option<u8>,
    },
    /// A remote node rejected a login
    LoginFailed { prefix: KeyPrefix },
    /// Direct message (including CLI replies)
    ContactMessage(ReceivedText),
    /// Channel broadcast
    ChannelMessage {
        slot: u8,
        text: String,
        sender_timestamp: u32,
    },
    /// Reply to a status request
    StatusResponse {
        prefix: KeyPrefix,
        status: RemoteStatus,
    },
    /// The device has buffered messages waiting to be fetched
    MessagesWaiting,
}

/// Request/response interface to the companion radio.
///
/// Every request may fail with a [`TransportError`]. Responses to remote
/// operations (acknowledgements, login results, CLI replies) never come back
/// from the request itself; they arrive on the event stream returned by
/// [`Transport::subscribe`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a direct text message; `attempt` is folded into the ack code by the firmware
    async fn send_message(
        &self,
        recipient: &PublicKey,
        text: &str,
        attempt: u8,
        timestamp: u32,
    ) -> Result<SentInfo, TransportError>;

    /// Broadcast a text message on a channel slot
    async fn send_channel_message(
        &self,
        slot: u8,
        text: &str,
        timestamp: u32,
    ) -> Result<SentInfo, TransportError>;

    /// Start a login to a repeater or room server
    async fn send_login(
        &self,
        destination: &PublicKey,
        password: &str,
    ) -> Result<SentInfo, TransportError>;

    async fn send_logout(&self, destination: &PublicKey) -> Result<(), TransportError>;

    /// Send a CLI command to a remote node
    async fn send_command(
        &self,
        destination: &PublicKey,
        command: &str,
        timestamp: u32,
    ) -> Result<SentInfo, TransportError>;

    /// Lightweight keep-alive carrying the client's sync checkpoint
    async fn send_keep_alive(
        &self,
        destination: &PublicKey,
        sync_since: u32,
    ) -> Result<(), TransportError>;

    /// Ask a remote node for its status block
    async fn request_status(&self, destination: &PublicKey) -> Result<SentInfo, TransportError>;

    /// Read a channel slot; `Ok(None)` when the slot is not configured
    async fn get_channel(&self, index: u8) -> Result<Option<ChannelInfo>, TransportError>;

    async fn set_channel(&self, channel: &ChannelInfo) -> Result<(), TransportError>;

    /// Forget the direct path to a contact so the next send floods
    async fn reset_path(&self, destination: &PublicKey) -> Result<(), TransportError>;

    /// Read the device's current record for a contact
    async fn get_contact(&self, key: &PublicKey) -> Result<Option<Contact>, TransportError>;

    /// Pull the next buffered message off the device.
    ///
    /// The fetched message is published on the event stream like a pushed one;
    /// the return value only says whether anything was fetched.
    async fn sync_next_message(&self) -> Result<bool, TransportError>;

    /// Subscribe to the event stream
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::ConnectionLost.is_transient());
        assert!(!TransportError::DeviceRejected(2).is_transient());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            TransportError::DeviceRejected(4).to_string(),
            "Device rejected request (code 4)"
        );
    }
}
