// Delivery module — outbound messages, acknowledgement tracking and retries

pub mod engine;
mod retry;
pub mod tracker;

pub use engine::MessageDeliveryEngine;
pub use retry::ack_wait_timeout;
pub use tracker::{AckOutcome, AckTracker, PendingAck, Registration, SweepOutcome, TrackerError};

use crate::identity::{ContactKind, PublicKey};
use crate::message::{IncomingMessage, MessageId, MessageStatus};
use crate::store::StoreError;
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("Message is {len} bytes, limit is {max}")]
    TextTooLong { len: usize, max: usize },
    #[error("{0:?} nodes do not accept direct messages")]
    InvalidRecipient(ContactKind),
    #[error("Unknown contact {0}")]
    UnknownContact(PublicKey),
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),
    #[error("Message {0} has no direct recipient")]
    NotDirect(MessageId),
    #[error("Message is {0:?}, only failed messages can be retried")]
    NotRetryable(MessageStatus),
    #[error("A retry of message {0} is already in progress")]
    RetryInProgress(MessageId),
    #[error("Cancelled")]
    Cancelled,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Tracking error: {0}")]
    Tracker(#[from] TrackerError),
}

/// Callbacks for delivery progress.
///
/// Invoked from the caller's task or the engine's listener; implementations
/// must not block.
pub trait DeliveryDelegate: Send + Sync {
    /// The message was persisted and can be shown before delivery completes
    fn on_message_created(&self, _message_id: MessageId) {}
    /// A retry attempt is about to start (`attempt` counts from 0)
    fn on_retry_status(&self, _message_id: MessageId, _attempt: u8, _max_attempts: u8) {}
    /// The destination switched between direct and flood routing
    fn on_routing_changed(&self, _contact: PublicKey, _flood: bool) {}
    fn on_delivered(&self, _message_id: MessageId, _round_trip: Duration) {}
    fn on_heard_repeat(&self, _message_id: MessageId, _count: u32) {}
    fn on_delivery_failed(&self, _message_id: MessageId) {}
    /// A first-seen message arrived from a contact or channel
    fn on_message_received(&self, _message: IncomingMessage) {}
}
