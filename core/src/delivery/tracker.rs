// Acknowledgement tracker — outstanding ack tokens, their timeouts and repeats
//
// Pure bookkeeping: no transport or storage access. The engine owns the
// tracker behind a mutex and passes the current instant in, so every
// transition here is synchronous and deterministic under a paused clock.

use crate::message::{AckToken, MessageId};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Unmatched acknowledgements remembered at most
const EARLY_ACK_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("Token {token} is already tracked for message {existing}")]
    DuplicateToken { token: AckToken, existing: MessageId },
}

/// An outstanding acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    pub token: AckToken,
    pub message_id: MessageId,
    pub sent_at: Instant,
    pub timeout: Duration,
    pub delivered: bool,
    pub delivered_at: Option<Instant>,
    pub heard_repeats: u32,
    /// Expiry is owned by a retry loop, not the sweep
    pub retry_managed: bool,
    /// Channel traffic: no recipient is obliged to acknowledge
    pub broadcast: bool,
}

impl PendingAck {
    pub fn new(token: AckToken, message_id: MessageId, sent_at: Instant, timeout: Duration) -> Self {
        Self {
            token,
            message_id,
            sent_at,
            timeout,
            delivered: false,
            delivered_at: None,
            heard_repeats: 0,
            retry_managed: false,
            broadcast: false,
        }
    }

    pub fn retry_managed(mut self) -> Self {
        self.retry_managed = true;
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    fn is_expired(&self, now: Instant) -> bool {
        !self.retry_managed && !self.delivered && now.saturating_duration_since(self.sent_at) > self.timeout
    }
}

/// What an acknowledgement meant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Token not tracked; ignored
    Unknown,
    /// First acknowledgement for the message
    Delivered {
        message_id: MessageId,
        round_trip: Duration,
    },
    /// A further acknowledgement of an already-delivered transmission
    HeardRepeat { message_id: MessageId, count: u32 },
}

/// Result of registering a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Now waiting for the acknowledgement
    Pending,
    /// The acknowledgement beat the registration and has been applied
    AlreadyDelivered { round_trip: Duration },
}

/// What a sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Messages whose acknowledgement never came (each listed once)
    pub expired: Vec<MessageId>,
    /// Broadcast entries dropped without acknowledgement
    pub dropped_broadcasts: usize,
    /// Delivered entries past the grace period
    pub purged: usize,
}

pub struct AckTracker {
    pending: HashMap<AckToken, PendingAck>,
    /// Delivery waiters, one per message
    watchers: HashMap<MessageId, oneshot::Sender<Duration>>,
    /// Acknowledgements that arrived before their registration
    early: VecDeque<(AckToken, Instant)>,
    early_window: Duration,
}

impl AckTracker {
    pub fn new(early_window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            watchers: HashMap::new(),
            early: VecDeque::new(),
            early_window,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, token: &AckToken) -> Option<&PendingAck> {
        self.pending.get(token)
    }

    /// Track a new token. A token already tracked is rejected.
    pub fn register(&mut self, mut ack: PendingAck) -> Result<Registration, TrackerError> {
        if let Some(existing) = self.pending.get(&ack.token) {
            return Err(TrackerError::DuplicateToken {
                token: ack.token,
                existing: existing.message_id,
            });
        }

        let token = ack.token;
        let early_at = self.take_early(&token, ack.sent_at);
        match early_at {
            Some(acked_at) => {
                let round_trip = acked_at.saturating_duration_since(ack.sent_at);
                ack.delivered = true;
                ack.delivered_at = Some(acked_at);
                debug!("Token {} was acknowledged before registration", token);
                self.pending.insert(token, ack);
                Ok(Registration::AlreadyDelivered { round_trip })
            }
            None => {
                self.pending.insert(token, ack);
                Ok(Registration::Pending)
            }
        }
    }

    /// Apply an acknowledgement
    pub fn handle_ack(&mut self, token: AckToken, now: Instant) -> AckOutcome {
        let Some(entry) = self.pending.get(&token) else {
            self.remember_early(token, now);
            return AckOutcome::Unknown;
        };
        let message_id = entry.message_id;

        // A sibling attempt for the same message was already acknowledged
        let sibling_delivered = !entry.delivered
            && self
                .pending
                .values()
                .any(|p| p.message_id == message_id && p.delivered && p.token != token);

        let Some(entry) = self.pending.get_mut(&token) else {
            return AckOutcome::Unknown;
        };

        if entry.delivered || sibling_delivered {
            entry.heard_repeats += 1;
            if !entry.delivered {
                entry.delivered = true;
                entry.delivered_at = Some(now);
            }
            return AckOutcome::HeardRepeat {
                message_id,
                count: entry.heard_repeats,
            };
        }

        entry.delivered = true;
        entry.delivered_at = Some(now);
        let round_trip = now.saturating_duration_since(entry.sent_at);

        if let Some(waiter) = self.watchers.remove(&message_id) {
            let _ = waiter.send(round_trip);
        }

        AckOutcome::Delivered {
            message_id,
            round_trip,
        }
    }

    /// Wait handle resolved with the round trip when the message is first
    /// acknowledged. Replaces any earlier waiter for the same message.
    pub fn watch(&mut self, message_id: MessageId) -> oneshot::Receiver<Duration> {
        let (tx, rx) = oneshot::channel();
        self.watchers.insert(message_id, tx);
        rx
    }

    pub fn unwatch(&mut self, message_id: &MessageId) {
        self.watchers.remove(message_id);
    }

    /// Whether any tracked token for the message has been acknowledged
    pub fn is_delivered(&self, message_id: &MessageId) -> bool {
        self.pending
            .values()
            .any(|p| &p.message_id == message_id && p.delivered)
    }

    /// Drop every entry and the waiter for a message, delivered or not.
    /// Used when a new send loop takes the message over.
    pub fn forget_message(&mut self, message_id: &MessageId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| &p.message_id != message_id);
        self.watchers.remove(message_id);
        before - self.pending.len()
    }

    /// End tracking for a message whose retry loop has finished.
    ///
    /// An undelivered message loses all its entries. A delivered one keeps
    /// them until the grace period runs out, so late acks of earlier
    /// attempts are counted as repeats. None of the kept entries can expire.
    pub fn release_message(&mut self, message_id: &MessageId) -> usize {
        let delivered_at = self
            .pending
            .values()
            .filter(|p| &p.message_id == message_id)
            .find_map(|p| p.delivered_at);

        let before = self.pending.len();
        match delivered_at {
            Some(at) => {
                for entry in self
                    .pending
                    .values_mut()
                    .filter(|p| &p.message_id == message_id)
                {
                    entry.delivered_at.get_or_insert(at);
                    entry.retry_managed = true;
                }
            }
            None => self.pending.retain(|_, p| &p.message_id != message_id),
        }
        self.watchers.remove(message_id);
        before - self.pending.len()
    }

    /// Expire unacknowledged sweep-owned entries and purge old deliveries
    pub fn sweep(&mut self, now: Instant, delivered_grace: Duration) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        let expired_tokens: Vec<AckToken> = self
            .pending
            .values()
            .filter(|p| p.is_expired(now))
            .map(|p| p.token)
            .collect();

        for token in expired_tokens {
            if let Some(entry) = self.pending.remove(&token) {
                if entry.broadcast {
                    outcome.dropped_broadcasts += 1;
                } else if !outcome.expired.contains(&entry.message_id) {
                    outcome.expired.push(entry.message_id);
                }
            }
        }

        let before = self.pending.len();
        self.pending.retain(|_, p| match p.delivered_at {
            Some(at) => now.saturating_duration_since(at) <= delivered_grace,
            None => true,
        });
        outcome.purged = before - self.pending.len();

        let window = self.early_window;
        self.early
            .retain(|(_, at)| now.saturating_duration_since(*at) <= window);

        outcome
    }

    fn remember_early(&mut self, token: AckToken, now: Instant) {
        if self.early.len() >= EARLY_ACK_CAPACITY {
            self.early.pop_front();
        }
        self.early.push_back((token, now));
    }

    fn take_early(&mut self, token: &AckToken, registered_at: Instant) -> Option<Instant> {
        let position = self.early.iter().position(|(t, at)| {
            t == token && registered_at.saturating_duration_since(*at) <= self.early_window
        })?;
        self.early.remove(position).map(|(_, at)| at)
    }
}
