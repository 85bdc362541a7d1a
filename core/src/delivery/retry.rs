// Retry loop — repeated sends with a switch to flood routing
//
// Shared by send-with-retry, retry of a failed message and resend. Each
// attempt registers its own retry-managed token; the loop, not the sweep,
// owns their expiry and releases whatever is left when it ends.

use super::engine::EngineInner;
use super::tracker::{PendingAck, Registration, TrackerError};
use super::DeliveryError;
use crate::config::RetryConfig;
use crate::identity::PublicKey;
use crate::message::types::unix_timestamp;
use crate::message::{AckToken, MessageId, MessageStatus, OutboundMessage};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ack wait for one send: the configured value, or the device's estimate
/// plus 20% when that is longer
pub fn ack_wait_timeout(configured: Duration, suggested_ms: u32) -> Duration {
    let suggested = Duration::from_millis(u64::from(suggested_ms) * 6 / 5);
    configured.max(suggested)
}

/// How a retry loop ended when it was not cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct RetryOutcome {
    pub delivered: bool,
    /// The loop already reported the switch to flood routing
    pub routing_notified: bool,
}

enum AttemptStart {
    Delivered,
    Wait(tokio::sync::oneshot::Receiver<Duration>),
    Failed,
}

/// Drops the message's undelivered tokens and waiter however the loop exits
struct TrackerRelease<'a> {
    inner: &'a EngineInner,
    message_id: MessageId,
}

impl Drop for TrackerRelease<'_> {
    fn drop(&mut self) {
        let released = self.inner.tracker.lock().release_message(&self.message_id);
        if released > 0 {
            debug!(
                "Released {} unacknowledged tokens of message {}",
                released, self.message_id
            );
        }
    }
}

impl EngineInner {
    pub(super) async fn run_retry_loop(
        &self,
        message: &OutboundMessage,
        recipient: PublicKey,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<RetryOutcome, DeliveryError> {
        let message_id = message.id;
        let _release = TrackerRelease {
            inner: self,
            message_id,
        };

        let mut attempts: u8 = 0;
        let mut flood_attempts: u8 = 0;
        let mut flood_mode = false;
        let mut routing_notified = false;

        while attempts < retry.max_attempts
            && (!flood_mode || flood_attempts < retry.max_flood_attempts)
        {
            if cancel.is_cancelled() {
                info!("Retry of message {} cancelled", message_id);
                return Err(DeliveryError::Cancelled);
            }
            if self.tracker.lock().is_delivered(&message_id) {
                return Ok(RetryOutcome {
                    delivered: true,
                    routing_notified,
                });
            }

            if attempts > 0 {
                self.store.update_message(&message_id, &mut |m| {
                    m.status = MessageStatus::Retrying;
                    m.attempt = attempts;
                })?;
                if let Some(delegate) = self.delegate() {
                    delegate.on_retry_status(message_id, attempts, retry.max_attempts);
                }
            }

            if attempts == retry.flood_after && !flood_mode {
                if let Err(e) = self.transport.reset_path(&recipient).await {
                    warn!("Path reset for {} failed, continuing: {}", recipient, e);
                }
                flood_mode = true;
                self.refresh_contact(&recipient).await;
                info!("Message {} switched to flood routing", message_id);
                if let Some(delegate) = self.delegate() {
                    delegate.on_routing_changed(recipient, true);
                }
                routing_notified = true;
            }

            if self
                .attempt(message, recipient, attempts, retry, cancel)
                .await?
            {
                return Ok(RetryOutcome {
                    delivered: true,
                    routing_notified,
                });
            }

            attempts += 1;
            if flood_mode {
                flood_attempts += 1;
            }
        }

        info!(
            "Message {} unacknowledged after {} attempts",
            message_id, attempts
        );
        Ok(RetryOutcome {
            delivered: false,
            routing_notified,
        })
    }

    /// One send and wait. `Ok(true)` when the message was acknowledged.
    async fn attempt(
        &self,
        message: &OutboundMessage,
        recipient: PublicKey,
        attempt: u8,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<bool, DeliveryError> {
        let message_id = message.id;
        self.store.update_message(&message_id, &mut |m| {
            m.status = MessageStatus::Sending;
            m.attempt = attempt + 1;
        })?;

        let sent = match self
            .transport
            .send_message(&recipient, &message.text, attempt, unix_timestamp() as u32)
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Attempt {} of message {} failed: {}", attempt, message_id, e);
                return Ok(false);
            }
        };

        let Some(token) = AckToken::from_blob(&sent.ack_code) else {
            warn!("Device returned no ack token for message {}", message_id);
            return Ok(false);
        };
        let timeout = ack_wait_timeout(retry.custom_timeout(), sent.suggested_timeout_ms);

        self.store.update_message(&message_id, &mut |m| {
            m.status = MessageStatus::Sent;
            m.ack_token = Some(token);
            m.sent_at = Some(unix_timestamp());
        })?;

        let start = {
            let mut tracker = self.tracker.lock();
            let registration = tracker.register(
                PendingAck::new(token, message_id, Instant::now(), timeout).retry_managed(),
            );
            match registration {
                Ok(Registration::AlreadyDelivered { round_trip }) => {
                    drop(tracker);
                    self.apply_delivered(message_id, round_trip);
                    AttemptStart::Delivered
                }
                Ok(Registration::Pending) if tracker.is_delivered(&message_id) => {
                    AttemptStart::Delivered
                }
                Ok(Registration::Pending) => AttemptStart::Wait(tracker.watch(message_id)),
                // The firmware reused this attempt's code; keep waiting on it
                Err(TrackerError::DuplicateToken { existing, .. }) if existing == message_id => {
                    AttemptStart::Wait(tracker.watch(message_id))
                }
                Err(e) => {
                    warn!("Cannot track message {}: {}", message_id, e);
                    AttemptStart::Failed
                }
            }
        };

        let waiter = match start {
            AttemptStart::Delivered => return Ok(true),
            AttemptStart::Failed => return Ok(false),
            AttemptStart::Wait(waiter) => waiter,
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Retry of message {} cancelled while waiting", message_id);
                Err(DeliveryError::Cancelled)
            }
            result = tokio::time::timeout(timeout, waiter) => match result {
                Ok(Ok(_)) => Ok(true),
                _ => {
                    debug!("No ack for message {} within {:?}", message_id, timeout);
                    Ok(self.tracker.lock().is_delivered(&message_id))
                }
            },
        }
    }
}
