// Message delivery engine
//
// Owns outbound sends for one device: validation, persistence ahead of the
// network call, ack registration, the retry loop and the expiry sweep. A
// single listener task consumes the transport's events for acknowledgements
// and received text.

use super::retry::{ack_wait_timeout, RetryOutcome};
use super::tracker::{AckOutcome, AckTracker, PendingAck, Registration, SweepOutcome};
use super::{DeliveryDelegate, DeliveryError};
use crate::config::{DeliveryConfig, RetryConfig};
use crate::identity::{Contact, DeviceId, PublicKey};
use crate::message::types::unix_timestamp;
use crate::message::{
    AckToken, Destination, IncomingMessage, MessageId, MessageSource, MessageStatus,
    OutboundMessage, TextType,
};
use crate::store::Persistence;
use crate::transport::{ReceivedText, Transport, TransportEvent};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on messages pulled per drain
const MAX_DRAIN_PER_SIGNAL: usize = 64;

pub(super) struct EngineInner {
    pub(super) device_id: DeviceId,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) store: Arc<dyn Persistence>,
    pub(super) tracker: Mutex<AckTracker>,
    pub(super) config: DeliveryConfig,
    in_flight: Mutex<HashSet<MessageId>>,
    delegate: RwLock<Option<Arc<dyn DeliveryDelegate>>>,
    draining: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

/// Delivery engine bound to one device
#[derive(Clone)]
pub struct MessageDeliveryEngine {
    inner: Arc<EngineInner>,
}

/// Marks a message as having an active send or retry
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<MessageId>>,
    message_id: MessageId,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<MessageId>>, message_id: MessageId) -> Option<Self> {
        if set.lock().insert(message_id) {
            Some(Self { set, message_id })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.message_id);
    }
}

impl MessageDeliveryEngine {
    pub fn new(
        device_id: DeviceId,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Persistence>,
        config: DeliveryConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let tracker = AckTracker::new(config.early_ack_window());
        Self {
            inner: Arc::new(EngineInner {
                device_id,
                transport,
                store,
                tracker: Mutex::new(tracker),
                config,
                in_flight: Mutex::new(HashSet::new()),
                delegate: RwLock::new(None),
                draining: AtomicBool::new(false),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                drain_task: Mutex::new(None),
            }),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn DeliveryDelegate>>) {
        *self.inner.delegate.write() = delegate;
    }

    /// Spawn the event listener and the expiry sweep. No-op while running.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        self.inner.shutdown.send_replace(false);

        // Subscribe before spawning so nothing emitted after start() is missed
        let events = self.inner.transport.subscribe();
        tasks.push(spawn_listener(
            self.inner.clone(),
            events,
            self.inner.shutdown.subscribe(),
        ));
        tasks.push(spawn_sweep(
            self.inner.clone(),
            self.inner.config.sweep_interval(),
            self.inner.shutdown.subscribe(),
        ));
        info!("Delivery engine started for device {}", self.inner.device_id);
    }

    /// Stop background tasks and wait for them to finish
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        // The listener may have started a drain before it stopped
        let drain = self.inner.drain_task.lock().take();
        if let Some(drain) = drain {
            let _ = drain.await;
        }
        info!("Delivery engine stopped for device {}", self.inner.device_id);
    }

    pub fn is_running(&self) -> bool {
        !self.inner.tasks.lock().is_empty()
    }

    /// Send a direct message once and leave its expiry to the sweep
    pub async fn send_once(
        &self,
        recipient: &PublicKey,
        text: &str,
    ) -> Result<OutboundMessage, DeliveryError> {
        let inner = &self.inner;
        inner.validate_text(text)?;
        inner.resolve_recipient(recipient).await?;

        let message = OutboundMessage::direct(inner.device_id, *recipient, text);
        inner.store.save_message(&message)?;
        let _guard = InFlightGuard::acquire(&inner.in_flight, message.id);

        inner.store.update_message(&message.id, &mut |m| {
            m.status = MessageStatus::Sending;
            m.attempt = 1;
        })?;

        let sent = match inner
            .transport
            .send_message(recipient, text, 0, unix_timestamp() as u32)
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Send of message {} failed: {}", message.id, e);
                inner.mark_failed(&message.id, false);
                return Err(e.into());
            }
        };

        let timeout = ack_wait_timeout(inner.config.ack_timeout_floor(), sent.suggested_timeout_ms);
        inner.track_sent(&message.id, &sent.ack_code, timeout, false)
    }

    /// Send a direct message through the retry loop.
    ///
    /// Returns the message in its final state (delivered or failed); a
    /// cancelled loop returns [`DeliveryError::Cancelled`] and leaves the
    /// last status written.
    pub async fn send_with_retry(
        &self,
        recipient: &PublicKey,
        text: &str,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<OutboundMessage, DeliveryError> {
        let inner = &self.inner;
        inner.validate_text(text)?;
        let contact = inner.resolve_recipient(recipient).await?;

        let mut message = OutboundMessage::direct(inner.device_id, *recipient, text);
        message.max_attempts = retry.max_attempts;
        inner.store.save_message(&message)?;
        if let Some(delegate) = inner.delegate() {
            delegate.on_message_created(message.id);
        }

        let _guard = InFlightGuard::acquire(&inner.in_flight, message.id);
        inner
            .run_and_finish(&message, contact, retry, cancel)
            .await
    }

    /// Run the retry loop again for a failed direct message
    pub async fn retry_message(
        &self,
        message_id: &MessageId,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<OutboundMessage, DeliveryError> {
        let inner = &self.inner;
        let _guard = InFlightGuard::acquire(&inner.in_flight, *message_id)
            .ok_or(DeliveryError::RetryInProgress(*message_id))?;

        let message = inner
            .store
            .get_message(message_id)?
            .ok_or(DeliveryError::MessageNotFound(*message_id))?;
        if message.status != MessageStatus::Failed {
            return Err(DeliveryError::NotRetryable(message.status));
        }
        let recipient = message
            .recipient()
            .ok_or(DeliveryError::NotDirect(*message_id))?;
        let contact = inner.resolve_recipient(&recipient).await?;

        let message = inner.reset_for_resend(message_id, retry.max_attempts)?;
        inner
            .run_and_finish(&message, contact, retry, cancel)
            .await
    }

    /// Send an existing message again, whatever its status. Channel
    /// messages are re-broadcast once.
    pub async fn resend_message(
        &self,
        message_id: &MessageId,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<OutboundMessage, DeliveryError> {
        let inner = &self.inner;
        let _guard = InFlightGuard::acquire(&inner.in_flight, *message_id)
            .ok_or(DeliveryError::RetryInProgress(*message_id))?;

        let message = inner
            .store
            .get_message(message_id)?
            .ok_or(DeliveryError::MessageNotFound(*message_id))?;

        match message.destination {
            Destination::Channel(slot) => {
                let message = inner.reset_for_resend(message_id, 1)?;
                inner.broadcast(&message, slot).await
            }
            Destination::Contact(recipient) => {
                let contact = inner.resolve_recipient(&recipient).await?;
                let message = inner.reset_for_resend(message_id, retry.max_attempts)?;
                inner
                    .run_and_finish(&message, contact, retry, cancel)
                    .await
            }
        }
    }

    /// Broadcast on a channel slot; acknowledgements only count repeats
    pub async fn send_channel_message(
        &self,
        slot: u8,
        text: &str,
    ) -> Result<OutboundMessage, DeliveryError> {
        let inner = &self.inner;
        inner.validate_text(text)?;

        let message = OutboundMessage::channel(inner.device_id, slot, text);
        inner.store.save_message(&message)?;
        if let Some(delegate) = inner.delegate() {
            delegate.on_message_created(message.id);
        }
        let _guard = InFlightGuard::acquire(&inner.in_flight, message.id);
        inner.broadcast(&message, slot).await
    }

    /// Apply one transport event
    pub async fn handle_event(&self, event: TransportEvent) {
        self.inner.handle_event(event).await;
    }

    /// Apply an acknowledgement token
    pub fn handle_ack(&self, token: AckToken) -> AckOutcome {
        self.inner.handle_ack(token)
    }

    /// One pass of the expiry sweep
    pub fn run_expiry_sweep(&self) -> SweepOutcome {
        self.inner.run_expiry_sweep()
    }

    /// Snapshot of a tracked token
    pub fn pending_ack(&self, token: &AckToken) -> Option<PendingAck> {
        self.inner.tracker.lock().get(token).cloned()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.inner.tracker.lock().len()
    }

    /// Whether a send or retry of the message is running
    pub fn is_in_flight(&self, message_id: &MessageId) -> bool {
        self.inner.in_flight.lock().contains(message_id)
    }

    pub fn message(&self, message_id: &MessageId) -> Result<Option<OutboundMessage>, DeliveryError> {
        Ok(self.inner.store.get_message(message_id)?)
    }
}

impl EngineInner {
    pub(super) fn delegate(&self) -> Option<Arc<dyn DeliveryDelegate>> {
        self.delegate.read().clone()
    }

    fn validate_text(&self, text: &str) -> Result<(), DeliveryError> {
        if text.len() > self.config.max_message_bytes {
            return Err(DeliveryError::TextTooLong {
                len: text.len(),
                max: self.config.max_message_bytes,
            });
        }
        Ok(())
    }

    /// Look the recipient up locally, then on the device, and check it
    /// accepts direct messages
    async fn resolve_recipient(&self, key: &PublicKey) -> Result<Contact, DeliveryError> {
        let contact = match self.store.get_contact(&self.device_id, key)? {
            Some(contact) => contact,
            None => {
                let mut contact = self
                    .transport
                    .get_contact(key)
                    .await?
                    .ok_or(DeliveryError::UnknownContact(*key))?;
                contact.device_id = self.device_id;
                self.store.save_contact(&contact)?;
                contact
            }
        };
        if !contact.kind.accepts_direct_messages() {
            return Err(DeliveryError::InvalidRecipient(contact.kind));
        }
        Ok(contact)
    }

    /// Re-read a contact's routing from the device; failures keep the cached copy
    pub(super) async fn refresh_contact(&self, key: &PublicKey) {
        match self.transport.get_contact(key).await {
            Ok(Some(mut contact)) => {
                contact.device_id = self.device_id;
                if let Err(e) = self.store.save_contact(&contact) {
                    warn!("Failed to cache contact {}: {}", key, e);
                }
            }
            Ok(None) => debug!("Contact {} no longer on device", key),
            Err(e) => warn!("Failed to refresh contact {}: {}", key, e),
        }
    }

    fn is_flood(&self, key: &PublicKey) -> Option<bool> {
        match self.store.get_contact(&self.device_id, key) {
            Ok(contact) => contact.map(|c| c.is_flood()),
            Err(e) => {
                warn!("Failed to read contact {}: {}", key, e);
                None
            }
        }
    }

    fn reset_for_resend(
        &self,
        message_id: &MessageId,
        max_attempts: u8,
    ) -> Result<OutboundMessage, DeliveryError> {
        // Earlier sends no longer count: the new loop owns the message
        let forgotten = self.tracker.lock().forget_message(message_id);
        if forgotten > 0 {
            debug!("Dropped {} earlier tokens of message {}", forgotten, message_id);
        }
        Ok(self.store.update_message(message_id, &mut |m| {
            m.status = MessageStatus::Pending;
            m.attempt = 0;
            m.max_attempts = max_attempts;
        })?)
    }

    async fn run_and_finish(
        &self,
        message: &OutboundMessage,
        contact: Contact,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<OutboundMessage, DeliveryError> {
        let recipient = contact.public_key;
        let flood_before = contact.is_flood();

        let RetryOutcome {
            delivered,
            routing_notified,
        } = self
            .run_retry_loop(message, recipient, retry, cancel)
            .await?;

        let finished = if delivered {
            self.store.update_message(&message.id, &mut |m| {
                m.status = MessageStatus::Delivered;
            })?
        } else {
            self.mark_failed(&message.id, true);
            self.store
                .get_message(&message.id)?
                .ok_or(DeliveryError::MessageNotFound(message.id))?
        };

        if !routing_notified {
            if let Some(flood_after) = self.is_flood(&recipient) {
                if flood_after != flood_before {
                    info!(
                        "Routing to {} changed to {}",
                        recipient,
                        if flood_after { "flood" } else { "direct" }
                    );
                    if let Some(delegate) = self.delegate() {
                        delegate.on_routing_changed(recipient, flood_after);
                    }
                }
            }
        }

        Ok(finished)
    }

    async fn broadcast(
        &self,
        message: &OutboundMessage,
        slot: u8,
    ) -> Result<OutboundMessage, DeliveryError> {
        self.store.update_message(&message.id, &mut |m| {
            m.status = MessageStatus::Sending;
            m.attempt = 1;
        })?;

        let sent = match self
            .transport
            .send_channel_message(slot, &message.text, unix_timestamp() as u32)
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Broadcast on slot {} failed: {}", slot, e);
                self.mark_failed(&message.id, false);
                return Err(e.into());
            }
        };

        let timeout = ack_wait_timeout(self.config.ack_timeout_floor(), sent.suggested_timeout_ms);
        self.track_sent(&message.id, &sent.ack_code, timeout, true)
    }

    /// Persist the sent state, then register the token
    fn track_sent(
        &self,
        message_id: &MessageId,
        ack_code: &[u8],
        timeout: Duration,
        broadcast: bool,
    ) -> Result<OutboundMessage, DeliveryError> {
        let token = AckToken::from_blob(ack_code);
        let message = self.store.update_message(message_id, &mut |m| {
            m.status = MessageStatus::Sent;
            m.ack_token = token;
            m.sent_at = Some(unix_timestamp());
        })?;

        let Some(token) = token else {
            warn!("Device returned no ack token for message {}", message_id);
            return Ok(message);
        };

        let mut ack = PendingAck::new(token, *message_id, Instant::now(), timeout);
        if broadcast {
            ack = ack.broadcast();
        }
        let registration = self.tracker.lock().register(ack);
        match registration {
            Ok(Registration::Pending) => {
                debug!("Tracking token {} for message {}", token, message_id);
                Ok(message)
            }
            Ok(Registration::AlreadyDelivered { round_trip }) => {
                self.apply_delivered(*message_id, round_trip);
                Ok(self.store.get_message(message_id)?.unwrap_or(message))
            }
            Err(e) => {
                warn!("Cannot track message {}: {}", message_id, e);
                self.mark_failed(message_id, false);
                Err(e.into())
            }
        }
    }

    pub(super) fn apply_delivered(&self, message_id: MessageId, round_trip: Duration) {
        let round_trip_ms = round_trip.as_millis() as u64;
        if let Err(e) = self.store.update_message(&message_id, &mut |m| {
            m.status = MessageStatus::Delivered;
            m.round_trip_ms = Some(round_trip_ms);
        }) {
            warn!("Failed to persist delivery of {}: {}", message_id, e);
        }
        info!("Message {} delivered in {} ms", message_id, round_trip_ms);
        if let Some(delegate) = self.delegate() {
            delegate.on_delivered(message_id, round_trip);
        }
    }

    fn mark_failed(&self, message_id: &MessageId, notify: bool) {
        if let Err(e) = self.store.update_message(message_id, &mut |m| {
            m.status = MessageStatus::Failed;
        }) {
            warn!("Failed to persist failure of {}: {}", message_id, e);
        }
        if notify {
            if let Some(delegate) = self.delegate() {
                delegate.on_delivery_failed(*message_id);
            }
        }
    }

    fn handle_ack(&self, token: AckToken) -> AckOutcome {
        let outcome = self.tracker.lock().handle_ack(token, Instant::now());
        match &outcome {
            AckOutcome::Unknown => debug!("Ignoring ack for untracked token {}", token),
            AckOutcome::Delivered {
                message_id,
                round_trip,
            } => self.apply_delivered(*message_id, *round_trip),
            AckOutcome::HeardRepeat { message_id, count } => {
                let mut heard = *count;
                match self.store.update_message(message_id, &mut |m| m.heard_repeats += 1) {
                    Ok(updated) => heard = updated.heard_repeats,
                    Err(e) => warn!("Failed to persist repeat of {}: {}", message_id, e),
                }
                debug!("Message {} heard {} times", message_id, heard);
                if let Some(delegate) = self.delegate() {
                    delegate.on_heard_repeat(*message_id, heard);
                }
            }
        }
        outcome
    }

    fn run_expiry_sweep(&self) -> SweepOutcome {
        let outcome = self
            .tracker
            .lock()
            .sweep(Instant::now(), self.config.delivered_grace());
        for message_id in &outcome.expired {
            info!("Message {} expired without acknowledgement", message_id);
            self.mark_failed(message_id, true);
        }
        if outcome.purged > 0 || outcome.dropped_broadcasts > 0 {
            debug!(
                "Sweep purged {} delivered and {} broadcast entries",
                outcome.purged, outcome.dropped_broadcasts
            );
        }
        outcome
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Acknowledgement { code } => match AckToken::from_blob(&code) {
                Some(token) => {
                    self.handle_ack(token);
                }
                None => debug!("Ack code too short: {} bytes", code.len()),
            },
            TransportEvent::ContactMessage(received) => self.handle_contact_message(received),
            TransportEvent::ChannelMessage {
                slot,
                text,
                sender_timestamp,
            } => {
                let message = IncomingMessage::new(
                    self.device_id,
                    MessageSource::Channel { slot },
                    &text,
                    sender_timestamp,
                );
                self.record_incoming(message);
            }
            TransportEvent::MessagesWaiting => self.spawn_drain(),
            _ => {}
        }
    }

    fn handle_contact_message(&self, received: ReceivedText) {
        // CLI replies belong to the session manager
        if received.text_type == TextType::CliData {
            return;
        }
        let sender = match self
            .store
            .contact_by_prefix(&self.device_id, received.sender_prefix.sender_prefix())
        {
            Ok(contact) => contact.map(|c| c.public_key),
            Err(e) => {
                warn!("Sender lookup failed: {}", e);
                None
            }
        };
        let message = IncomingMessage::new(
            self.device_id,
            MessageSource::Contact {
                sender_prefix: received.sender_prefix,
                sender,
            },
            &received.text,
            received.sender_timestamp,
        );
        self.record_incoming(message);
    }

    fn record_incoming(&self, message: IncomingMessage) {
        match self.store.record_incoming(&message) {
            Ok(true) => {
                if let Some(delegate) = self.delegate() {
                    delegate.on_message_received(message);
                }
            }
            Ok(false) => debug!("Duplicate incoming message {}", message.dedup_key()),
            Err(e) => warn!("Failed to store incoming message: {}", e),
        }
    }

    /// Pull buffered messages off the device; they come back as events
    fn spawn_drain(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut fetched = 0;
            while fetched < MAX_DRAIN_PER_SIGNAL && !*shutdown.borrow() {
                let next = tokio::select! {
                    next = inner.transport.sync_next_message() => next,
                    _ = shutdown.changed() => {
                        debug!("Drain stopped by shutdown");
                        break;
                    }
                };
                match next {
                    Ok(true) => fetched += 1,
                    Ok(false) => break,
                    Err(e) => {
                        warn!("Draining device messages failed: {}", e);
                        break;
                    }
                }
            }
            debug!("Drained {} buffered messages", fetched);
            inner.draining.store(false, Ordering::Release);
        });
        *self.drain_task.lock() = Some(handle);
    }
}

fn spawn_listener(
    inner: Arc<EngineInner>,
    mut events: broadcast::Receiver<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => inner.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Delivery listener lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Transport event stream closed");
                        return;
                    }
                },
                _ = shutdown.changed() => {
                    debug!("Delivery listener shutting down");
                    return;
                }
            }
        }
    })
}

fn spawn_sweep(
    inner: Arc<EngineInner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    inner.run_expiry_sweep();
                }
                _ = shutdown.changed() => {
                    debug!("Expiry sweep shutting down");
                    return;
                }
            }
        }
    })
}
