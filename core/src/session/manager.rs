// Remote session manager
//
// One instance per device. Login, status and CLI replies all come back on
// the transport's event stream keyed by a 6-byte key prefix; every request
// registers its waiter before the send so a fast reply cannot be lost.

use super::cli::{CliDispatch, PendingCliTable};
use super::keepalive::{spawn_keep_alive, KeepAliveHandle, KeepAliveTick};
use super::pending::{PendingSlots, SlotResult};
use super::timeout::login_timeout;
use super::types::{PermissionLevel, RemoteSession, SessionId, SessionRole, SessionState};
use super::{SessionDelegate, SessionError};
use crate::config::SessionConfig;
use crate::identity::{Contact, DeviceId, KeyPrefix, PublicKey};
use crate::message::types::unix_timestamp;
use crate::message::TextType;
use crate::secrets::SecretStore;
use crate::store::Persistence;
use crate::transport::{RemoteStatus, Transport, TransportEvent};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Login result as reported by the remote node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginResponse {
    pub success: bool,
    pub is_admin: bool,
    pub acl: Option<u8>,
}

pub(super) struct ManagerInner {
    device_id: DeviceId,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Persistence>,
    secrets: Arc<dyn SecretStore>,
    config: SessionConfig,
    logins: PendingSlots<LoginResponse>,
    statuses: PendingSlots<RemoteStatus>,
    raw_cli: PendingSlots<String>,
    cli: Mutex<PendingCliTable>,
    states: Mutex<HashMap<SessionId, SessionState>>,
    keep_alives: Mutex<HashMap<SessionId, KeepAliveHandle>>,
    keep_alive_generation: AtomicU64,
    /// Permission held by each session when the link dropped
    disconnect_snapshot: Mutex<HashMap<SessionId, PermissionLevel>>,
    reconnecting: AtomicBool,
    delegate: RwLock<Option<Arc<dyn SessionDelegate>>>,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Session manager bound to one device
#[derive(Clone)]
pub struct RemoteSessionManager {
    inner: Arc<ManagerInner>,
}

/// Removes one CLI request from the queue when dropped
struct CliRequestGuard<'a> {
    table: &'a Mutex<PendingCliTable>,
    prefix: KeyPrefix,
    id: u64,
}

impl Drop for CliRequestGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(&self.prefix, self.id);
    }
}

/// Clears the reconnection flag when dropped
struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RemoteSessionManager {
    pub fn new(
        device_id: DeviceId,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Persistence>,
        secrets: Arc<dyn SecretStore>,
        config: SessionConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ManagerInner {
                device_id,
                transport,
                store,
                secrets,
                config,
                logins: PendingSlots::new(),
                statuses: PendingSlots::new(),
                raw_cli: PendingSlots::new(),
                cli: Mutex::new(PendingCliTable::new()),
                states: Mutex::new(HashMap::new()),
                keep_alives: Mutex::new(HashMap::new()),
                keep_alive_generation: AtomicU64::new(0),
                disconnect_snapshot: Mutex::new(HashMap::new()),
                reconnecting: AtomicBool::new(false),
                delegate: RwLock::new(None),
                shutdown,
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn SessionDelegate>>) {
        *self.inner.delegate.write() = delegate;
    }

    /// Spawn the event listener. No-op while running.
    pub fn start(&self) {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return;
        }
        self.inner.shutdown.send_replace(false);
        let events = self.inner.transport.subscribe();
        *listener = Some(spawn_listener(
            self.inner.clone(),
            events,
            self.inner.shutdown.subscribe(),
        ));
        info!("Session manager started for device {}", self.inner.device_id);
    }

    /// Stop the listener and every keep-alive
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let handles: Vec<KeepAliveHandle> = self
            .inner
            .keep_alives
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.stop();
        }
        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }
        info!("Session manager stopped for device {}", self.inner.device_id);
    }

    /// Find the session for `key`, creating it if needed. Duplicates left by
    /// earlier races are deleted, keeping the oldest.
    pub fn find_or_create_session(
        &self,
        key: &PublicKey,
        role: SessionRole,
    ) -> Result<RemoteSession, SessionError> {
        self.inner.find_or_create_session(key, role)
    }

    /// Find or create the session for `key` and log in
    pub async fn connect(
        &self,
        key: &PublicKey,
        role: SessionRole,
        password: Option<&str>,
        path_hint: Option<u8>,
    ) -> Result<RemoteSession, SessionError> {
        let session = self.inner.find_or_create_session(key, role)?;
        self.inner.login(&session.id, password, path_hint).await
    }

    /// Log in to a session's node.
    ///
    /// Without `password` the saved credential is used. `path_hint` is the
    /// hop count when the caller knows it; otherwise the cached route decides.
    pub async fn login(
        &self,
        session_id: &SessionId,
        password: Option<&str>,
        path_hint: Option<u8>,
    ) -> Result<RemoteSession, SessionError> {
        self.inner.login(session_id, password, path_hint).await
    }

    pub async fn logout(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let session = self.inner.session(session_id)?;
        self.inner.stop_keep_alive(session_id);
        let sent = self.inner.transport.send_logout(&session.public_key).await;
        self.inner.set_disconnected(session_id)?;
        info!("Logged out of session {}", session_id);
        Ok(sent?)
    }

    /// Send a CLI command and wait for the reply its grammar accepts
    pub async fn send_cli_command(
        &self,
        session_id: &SessionId,
        command: &str,
    ) -> Result<String, SessionError> {
        let inner = &self.inner;
        let session = inner.connected_session(session_id)?;
        let key = session.public_key;
        let prefix = key.prefix();

        let (id, reply) = inner.cli.lock().register(prefix, command);
        let _guard = CliRequestGuard {
            table: &inner.cli,
            prefix,
            id,
        };

        inner
            .transport
            .send_command(&key, command, unix_timestamp() as u32)
            .await?;

        inner
            .poll_for_reply(async move { reply.await.ok() })
            .await
            .ok_or(SessionError::CliTimeout)
    }

    /// Send a command whose first reply is taken verbatim. One at a time per node.
    pub async fn send_raw_cli(
        &self,
        session_id: &SessionId,
        command: &str,
    ) -> Result<String, SessionError> {
        let inner = &self.inner;
        let session = inner.connected_session(session_id)?;
        let key = session.public_key;

        let (_guard, reply) = inner
            .raw_cli
            .try_register(key.prefix())
            .ok_or(SessionError::RawCliBusy)?;

        inner
            .transport
            .send_command(&key, command, unix_timestamp() as u32)
            .await?;

        inner
            .poll_for_reply(async move {
                match reply.await {
                    Ok(SlotResult::Resolved(text)) => Some(text),
                    _ => None,
                }
            })
            .await
            .ok_or(SessionError::CliTimeout)
    }

    /// Ask the node for its status block
    pub async fn request_status(
        &self,
        session_id: &SessionId,
    ) -> Result<RemoteStatus, SessionError> {
        let inner = &self.inner;
        let session = inner.session(session_id)?;
        let key = session.public_key;

        let (_guard, reply) = inner.statuses.register(key.prefix());
        inner.transport.request_status(&key).await?;

        match tokio::time::timeout(inner.config.status_timeout(), reply).await {
            Ok(Ok(SlotResult::Resolved(status))) => Ok(status),
            Ok(Ok(SlotResult::Superseded)) | Ok(Err(_)) => Err(SessionError::Superseded),
            Err(_) => Err(SessionError::StatusTimeout),
        }
    }

    /// Advance a room session's sync checkpoint; older values are ignored
    pub fn record_sync_checkpoint(
        &self,
        session_id: &SessionId,
        timestamp: u32,
    ) -> Result<RemoteSession, SessionError> {
        Ok(self.inner.store.update_session(session_id, &mut |s| {
            s.last_sync_timestamp = s.last_sync_timestamp.max(timestamp);
        })?)
    }

    /// The link to the device dropped: mark connected sessions disconnected
    /// and return them for a later [`handle_reconnection`](Self::handle_reconnection)
    pub fn handle_disconnection(&self) -> Result<Vec<SessionId>, SessionError> {
        let inner = &self.inner;
        let mut snapshot = Vec::new();
        for session in inner.store.sessions(&inner.device_id)? {
            if !session.connected {
                continue;
            }
            inner.stop_keep_alive(&session.id);
            inner.set_disconnected(&session.id)?;
            inner
                .disconnect_snapshot
                .lock()
                .insert(session.id, session.permission);
            snapshot.push(session.id);
        }
        info!("Link lost, {} sessions to reconnect", snapshot.len());
        Ok(snapshot)
    }

    /// Log back in to the given sessions concurrently.
    ///
    /// A call made while another reconnection is running returns nothing.
    /// A session that comes back with less permission than it had is
    /// reported as [`SessionError::PermissionDowngraded`] and left
    /// disconnected.
    pub async fn handle_reconnection(
        &self,
        session_ids: &[SessionId],
    ) -> Vec<(SessionId, Result<RemoteSession, SessionError>)> {
        let inner = &self.inner;
        if inner.reconnecting.swap(true, Ordering::AcqRel) {
            debug!("Reconnection already running");
            return Vec::new();
        }
        let _flag = ReconnectGuard(&inner.reconnecting);

        let attempts = session_ids.iter().map(|id| async move {
            let result = inner.reauthenticate(id).await;
            if let Err(e) = &result {
                warn!("Reconnecting session {} failed: {}", id, e);
            }
            (*id, result)
        });
        join_all(attempts).await
    }

    pub fn session(&self, session_id: &SessionId) -> Result<RemoteSession, SessionError> {
        self.inner.session(session_id)
    }

    pub fn sessions(&self) -> Result<Vec<RemoteSession>, SessionError> {
        Ok(self.inner.store.sessions(&self.inner.device_id)?)
    }

    pub fn session_state(&self, session_id: &SessionId) -> SessionState {
        self.inner.state_of(session_id)
    }

    pub fn has_keep_alive(&self, session_id: &SessionId) -> bool {
        self.inner.keep_alives.lock().contains_key(session_id)
    }

    pub fn pending_cli_count(&self, key: &PublicKey) -> usize {
        self.inner.cli.lock().pending_count(&key.prefix())
    }

    /// Apply one transport event
    pub fn handle_event(&self, event: TransportEvent) {
        self.inner.handle_event(event);
    }
}

impl ManagerInner {
    fn delegate(&self) -> Option<Arc<dyn SessionDelegate>> {
        self.delegate.read().clone()
    }

    fn session(&self, session_id: &SessionId) -> Result<RemoteSession, SessionError> {
        self.store
            .get_session(session_id)?
            .ok_or(SessionError::SessionNotFound(*session_id))
    }

    fn connected_session(&self, session_id: &SessionId) -> Result<RemoteSession, SessionError> {
        let session = self.session(session_id)?;
        if !session.connected {
            return Err(SessionError::NotConnected(*session_id));
        }
        Ok(session)
    }

    fn state_of(&self, session_id: &SessionId) -> SessionState {
        if let Some(state) = self.states.lock().get(session_id) {
            return *state;
        }
        match self.store.get_session(session_id) {
            Ok(Some(session)) if session.connected => SessionState::Connected,
            _ => SessionState::Disconnected,
        }
    }

    fn set_state(&self, session_id: &SessionId, state: SessionState) {
        let previous = self.states.lock().insert(*session_id, state);
        if previous != Some(state) {
            debug!("Session {} is {}", session_id, state);
            if let Some(delegate) = self.delegate() {
                delegate.on_session_state_changed(*session_id, state);
            }
        }
    }

    fn set_disconnected(&self, session_id: &SessionId) -> Result<(), SessionError> {
        self.store
            .update_session(session_id, &mut |s| s.connected = false)?;
        self.set_state(session_id, SessionState::Disconnected);
        Ok(())
    }

    fn find_or_create_session(
        &self,
        key: &PublicKey,
        role: SessionRole,
    ) -> Result<RemoteSession, SessionError> {
        let mut existing = self.store.sessions_for_key(&self.device_id, key)?;
        if existing.is_empty() {
            let session = RemoteSession::new(
                self.device_id,
                *key,
                role,
                self.config.keep_alive_interval_secs,
            );
            self.store.save_session(&session)?;
            info!("Created {:?} session {} for {}", role, session.id, key);
            return Ok(session);
        }

        let kept = existing.remove(0);
        for duplicate in existing {
            warn!(
                "Removing duplicate session {} for {} (keeping {})",
                duplicate.id, key, kept.id
            );
            self.stop_keep_alive(&duplicate.id);
            self.states.lock().remove(&duplicate.id);
            self.store.delete_session(&duplicate.id)?;
        }
        Ok(kept)
    }

    /// Cached route for a node, fetched from the device when not cached
    async fn route_to(&self, key: &PublicKey) -> Option<Contact> {
        match self.store.get_contact(&self.device_id, key) {
            Ok(Some(contact)) => return Some(contact),
            Ok(None) => {}
            Err(e) => warn!("Failed to read contact {}: {}", key, e),
        }
        match self.transport.get_contact(key).await {
            Ok(Some(mut contact)) => {
                contact.device_id = self.device_id;
                if let Err(e) = self.store.save_contact(&contact) {
                    warn!("Failed to cache contact {}: {}", key, e);
                }
                Some(contact)
            }
            Ok(None) => None,
            Err(e) => {
                debug!("Route lookup for {} failed: {}", key, e);
                None
            }
        }
    }

    async fn login(
        self: &Arc<Self>,
        session_id: &SessionId,
        password: Option<&str>,
        path_hint: Option<u8>,
    ) -> Result<RemoteSession, SessionError> {
        let session = self.session(session_id)?;
        let key = session.public_key;

        let explicit = password.is_some();
        let password = match password {
            Some(password) => Zeroizing::new(password.to_string()),
            None => self
                .secrets
                .retrieve(&key)?
                .ok_or(SessionError::NoCredential(key))?,
        };

        let hops = match path_hint {
            Some(hops) => Some(hops),
            None => self.route_to(&key).await.and_then(|c| c.hop_count()),
        };
        let timeout = login_timeout(hops, &self.config);

        self.stop_keep_alive(session_id);
        self.set_state(session_id, SessionState::LoggingIn);

        let (_guard, reply) = self.logins.register(key.prefix());
        if let Err(e) = self.transport.send_login(&key, &password).await {
            warn!("Login send to {} failed: {}", key, e);
            self.set_disconnected(session_id)?;
            return Err(e.into());
        }
        debug!("Waiting {:?} for login result from {}", timeout, key);

        let response = match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(SlotResult::Resolved(response))) => response,
            Ok(Ok(SlotResult::Superseded)) | Ok(Err(_)) => {
                debug!("Login to {} superseded", key);
                return Err(SessionError::Superseded);
            }
            Err(_) => {
                info!("Login to {} timed out after {:?}", key, timeout);
                self.set_disconnected(session_id)?;
                return Err(SessionError::LoginTimeout);
            }
        };

        if !response.success {
            info!("Login to {} rejected", key);
            self.set_disconnected(session_id)?;
            return Err(SessionError::LoginRejected);
        }

        let permission = PermissionLevel::from_login(response.is_admin, response.acl);
        let session = self.store.update_session(session_id, &mut |s| {
            s.connected = true;
            s.permission = permission;
        })?;

        if explicit {
            if let Err(e) = self.secrets.store(&key, &password) {
                warn!("Failed to save password for {}: {}", key, e);
            }
        }
        if session.is_room() {
            self.start_keep_alive(&session);
        }
        self.set_state(session_id, SessionState::Connected);
        info!("Logged in to {} as {:?}", key, permission);
        Ok(session)
    }

    async fn reauthenticate(
        self: &Arc<Self>,
        session_id: &SessionId,
    ) -> Result<RemoteSession, SessionError> {
        let before = self.disconnect_snapshot.lock().remove(session_id);
        let session = self.login(session_id, None, None).await?;

        match before {
            Some(before) if session.permission < before => {
                warn!(
                    "Session {} came back as {:?}, was {:?}",
                    session_id, session.permission, before
                );
                self.stop_keep_alive(session_id);
                self.set_disconnected(session_id)?;
                if let Some(delegate) = self.delegate() {
                    delegate.on_permission_downgraded(*session_id, before, session.permission);
                }
                Err(SessionError::PermissionDowngraded {
                    before,
                    after: session.permission,
                })
            }
            _ => Ok(session),
        }
    }

    fn start_keep_alive(self: &Arc<Self>, session: &RemoteSession) {
        // Configuration wins over whatever period the record was created with
        let interval = self.config.keep_alive_interval().max(Duration::from_secs(1));
        if session.keep_alive_interval_secs != interval.as_secs() {
            let secs = interval.as_secs();
            if let Err(e) = self
                .store
                .update_session(&session.id, &mut |s| s.keep_alive_interval_secs = secs)
            {
                warn!("Failed to record keep-alive period of {}: {}", session.id, e);
            }
        }
        let generation = self.keep_alive_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = spawn_keep_alive(
            self.clone(),
            session.id,
            session.public_key,
            interval,
            generation,
        );
        if let Some(previous) = self.keep_alives.lock().insert(session.id, handle) {
            previous.stop();
        }
    }

    fn stop_keep_alive(&self, session_id: &SessionId) {
        let handle = self.keep_alives.lock().remove(session_id);
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    pub(super) async fn keep_alive_tick(
        &self,
        session_id: &SessionId,
        key: &PublicKey,
    ) -> Result<KeepAliveTick, SessionError> {
        match self.route_to(key).await {
            Some(contact) if !contact.is_flood() => {}
            _ => return Ok(KeepAliveTick::Skipped),
        }
        let since = self.session(session_id)?.last_sync_timestamp;
        self.transport.send_keep_alive(key, since).await?;
        Ok(KeepAliveTick::Sent)
    }

    /// A keep-alive loop ended on error; only its own registration is removed
    pub(super) fn keep_alive_failed(&self, session_id: &SessionId, generation: u64) {
        {
            let mut keep_alives = self.keep_alives.lock();
            if keep_alives
                .get(session_id)
                .is_some_and(|h| h.generation == generation)
            {
                keep_alives.remove(session_id);
            } else {
                return;
            }
        }
        if let Err(e) = self.set_disconnected(session_id) {
            warn!("Failed to mark session {} disconnected: {}", session_id, e);
        }
    }

    /// Wait for `reply`, pulling buffered messages off the device meanwhile
    async fn poll_for_reply<F>(&self, reply: F) -> Option<String>
    where
        F: Future<Output = Option<String>>,
    {
        tokio::pin!(reply);
        let deadline = tokio::time::sleep(self.config.cli_timeout());
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.config.cli_poll_interval());

        loop {
            tokio::select! {
                text = &mut reply => return text,
                _ = &mut deadline => return None,
                _ = poll.tick() => {
                    if let Err(e) = self.transport.sync_next_message().await {
                        debug!("Polling for CLI reply failed: {}", e);
                    }
                }
            }
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LoginSuccess {
                prefix,
                is_admin,
                acl,
            } => {
                let response = LoginResponse {
                    success: true,
                    is_admin,
                    acl,
                };
                if !self.logins.resolve(&prefix, response) {
                    debug!("Dropping unmatched login result for {}", prefix);
                }
            }
            TransportEvent::LoginFailed { prefix } => {
                let response = LoginResponse {
                    success: false,
                    is_admin: false,
                    acl: None,
                };
                if !self.logins.resolve(&prefix, response) {
                    debug!("Dropping unmatched login failure for {}", prefix);
                }
            }
            TransportEvent::StatusResponse { prefix, status } => {
                if !self.statuses.resolve(&prefix, status) {
                    debug!("Dropping unmatched status response for {}", prefix);
                }
            }
            TransportEvent::ContactMessage(received) if received.text_type == TextType::CliData => {
                self.dispatch_cli_reply(received.sender_prefix, received.text);
            }
            _ => {}
        }
    }

    fn dispatch_cli_reply(&self, prefix: KeyPrefix, text: String) {
        let dispatch = self.cli.lock().dispatch(&prefix, &text);
        match dispatch {
            CliDispatch::Resolved { id, command } => {
                debug!("CLI reply from {} resolved '{}' ({})", prefix, command, id);
            }
            CliDispatch::Unmatched => {
                if self.raw_cli.resolve(&prefix, text.clone()) {
                    return;
                }
                debug!("Unmatched CLI reply from {}", prefix);
                if let Some(delegate) = self.delegate() {
                    delegate.on_unmatched_cli_response(prefix, text);
                }
            }
        }
    }
}

fn spawn_listener(
    inner: Arc<ManagerInner>,
    mut events: broadcast::Receiver<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => inner.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Session listener lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Transport event stream closed");
                        return;
                    }
                },
                _ = shutdown.changed() => {
                    debug!("Session listener shutting down");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ContactKind, KeyPrefix};
    use crate::secrets::{MemorySecretStore, MockSecretStore};
    use crate::store::KvStore;
    use crate::testing::{LoginBehavior, MockTransport};

    fn manager_with(
        transport: Arc<MockTransport>,
        secrets: Arc<dyn SecretStore>,
    ) -> (RemoteSessionManager, DeviceId) {
        let device = uuid::Uuid::new_v4();
        let manager = RemoteSessionManager::new(
            device,
            transport,
            Arc::new(KvStore::in_memory()),
            secrets,
            SessionConfig::default(),
        );
        (manager, device)
    }

    fn repeater_key() -> PublicKey {
        PublicKey::from_bytes([0x42; 32])
    }

    #[tokio::test]
    async fn test_login_without_credential() {
        let transport = Arc::new(MockTransport::new());
        let (manager, _) = manager_with(transport.clone(), Arc::new(MemorySecretStore::new()));
        let session = manager
            .find_or_create_session(&repeater_key(), SessionRole::Repeater)
            .unwrap();

        let err = manager.login(&session.id, None, Some(1)).await.unwrap_err();
        assert_eq!(err, SessionError::NoCredential(repeater_key()));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_saved_password_is_used() {
        let transport = Arc::new(MockTransport::new());
        transport.set_login_behavior(
            repeater_key(),
            LoginBehavior::Accept {
                is_admin: true,
                acl: None,
            },
        );

        let mut secrets = MockSecretStore::new();
        secrets
            .expect_retrieve()
            .times(1)
            .returning(|_| Ok(Some(Zeroizing::new("saved".to_string()))));
        secrets.expect_store().never();

        let (manager, _) = manager_with(transport.clone(), Arc::new(secrets));
        manager.start();
        let session = manager
            .find_or_create_session(&repeater_key(), SessionRole::Repeater)
            .unwrap();

        let session = manager.login(&session.id, None, Some(0)).await.unwrap();
        assert!(session.connected);
        assert_eq!(session.permission, PermissionLevel::Admin);
        assert_eq!(transport.login_passwords(), vec!["saved".to_string()]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_explicit_password_saved_on_success() {
        let transport = Arc::new(MockTransport::new());
        transport.set_login_behavior(
            repeater_key(),
            LoginBehavior::Accept {
                is_admin: false,
                acl: Some(2),
            },
        );

        let mut secrets = MockSecretStore::new();
        secrets
            .expect_store()
            .withf(|key, password| *key == repeater_key() && password == "pw")
            .times(1)
            .returning(|_, _| Ok(()));

        let (manager, _) = manager_with(transport.clone(), Arc::new(secrets));
        manager.start();
        let session = manager
            .connect(&repeater_key(), SessionRole::Repeater, Some("pw"), Some(1))
            .await
            .unwrap();
        assert_eq!(session.permission, PermissionLevel::ReadWrite);
        assert_eq!(manager.session_state(&session.id), SessionState::Connected);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_login_rejected_is_authentication_failure() {
        let transport = Arc::new(MockTransport::new());
        transport.set_login_behavior(repeater_key(), LoginBehavior::Reject);
        let (manager, _) = manager_with(transport.clone(), Arc::new(MemorySecretStore::new()));
        manager.start();

        let err = manager
            .connect(&repeater_key(), SessionRole::Repeater, Some("bad"), Some(0))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::LoginRejected);
        assert!(err.is_authentication_failure());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_timeout_scales_with_hint() {
        let transport = Arc::new(MockTransport::new());
        transport.set_login_behavior(repeater_key(), LoginBehavior::Silent);
        let (manager, _) = manager_with(transport.clone(), Arc::new(MemorySecretStore::new()));
        manager.start();

        let started = tokio::time::Instant::now();
        let err = manager
            .connect(&repeater_key(), SessionRole::Repeater, Some("pw"), Some(1))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::LoginTimeout);
        assert!(err.is_authentication_failure());
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_sessions_reconciled() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(KvStore::in_memory());
        let device = uuid::Uuid::new_v4();
        let mut older = RemoteSession::new(device, repeater_key(), SessionRole::Room, 90);
        older.created_at = 100;
        let mut newer = RemoteSession::new(device, repeater_key(), SessionRole::Room, 90);
        newer.created_at = 200;
        store.save_session(&newer).unwrap();
        store.save_session(&older).unwrap();

        let manager = RemoteSessionManager::new(
            device,
            transport,
            store.clone(),
            Arc::new(MemorySecretStore::new()),
            SessionConfig::default(),
        );
        let kept = manager
            .find_or_create_session(&repeater_key(), SessionRole::Room)
            .unwrap();
        assert_eq!(kept.id, older.id);
        assert_eq!(store.sessions(&device).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_login_result_dropped() {
        let transport = Arc::new(MockTransport::new());
        let (manager, _) = manager_with(transport, Arc::new(MemorySecretStore::new()));
        manager.handle_event(TransportEvent::LoginSuccess {
            prefix: KeyPrefix::from_bytes([1; 6]),
            is_admin: true,
            acl: None,
        });
        assert!(manager.sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cli_requires_connection() {
        let transport = Arc::new(MockTransport::new());
        transport.add_contact(Contact::new(
            uuid::Uuid::new_v4(),
            repeater_key(),
            "rpt",
            ContactKind::Repeater,
        ));
        let (manager, _) = manager_with(transport, Arc::new(MemorySecretStore::new()));
        let session = manager
            .find_or_create_session(&repeater_key(), SessionRole::Repeater)
            .unwrap();

        let err = manager.send_cli_command(&session.id, "ver").await.unwrap_err();
        assert_eq!(err, SessionError::NotConnected(session.id));
    }
}
