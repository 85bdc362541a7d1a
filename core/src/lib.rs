// MeshLink Core — companion-app protocol engine for packet-radio mesh nodes
//
// Turns a lossy, half-duplex radio link into acknowledged message delivery,
// authenticated sessions with repeaters and room servers, and a mirrored
// channel table. The radio itself sits behind the `Transport` trait.

pub mod channels;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod identity;
pub mod logging;
pub mod message;
pub mod secrets;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod transport;

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use channels::{ChannelSyncManager, ChannelSyncReport, SyncError};
pub use config::CompanionConfig;
pub use delivery::{DeliveryDelegate, DeliveryError, MessageDeliveryEngine};
pub use identity::{Contact, ContactKind, DeviceId, KeyPrefix, PublicKey};
pub use message::{AckToken, MessageId, MessageStatus, OutboundMessage};
pub use secrets::{BackendSecretStore, MemorySecretStore, SecretStore};
pub use session::{RemoteSessionManager, SessionDelegate, SessionError, SessionId};
pub use store::{KvStore, Persistence, StoreError};
pub use transport::{Transport, TransportError, TransportEvent};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompanionError {
    #[error("Already running")]
    AlreadyRunning,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<anyhow::Error> for CompanionError {
    fn from(err: anyhow::Error) -> Self {
        CompanionError::Config(format!("{:#}", err))
    }
}

// ============================================================================
// COMPANION
// ============================================================================

/// Everything one connected radio needs: delivery engine, session manager
/// and channel sync sharing a transport and a store.
#[derive(Clone)]
pub struct Companion {
    device_id: DeviceId,
    store: Arc<dyn Persistence>,
    delivery: MessageDeliveryEngine,
    sessions: RemoteSessionManager,
    channels: Arc<ChannelSyncManager>,
    running: Arc<RwLock<bool>>,
}

impl Companion {
    pub fn new(
        device_id: DeviceId,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Persistence>,
        secrets: Arc<dyn SecretStore>,
        config: &CompanionConfig,
    ) -> Self {
        let delivery = MessageDeliveryEngine::new(
            device_id,
            transport.clone(),
            store.clone(),
            config.delivery.clone(),
        );
        let sessions = RemoteSessionManager::new(
            device_id,
            transport.clone(),
            store.clone(),
            secrets,
            config.session.clone(),
        );
        let channels = Arc::new(ChannelSyncManager::new(
            device_id,
            transport,
            store.clone(),
            config.sync.clone(),
        ));
        Self {
            device_id,
            store,
            delivery,
            sessions,
            channels,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Companion with nothing persisted beyond the process
    pub fn in_memory(
        device_id: DeviceId,
        transport: Arc<dyn Transport>,
        config: &CompanionConfig,
    ) -> Self {
        Self::new(
            device_id,
            transport,
            Arc::new(KvStore::in_memory()),
            Arc::new(MemorySecretStore::new()),
            config,
        )
    }

    /// Companion backed by sled at `config.storage_path`, or the platform
    /// data directory when unset. Passwords share the same database.
    pub fn open(
        device_id: DeviceId,
        transport: Arc<dyn Transport>,
        config: &CompanionConfig,
    ) -> Result<Self, CompanionError> {
        let path = match &config.storage_path {
            Some(path) => PathBuf::from(path),
            None => CompanionConfig::data_dir()?.join("store"),
        };
        let backend: Arc<dyn store::StorageBackend> = Arc::new(store::SledStorage::open(&path)?);
        tracing::info!("Opened store at {}", path.display());

        Ok(Self::new(
            device_id,
            transport,
            Arc::new(KvStore::new(backend.clone())),
            Arc::new(BackendSecretStore::new(backend)),
            config,
        ))
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Start the background listeners. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), CompanionError> {
        let mut running = self.running.write();
        if *running {
            return Err(CompanionError::AlreadyRunning);
        }
        tracing::info!("Companion for device {} starting", self.device_id);
        self.delivery.start();
        self.sessions.start();
        *running = true;
        Ok(())
    }

    pub async fn stop(&self) {
        {
            let mut running = self.running.write();
            if !*running {
                return;
            }
            *running = false;
        }
        tracing::info!("Companion for device {} stopping", self.device_id);
        self.sessions.shutdown().await;
        self.delivery.shutdown().await;
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    // ------------------------------------------------------------------------
    // COMPONENTS
    // ------------------------------------------------------------------------

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn delivery(&self) -> &MessageDeliveryEngine {
        &self.delivery
    }

    pub fn sessions(&self) -> &RemoteSessionManager {
        &self.sessions
    }

    pub fn channels(&self) -> &ChannelSyncManager {
        &self.channels
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    /// Route callbacks from every component to one delegate
    pub fn set_delegate<D>(&self, delegate: Option<Arc<D>>)
    where
        D: DeliveryDelegate + SessionDelegate + 'static,
    {
        match delegate {
            Some(delegate) => {
                self.delivery.set_delegate(Some(delegate.clone()));
                self.sessions.set_delegate(Some(delegate));
            }
            None => {
                self.delivery.set_delegate(None);
                self.sessions.set_delegate(None);
            }
        }
    }

    // ------------------------------------------------------------------------
    // LINK EVENTS
    // ------------------------------------------------------------------------

    /// The radio link dropped; returns the sessions to restore later
    pub fn link_lost(&self) -> Result<Vec<SessionId>, CompanionError> {
        Ok(self.sessions.handle_disconnection()?)
    }

    /// The radio link is back: log in again to `sessions`
    pub async fn link_restored(
        &self,
        sessions: &[SessionId],
    ) -> Vec<(SessionId, Result<session::RemoteSession, SessionError>)> {
        self.sessions.handle_reconnection(sessions).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
