// Session module — logins, keep-alives and remote CLI for repeaters and rooms

pub mod cli;
mod keepalive;
pub mod manager;
pub mod pending;
pub mod timeout;
pub mod types;

pub use cli::{CliDispatch, PendingCliTable, ResponseGrammar};
pub use manager::{LoginResponse, RemoteSessionManager};
pub use pending::{PendingSlots, SlotResult};
pub use timeout::login_timeout;
pub use types::{PermissionLevel, RemoteSession, SessionId, SessionRole, SessionState};

use crate::identity::{KeyPrefix, PublicKey};
use crate::store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("No saved password for {0}")]
    NoCredential(PublicKey),
    #[error("Login timed out")]
    LoginTimeout,
    #[error("Login rejected")]
    LoginRejected,
    #[error("Request superseded by a newer one")]
    Superseded,
    #[error("Permission dropped from {before:?} to {after:?} on re-login")]
    PermissionDowngraded {
        before: PermissionLevel,
        after: PermissionLevel,
    },
    #[error("Session {0} is not connected")]
    NotConnected(SessionId),
    #[error("Command timed out")]
    CliTimeout,
    #[error("A raw command is already pending for this node")]
    RawCliBusy,
    #[error("Status request timed out")]
    StatusTimeout,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Failures shown to the user as "wrong password": the firmware gives no
    /// way to tell a silent rejection from a lost reply
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::LoginTimeout | Self::LoginRejected)
    }
}

/// Callbacks for session changes; implementations must not block
pub trait SessionDelegate: Send + Sync {
    fn on_session_state_changed(&self, _session_id: SessionId, _state: SessionState) {}
    /// A CLI reply no pending request accepted
    fn on_unmatched_cli_response(&self, _prefix: KeyPrefix, _text: String) {}
    fn on_permission_downgraded(
        &self,
        _session_id: SessionId,
        _before: PermissionLevel,
        _after: PermissionLevel,
    ) {
    }
}
