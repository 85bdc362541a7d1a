// Session types — authenticated sessions with repeaters and room servers

use crate::identity::{DeviceId, PublicKey};
use crate::message::types::unix_timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a remote session
pub type SessionId = uuid::Uuid;

/// Class of remote node a session is held with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionRole {
    Repeater,
    Room,
}

/// Access granted by the remote node.
///
/// Ordered from least to most privileged so a re-login can be checked for a
/// downgrade with a plain comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PermissionLevel {
    Guest,
    ReadOnly,
    ReadWrite,
    Admin,
}

impl PermissionLevel {
    /// Map a raw ACL byte; anything unrecognised is a guest
    pub fn from_acl(acl: u8) -> Self {
        match acl {
            1 => Self::ReadOnly,
            2 => Self::ReadWrite,
            3 => Self::Admin,
            _ => Self::Guest,
        }
    }

    /// Permission reported by a login result
    pub fn from_login(is_admin: bool, acl: Option<u8>) -> Self {
        if is_admin {
            return Self::Admin;
        }
        acl.map(Self::from_acl).unwrap_or(Self::Guest)
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    LoggingIn,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::LoggingIn => write!(f, "logging-in"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

/// A persisted session with a remote node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    pub id: SessionId,
    /// Device the session is held through
    pub device_id: DeviceId,
    /// Remote node's public key
    pub public_key: PublicKey,
    pub role: SessionRole,
    pub connected: bool,
    pub permission: PermissionLevel,
    /// Newest room post already synced (unix seconds); rooms only
    pub last_sync_timestamp: u32,
    /// Keep-alive period last applied to a room session
    pub keep_alive_interval_secs: u64,
    pub created_at: u64,
}

impl RemoteSession {
    pub fn new(
        device_id: DeviceId,
        public_key: PublicKey,
        role: SessionRole,
        keep_alive_interval_secs: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            device_id,
            public_key,
            role,
            connected: false,
            permission: PermissionLevel::Guest,
            last_sync_timestamp: 0,
            keep_alive_interval_secs,
            created_at: unix_timestamp(),
        }
    }

    pub fn is_room(&self) -> bool {
        self.role == SessionRole::Room
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_from_login() {
        assert_eq!(PermissionLevel::from_login(true, None), PermissionLevel::Admin);
        assert_eq!(PermissionLevel::from_login(true, Some(0)), PermissionLevel::Admin);
        assert_eq!(
            PermissionLevel::from_login(false, Some(2)),
            PermissionLevel::ReadWrite
        );
        assert_eq!(PermissionLevel::from_login(false, None), PermissionLevel::Guest);
        assert_eq!(PermissionLevel::from_login(false, Some(0x7f)), PermissionLevel::Guest);
    }

    #[test]
    fn test_permission_ordering() {
        assert!(PermissionLevel::Guest < PermissionLevel::ReadOnly);
        assert!(PermissionLevel::ReadWrite < PermissionLevel::Admin);
    }

    #[test]
    fn test_new_session_is_disconnected_guest() {
        let session = RemoteSession::new(
            uuid::Uuid::new_v4(),
            PublicKey::from_bytes([4u8; 32]),
            SessionRole::Room,
            90,
        );
        assert!(!session.connected);
        assert_eq!(session.permission, PermissionLevel::Guest);
        assert!(session.is_room());
    }
}
