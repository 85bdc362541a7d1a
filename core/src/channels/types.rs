// Channel records and per-sync reporting

use crate::identity::DeviceId;
use crate::transport::{ChannelInfo, TransportError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A channel slot as mirrored locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub device_id: DeviceId,
    pub index: u8,
    pub name: String,
    pub secret: [u8; 16],
}

impl ChannelRecord {
    pub fn from_info(device_id: DeviceId, info: &ChannelInfo) -> Self {
        Self {
            device_id,
            index: info.index,
            name: info.name.clone(),
            secret: info.secret,
        }
    }

    pub fn to_info(&self) -> ChannelInfo {
        ChannelInfo {
            index: self.index,
            name: self.name.clone(),
            secret: self.secret,
        }
    }
}

/// Why a single slot could not be synced
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelSlotError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Skipped: too many consecutive link failures")]
    CircuitOpen,
    #[error("Storage error: {0}")]
    Storage(String),
}

/// A slot that failed during a sync pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSyncFailure {
    pub index: u8,
    pub error: ChannelSlotError,
}

/// Outcome of a sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSyncReport {
    /// Slots fetched and stored
    pub synced: Vec<u8>,
    /// Slots the device reports as unconfigured (local copy removed)
    pub cleared: Vec<u8>,
    /// Slots that could not be synced
    pub failures: Vec<ChannelSyncFailure>,
    /// Whether the circuit breaker cut the pass short
    pub circuit_opened: bool,
    /// Local slots dropped because they exceed the device's capacity
    pub trimmed: Vec<u8>,
}

impl ChannelSyncReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Indices worth handing to a retry pass
    pub fn failed_indices(&self) -> Vec<u8> {
        self.failures.iter().map(|f| f.index).collect()
    }
}
