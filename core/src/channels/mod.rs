// Channels module — device channel slots mirrored locally

pub mod sync;
pub mod types;

pub use sync::{backoff_delay, ChannelSyncManager, MAX_CHANNEL_NAME_BYTES};
pub use types::{ChannelRecord, ChannelSlotError, ChannelSyncFailure, ChannelSyncReport};

use crate::store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("A channel sync is already running")]
    SyncInProgress,
    #[error("Channel name is {len} bytes, limit is {max}")]
    NameTooLong { len: usize, max: usize },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}
