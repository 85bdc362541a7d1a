// Channel sync — bulk slot fetch with backoff and a circuit breaker
//
// Slots are read one at a time. Transient failures (timeout, lost link) are
// retried per slot with exponential backoff; a run of them across slots
// trips the breaker and the rest of the pass is skipped without touching the
// radio.

use super::types::{ChannelRecord, ChannelSlotError, ChannelSyncFailure, ChannelSyncReport};
use super::SyncError;
use crate::config::SyncConfig;
use crate::crypto::{derive_channel_secret, PUBLIC_CHANNEL_NAME, PUBLIC_CHANNEL_SECRET};
use crate::identity::DeviceId;
use crate::store::Persistence;
use crate::transport::{ChannelInfo, Transport};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest channel name the device stores, in bytes
pub const MAX_CHANNEL_NAME_BYTES: usize = 31;

/// Delay before retry number `attempt` (0-based) of a single slot
pub fn backoff_delay(config: &SyncConfig, attempt: u32) -> Duration {
    let exponential = config
        .backoff_base_ms
        .saturating_mul(1u64 << attempt.min(10));
    let jitter = if config.backoff_jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=config.backoff_jitter_ms)
    };
    Duration::from_millis(exponential.saturating_add(jitter))
}

enum SlotOutcome {
    Synced,
    Cleared,
}

/// Clears the syncing flag when dropped
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, SyncError> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(SyncError::SyncInProgress);
        }
        Ok(Self(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps the local channel table in step with one device
pub struct ChannelSyncManager {
    device_id: DeviceId,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Persistence>,
    config: SyncConfig,
    syncing: AtomicBool,
}

impl ChannelSyncManager {
    pub fn new(
        device_id: DeviceId,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Persistence>,
        config: SyncConfig,
    ) -> Self {
        Self {
            device_id,
            transport,
            store,
            config,
            syncing: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Read slots `0..max_slots` from the device into the local table.
    ///
    /// Rejected with [`SyncError::SyncInProgress`] while another sync or
    /// retry pass runs. Local slots at or beyond `max_slots` are removed
    /// afterwards.
    pub async fn sync_channels(&self, max_slots: u8) -> Result<ChannelSyncReport, SyncError> {
        let _guard = SyncGuard::acquire(&self.syncing)?;
        info!("Syncing {} channel slots for device {}", max_slots, self.device_id);

        tokio::time::sleep(self.config.settle_delay()).await;
        let indices: Vec<u8> = (0..max_slots).collect();
        let mut report = self.run_pass(&indices, self.config.circuit_threshold).await;

        for record in self.store.channels(&self.device_id)? {
            if record.index >= max_slots {
                self.store.delete_channel(&self.device_id, record.index)?;
                report.trimmed.push(record.index);
            }
        }
        if !report.trimmed.is_empty() {
            info!("Removed channel slots beyond capacity: {:?}", report.trimmed);
        }

        log_report(&report);
        Ok(report)
    }

    /// Second pass over the slots a previous sync could not read
    pub async fn retry_failed_channels(
        &self,
        indices: &[u8],
    ) -> Result<ChannelSyncReport, SyncError> {
        let _guard = SyncGuard::acquire(&self.syncing)?;
        info!("Retrying {} channel slots", indices.len());

        tokio::time::sleep(self.config.retry_settle_delay()).await;
        let report = self
            .run_pass(indices, self.config.retry_circuit_threshold)
            .await;
        log_report(&report);
        Ok(report)
    }

    /// Write a private channel derived from `passphrase` to slot `index`
    pub async fn configure_channel(
        &self,
        index: u8,
        name: &str,
        passphrase: &str,
    ) -> Result<ChannelRecord, SyncError> {
        self.write_channel(index, name, derive_channel_secret(passphrase))
            .await
    }

    /// Write the well-known public channel to slot `index`
    pub async fn configure_public_channel(&self, index: u8) -> Result<ChannelRecord, SyncError> {
        self.write_channel(index, PUBLIC_CHANNEL_NAME, PUBLIC_CHANNEL_SECRET)
            .await
    }

    /// Locally known channels, by slot
    pub fn channels(&self) -> Result<Vec<ChannelRecord>, SyncError> {
        Ok(self.store.channels(&self.device_id)?)
    }

    async fn write_channel(
        &self,
        index: u8,
        name: &str,
        secret: [u8; 16],
    ) -> Result<ChannelRecord, SyncError> {
        if name.len() > MAX_CHANNEL_NAME_BYTES {
            return Err(SyncError::NameTooLong {
                len: name.len(),
                max: MAX_CHANNEL_NAME_BYTES,
            });
        }
        let info = ChannelInfo {
            index,
            name: name.to_string(),
            secret,
        };
        self.transport.set_channel(&info).await?;

        let record = ChannelRecord::from_info(self.device_id, &info);
        self.store.save_channel(&record)?;
        info!("Configured channel '{}' in slot {}", name, index);
        Ok(record)
    }

    async fn run_pass(&self, indices: &[u8], threshold: u32) -> ChannelSyncReport {
        let mut report = ChannelSyncReport::default();
        let mut consecutive_transient = 0u32;

        for (position, &index) in indices.iter().enumerate() {
            match self.fetch_slot(index).await {
                Ok(SlotOutcome::Synced) => {
                    consecutive_transient = 0;
                    report.synced.push(index);
                }
                Ok(SlotOutcome::Cleared) => {
                    consecutive_transient = 0;
                    report.cleared.push(index);
                }
                Err(error) => {
                    let transient =
                        matches!(&error, ChannelSlotError::Transport(e) if e.is_transient());
                    if transient {
                        consecutive_transient += 1;
                    } else {
                        consecutive_transient = 0;
                    }
                    warn!("Channel slot {} failed: {}", index, error);
                    report.failures.push(ChannelSyncFailure { index, error });

                    if transient && consecutive_transient >= threshold {
                        let skipped = &indices[position + 1..];
                        warn!(
                            "{} consecutive link failures, skipping {} remaining slots",
                            consecutive_transient,
                            skipped.len()
                        );
                        report.circuit_opened = true;
                        report
                            .failures
                            .extend(skipped.iter().map(|&index| ChannelSyncFailure {
                                index,
                                error: ChannelSlotError::CircuitOpen,
                            }));
                        break;
                    }
                }
            }
        }
        report
    }

    async fn fetch_slot(&self, index: u8) -> Result<SlotOutcome, ChannelSlotError> {
        let max_attempts = self.config.max_slot_attempts.max(1);
        let mut attempt = 0;

        let fetched = loop {
            match self.transport.get_channel(index).await {
                Ok(fetched) => break fetched,
                Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                    let delay = backoff_delay(&self.config, attempt);
                    debug!(
                        "Slot {} read failed ({}), retrying in {:?}",
                        index, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        match fetched {
            Some(info) => {
                let record = ChannelRecord::from_info(self.device_id, &info);
                self.store
                    .save_channel(&record)
                    .map_err(|e| ChannelSlotError::Storage(e.to_string()))?;
                debug!("Slot {} is '{}'", index, record.name);
                Ok(SlotOutcome::Synced)
            }
            None => {
                self.store
                    .delete_channel(&self.device_id, index)
                    .map_err(|e| ChannelSlotError::Storage(e.to_string()))?;
                Ok(SlotOutcome::Cleared)
            }
        }
    }
}

fn log_report(report: &ChannelSyncReport) {
    if report.is_complete() {
        info!(
            "Channel sync complete: {} synced, {} empty",
            report.synced.len(),
            report.cleared.len()
        );
    } else {
        warn!(
            "Channel sync finished with {} failed slots{}",
            report.failures.len(),
            if report.circuit_opened {
                " (circuit opened)"
            } else {
                ""
            }
        );
    }
}
