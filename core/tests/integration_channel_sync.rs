use meshlink_core::channels::{ChannelRecord, ChannelSlotError, ChannelSyncManager};
use meshlink_core::config::{CompanionConfig, SyncConfig};
use meshlink_core::store::KvStore;
use meshlink_core::testing::{MockTransport, TransportCall};
use meshlink_core::transport::{ChannelInfo, TransportError};
use meshlink_core::{Companion, Persistence, SyncError};
use std::sync::Arc;

fn channel(index: u8, name: &str) -> ChannelInfo {
    ChannelInfo {
        index,
        name: name.to_string(),
        secret: [0x40 + index; 16],
    }
}

fn channel_reads(transport: &MockTransport) -> usize {
    transport.count_calls(|c| matches!(c, TransportCall::GetChannel(_)))
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_makes_no_further_calls() {
    let device = uuid::Uuid::new_v4();
    let transport = Arc::new(MockTransport::new());
    let sync = ChannelSyncManager::new(
        device,
        transport.clone(),
        Arc::new(KvStore::in_memory()),
        SyncConfig {
            max_slot_attempts: 2,
            circuit_threshold: 2,
            ..SyncConfig::default()
        },
    );
    transport.set_device_channel(channel(0, "Public"));
    transport.script_channel_reads(1, vec![TransportError::Timeout; 2]);
    transport.script_channel_reads(2, vec![TransportError::Timeout; 2]);

    let report = sync.sync_channels(16).await.unwrap();

    assert_eq!(report.synced, vec![0]);
    assert!(report.circuit_opened);
    assert_eq!(report.failed_indices(), (1..16).collect::<Vec<u8>>());
    // one read for slot 0, two each for slots 1 and 2, nothing after
    assert_eq!(channel_reads(&transport), 5);
    let skipped = report
        .failures
        .iter()
        .filter(|f| f.error == ChannelSlotError::CircuitOpen)
        .count();
    assert_eq!(skipped, 13);
}

#[tokio::test(start_paused = true)]
async fn test_retry_pass_recovers_failed_slots() {
    let device = uuid::Uuid::new_v4();
    let transport = Arc::new(MockTransport::new());
    let store = Arc::new(KvStore::in_memory());
    let sync = ChannelSyncManager::new(device, transport.clone(), store.clone(), SyncConfig::default());
    for index in 0..4 {
        transport.set_device_channel(channel(index, &format!("ch{}", index)));
    }
    transport.fail_channel_reads(Some(TransportError::ConnectionLost));

    let first = sync.sync_channels(4).await.unwrap();
    assert!(first.circuit_opened);
    assert!(store.channels(&device).unwrap().is_empty());

    transport.fail_channel_reads(None);
    let retry = sync
        .retry_failed_channels(&first.failed_indices())
        .await
        .unwrap();
    assert!(retry.is_complete());
    assert_eq!(retry.synced, vec![0, 1, 2, 3]);

    let names: Vec<String> = store
        .channels(&device)
        .unwrap()
        .into_iter()
        .map(|c: ChannelRecord| c.name)
        .collect();
    assert_eq!(names, vec!["ch0", "ch1", "ch2", "ch3"]);
}

#[tokio::test(start_paused = true)]
async fn test_second_concurrent_sync_rejected() {
    let transport = Arc::new(MockTransport::new());
    let companion = Companion::in_memory(
        uuid::Uuid::new_v4(),
        transport.clone(),
        &CompanionConfig::default(),
    );
    transport.set_device_channel(channel(0, "Public"));

    let (first, second) = tokio::join!(
        companion.channels().sync_channels(8),
        companion.channels().sync_channels(8)
    );

    assert_eq!(first.unwrap().synced, vec![0]);
    assert_eq!(second.unwrap_err(), SyncError::SyncInProgress);
    // only the first pass touched the radio
    assert_eq!(channel_reads(&transport), 8);
    assert!(!companion.channels().is_syncing());
}
