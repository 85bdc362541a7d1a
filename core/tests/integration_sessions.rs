use meshlink_core::config::SessionConfig;
use meshlink_core::session::{PermissionLevel, RemoteSession, SessionRole, SessionState};
use meshlink_core::store::KvStore;
use meshlink_core::Persistence;
use meshlink_core::testing::{
    CommandReply, LoginBehavior, MockTransport, RecordingDelegate, TransportCall,
};
use meshlink_core::transport::{RemoteStatus, TransportError};
use meshlink_core::{
    Contact, ContactKind, MemorySecretStore, PublicKey, RemoteSessionManager, SessionError,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    manager: RemoteSessionManager,
    transport: Arc<MockTransport>,
    delegate: Arc<RecordingDelegate>,
    device: uuid::Uuid,
}

fn harness() -> Harness {
    let device = uuid::Uuid::new_v4();
    let transport = Arc::new(MockTransport::new());
    let manager = RemoteSessionManager::new(
        device,
        transport.clone(),
        Arc::new(KvStore::in_memory()),
        Arc::new(MemorySecretStore::new()),
        SessionConfig::default(),
    );
    let delegate = Arc::new(RecordingDelegate::default());
    manager.set_delegate(Some(delegate.clone()));
    manager.start();
    Harness {
        manager,
        transport,
        delegate,
        device,
    }
}

fn repeater() -> PublicKey {
    PublicKey::from_bytes([0x52; 32])
}

fn room() -> PublicKey {
    PublicKey::from_bytes([0x77; 32])
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

async fn connected_repeater(h: &Harness) -> RemoteSession {
    h.transport.set_login_behavior(
        repeater(),
        LoginBehavior::Accept {
            is_admin: true,
            acl: None,
        },
    );
    h.manager
        .connect(&repeater(), SessionRole::Repeater, Some("admin-pw"), Some(1))
        .await
        .unwrap()
}

fn keep_alives(transport: &MockTransport) -> Vec<u32> {
    transport
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            TransportCall::KeepAlive { sync_since, .. } => Some(sync_since),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_cli_replies_routed_by_grammar() {
    let h = harness();
    let id = connected_repeater(&h).await.id;

    let get = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.send_cli_command(&id, "get freq").await })
    };
    wait_until(|| h.manager.pending_cli_count(&repeater()) == 1).await;
    let ver = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.send_cli_command(&id, "ver").await })
    };
    wait_until(|| h.manager.pending_cli_count(&repeater()) == 2).await;

    // replies arrive in the opposite order to the commands
    h.transport
        .emit_cli_reply(&repeater(), "v1.7.1 (Build: 01-Jul-2025)");
    h.transport.emit_cli_reply(&repeater(), "> 915.0");

    assert_eq!(ver.await.unwrap().unwrap(), "v1.7.1 (Build: 01-Jul-2025)");
    assert_eq!(get.await.unwrap().unwrap(), "> 915.0");
    assert_eq!(h.manager.pending_cli_count(&repeater()), 0);
    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_ambiguous_replies_resolve_oldest_first() {
    let h = harness();
    let id = connected_repeater(&h).await.id;

    let first = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.send_cli_command(&id, "set name north").await })
    };
    wait_until(|| h.manager.pending_cli_count(&repeater()) == 1).await;
    let second = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.send_cli_command(&id, "set tx 22").await })
    };
    wait_until(|| h.manager.pending_cli_count(&repeater()) == 2).await;

    h.transport.emit_cli_reply(&repeater(), "OK - name set");
    assert_eq!(first.await.unwrap().unwrap(), "OK - name set");
    assert_eq!(h.manager.pending_cli_count(&repeater()), 1);

    h.transport.emit_cli_reply(&repeater(), "OK - tx set");
    assert_eq!(second.await.unwrap().unwrap(), "OK - tx set");
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_buffered_reply_fetched_by_polling() {
    let h = harness();
    let session = connected_repeater(&h).await;
    h.transport.reply_to_command(
        repeater(),
        "clock",
        CommandReply::Buffered("14:02 - 3/7/2025 UTC".to_string()),
    );

    let reply = h.manager.send_cli_command(&session.id, "clock").await.unwrap();
    assert_eq!(reply, "14:02 - 3/7/2025 UTC");
    assert!(h
        .transport
        .count_calls(|c| *c == TransportCall::SyncNextMessage)
        >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_cli_timeout_releases_request() {
    let h = harness();
    let session = connected_repeater(&h).await;

    let err = h
        .manager
        .send_cli_command(&session.id, "neighbors")
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::CliTimeout);
    assert_eq!(h.manager.pending_cli_count(&repeater()), 0);
}

#[tokio::test]
async fn test_unmatched_reply_reaches_delegate() {
    let h = harness();
    connected_repeater(&h).await;

    h.transport.emit_cli_reply(&repeater(), "stray output");
    wait_until(|| !h.delegate.unmatched_cli().is_empty()).await;
    assert_eq!(
        h.delegate.unmatched_cli(),
        vec![(repeater().prefix(), "stray output".to_string())]
    );
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_raw_cli_single_slot_released_on_cancel() {
    let h = harness();
    let id = connected_repeater(&h).await.id;

    let pending = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.send_raw_cli(&id, "reboot").await })
    };
    wait_until(|| {
        h.transport
            .count_calls(|c| matches!(c, TransportCall::Command { .. }))
            == 1
    })
    .await;

    let busy = h.manager.send_raw_cli(&id, "reboot").await;
    assert_eq!(busy.unwrap_err(), SessionError::RawCliBusy);

    pending.abort();
    let _ = pending.await;

    h.transport
        .reply_to_command(repeater(), "log", CommandReply::Push("entries: 0".to_string()));
    let reply = h.manager.send_raw_cli(&id, "log").await.unwrap();
    assert_eq!(reply, "entries: 0");
}

#[tokio::test(start_paused = true)]
async fn test_status_request() {
    let h = harness();
    let session = connected_repeater(&h).await;

    let err = h.manager.request_status(&session.id).await.unwrap_err();
    assert_eq!(err, SessionError::StatusTimeout);

    let status = RemoteStatus {
        battery_mv: 4012,
        uptime_secs: 86_400,
        ..RemoteStatus::default()
    };
    h.transport.set_status(repeater(), status.clone());
    assert_eq!(h.manager.request_status(&session.id).await.unwrap(), status);
}

#[tokio::test(start_paused = true)]
async fn test_newer_login_supersedes_older() {
    let h = harness();
    h.transport.set_login_behavior(repeater(), LoginBehavior::Silent);
    let id = h
        .manager
        .find_or_create_session(&repeater(), SessionRole::Repeater)
        .unwrap()
        .id;

    let first = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.login(&id, Some("pw"), Some(0)).await })
    };
    wait_until(|| {
        h.transport
            .count_calls(|c| matches!(c, TransportCall::Login(_)))
            == 1
    })
    .await;

    let second = h.manager.login(&id, Some("pw"), Some(0)).await;
    assert_eq!(first.await.unwrap().unwrap_err(), SessionError::Superseded);
    assert_eq!(second.unwrap_err(), SessionError::LoginTimeout);
    assert_eq!(h.manager.session_state(&id), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_room_keep_alive_carries_checkpoint_and_stops_on_failure() {
    let h = harness();
    h.transport.add_contact(
        Contact::new(h.device, room(), "lounge", ContactKind::Room).with_direct_path(vec![0x11]),
    );
    h.transport.set_login_behavior(
        room(),
        LoginBehavior::Accept {
            is_admin: false,
            acl: Some(2),
        },
    );

    let session = h
        .manager
        .connect(&room(), SessionRole::Room, Some("guest"), None)
        .await
        .unwrap();
    assert!(h.manager.has_keep_alive(&session.id));
    wait_until(|| keep_alives(&h.transport).len() == 1).await;
    assert_eq!(keep_alives(&h.transport), vec![0]);

    h.manager
        .record_sync_checkpoint(&session.id, 1_700_000_123)
        .unwrap();
    h.manager.record_sync_checkpoint(&session.id, 5).unwrap();
    tokio::time::sleep(Duration::from_secs(91)).await;
    assert_eq!(keep_alives(&h.transport), vec![0, 1_700_000_123]);

    h.transport
        .fail_keep_alives(Some(TransportError::ConnectionLost));
    tokio::time::sleep(Duration::from_secs(91)).await;
    assert!(!h.manager.has_keep_alive(&session.id));
    assert_eq!(h.manager.session_state(&session.id), SessionState::Disconnected);
    assert!(!h.manager.session(&session.id).unwrap().connected);

    // no self-healing
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(keep_alives(&h.transport).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_skipped_over_flood_path() {
    let h = harness();
    h.transport
        .add_contact(Contact::new(h.device, room(), "lounge", ContactKind::Room));
    h.transport.set_login_behavior(
        room(),
        LoginBehavior::Accept {
            is_admin: false,
            acl: Some(1),
        },
    );

    let session = h
        .manager
        .connect(&room(), SessionRole::Room, Some("guest"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(200)).await;

    assert!(keep_alives(&h.transport).is_empty());
    assert!(h.manager.has_keep_alive(&session.id));
    assert_eq!(h.manager.session_state(&session.id), SessionState::Connected);
}

#[tokio::test]
async fn test_disconnect_then_reconnect_detects_downgrade() {
    let h = harness();
    let repeater_session = connected_repeater(&h).await;
    h.transport.set_login_behavior(
        room(),
        LoginBehavior::Accept {
            is_admin: false,
            acl: Some(2),
        },
    );
    let room_session = h
        .manager
        .connect(&room(), SessionRole::Room, Some("guest"), Some(0))
        .await
        .unwrap();

    let mut lost = h.manager.handle_disconnection().unwrap();
    lost.sort();
    let mut expected = vec![repeater_session.id, room_session.id];
    expected.sort();
    assert_eq!(lost, expected);
    assert!(!h.manager.has_keep_alive(&room_session.id));
    assert_eq!(
        h.manager.session_state(&repeater_session.id),
        SessionState::Disconnected
    );

    // the repeater's ACL was changed while we were away
    h.transport.set_login_behavior(
        repeater(),
        LoginBehavior::Accept {
            is_admin: false,
            acl: Some(1),
        },
    );

    let results = h.manager.handle_reconnection(&lost).await;
    assert_eq!(results.len(), 2);
    for (id, result) in results {
        if id == room_session.id {
            let session = result.unwrap();
            assert!(session.connected);
            assert_eq!(session.permission, PermissionLevel::ReadWrite);
        } else {
            assert_eq!(
                result.unwrap_err(),
                SessionError::PermissionDowngraded {
                    before: PermissionLevel::Admin,
                    after: PermissionLevel::ReadOnly,
                }
            );
        }
    }

    assert_eq!(
        h.delegate.downgrades(),
        vec![(
            repeater_session.id,
            PermissionLevel::Admin,
            PermissionLevel::ReadOnly
        )]
    );
    assert!(!h.manager.session(&repeater_session.id).unwrap().connected);
    assert!(h.manager.has_keep_alive(&room_session.id));
    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_without_saved_password() {
    let h = harness();
    let session = h
        .manager
        .find_or_create_session(&repeater(), SessionRole::Repeater)
        .unwrap();

    let results = h.manager.handle_reconnection(&[session.id]).await;
    assert_eq!(
        results,
        vec![(session.id, Err(SessionError::NoCredential(repeater())))]
    );
}

#[tokio::test]
async fn test_disconnect_leaves_idle_sessions_alone() {
    let h = harness();
    let connected = connected_repeater(&h).await;
    let idle = h
        .manager
        .find_or_create_session(&room(), SessionRole::Room)
        .unwrap();

    let lost = h.manager.handle_disconnection().unwrap();
    assert_eq!(lost, vec![connected.id]);
    assert!(!lost.contains(&idle.id));
    assert_eq!(h.manager.session(&idle.id).unwrap(), idle);

    h.transport.clear_calls();
    let results = h.manager.handle_reconnection(&lost).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, connected.id);
    assert!(results[0].1.is_ok());
    assert_eq!(
        h.transport
            .count_calls(|c| *c == TransportCall::Login(repeater())),
        1
    );
    assert_eq!(
        h.transport.count_calls(|c| *c == TransportCall::Login(room())),
        0
    );
    assert_eq!(h.manager.session_state(&idle.id), SessionState::Disconnected);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_reconnection_is_ignored() {
    let h = harness();
    let session = connected_repeater(&h).await;
    let lost = h.manager.handle_disconnection().unwrap();
    h.transport.set_login_behavior(repeater(), LoginBehavior::Silent);
    h.transport.clear_calls();

    let first = {
        let manager = h.manager.clone();
        let lost = lost.clone();
        tokio::spawn(async move { manager.handle_reconnection(&lost).await })
    };
    wait_until(|| {
        h.transport
            .count_calls(|c| matches!(c, TransportCall::Login(_)))
            == 1
    })
    .await;

    assert!(h.manager.handle_reconnection(&lost).await.is_empty());

    let results = first.await.unwrap();
    assert_eq!(results, vec![(session.id, Err(SessionError::LoginTimeout))]);
    assert_eq!(
        h.transport
            .count_calls(|c| matches!(c, TransportCall::Login(_))),
        1
    );

    // the guard is released once the first pass ends
    h.transport.set_login_behavior(
        repeater(),
        LoginBehavior::Accept {
            is_admin: true,
            acl: None,
        },
    );
    let again = h.manager.handle_reconnection(&lost).await;
    assert_eq!(again.len(), 1);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_period_follows_configuration() {
    let device = uuid::Uuid::new_v4();
    let transport = Arc::new(MockTransport::new());
    let store = Arc::new(KvStore::in_memory());
    let manager = RemoteSessionManager::new(
        device,
        transport.clone(),
        store.clone(),
        Arc::new(MemorySecretStore::new()),
        SessionConfig {
            keep_alive_interval_secs: 30,
            ..SessionConfig::default()
        },
    );
    manager.start();
    transport.add_contact(
        Contact::new(device, room(), "lounge", ContactKind::Room).with_direct_path(vec![0x11]),
    );
    transport.set_login_behavior(
        room(),
        LoginBehavior::Accept {
            is_admin: false,
            acl: Some(2),
        },
    );
    // created under an older configuration
    let stale = RemoteSession::new(device, room(), SessionRole::Room, 90);
    store.save_session(&stale).unwrap();

    let session = manager
        .connect(&room(), SessionRole::Room, Some("guest"), None)
        .await
        .unwrap();
    assert_eq!(session.id, stale.id);
    wait_until(|| keep_alives(&transport).len() == 1).await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(keep_alives(&transport).len(), 2);
    assert_eq!(
        manager.session(&session.id).unwrap().keep_alive_interval_secs,
        30
    );
    manager.shutdown().await;
}
