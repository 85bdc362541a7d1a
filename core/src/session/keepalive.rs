// Keep-alive loop for room sessions
//
// Ticks immediately, then on the session's interval. A tick over a flood
// path is skipped; any other failure ends the loop for good and the session
// is marked disconnected. Reconnecting is the caller's job.

use super::manager::ManagerInner;
use super::SessionId;
use crate::identity::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Outcome of a single tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum KeepAliveTick {
    Sent,
    /// No direct path; heartbeats are not flooded
    Skipped,
}

pub(super) struct KeepAliveHandle {
    pub(super) generation: u64,
    stop: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

impl KeepAliveHandle {
    pub(super) fn stop(self) {
        let _ = self.stop.send(true);
    }
}

pub(super) fn spawn_keep_alive(
    inner: Arc<ManagerInner>,
    session_id: SessionId,
    key: PublicKey,
    interval: Duration,
    generation: u64,
) -> KeepAliveHandle {
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => match inner.keep_alive_tick(&session_id, &key).await {
                    Ok(KeepAliveTick::Sent) => debug!("Keep-alive sent to {}", key),
                    Ok(KeepAliveTick::Skipped) => debug!("Keep-alive to {} skipped, no direct path", key),
                    Err(e) => {
                        warn!("Keep-alive for session {} failed: {}", session_id, e);
                        inner.keep_alive_failed(&session_id, generation);
                        return;
                    }
                },
                _ = stopped.changed() => {
                    debug!("Keep-alive for session {} stopped", session_id);
                    return;
                }
            }
        }
    });

    KeepAliveHandle {
        generation,
        stop,
        _task: task,
    }
}
