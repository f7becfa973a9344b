use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use relay_core::ids::{AnalysisId, UserId};
use relay_core::model::Role;

/// Result of handing a frame to a session's send queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued for delivery.
    Sent,
    /// Queue full; the frame was dropped, the session kept.
    Dropped,
    /// The connection is gone; the session should be removed.
    Closed,
}

/// Cheap, cloneable handle to a session's connection. Pushes never block:
/// delivery is decoupled from the connection writer through a bounded queue.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_heartbeat: AtomicU64,
}

impl SessionHandle {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                tx,
                connected: AtomicBool::new(true),
                last_heartbeat: AtomicU64::new(now_secs()),
            }),
        }
    }

    pub fn push(&self, frame: &str) -> PushOutcome {
        if !self.is_connected() {
            return PushOutcome::Closed;
        }
        match self.inner.tx.try_send(frame.to_string()) {
            Ok(()) => PushOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => PushOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mark_disconnected();
                PushOutcome::Closed
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    pub fn mark_disconnected(&self) {
        self.inner.connected.store(false, Ordering::Relaxed);
    }

    pub fn record_heartbeat(&self) {
        self.inner.last_heartbeat.store(now_secs(), Ordering::Relaxed);
    }

    pub fn heartbeat_age_secs(&self) -> u64 {
        let last = self.inner.last_heartbeat.load(Ordering::Relaxed);
        now_secs().saturating_sub(last)
    }

    #[cfg(test)]
    pub(crate) fn set_last_heartbeat(&self, epoch_secs: u64) {
        self.inner.last_heartbeat.store(epoch_secs, Ordering::Relaxed);
    }
}

/// Registry entry for one live session. The role is a snapshot taken at
/// handshake time and refreshed by the initial-data sync; authorization
/// decisions that matter re-fetch through the user store instead.
pub(crate) struct SessionEntry {
    pub user_id: UserId,
    pub role: Role,
    pub topics: HashSet<AnalysisId>,
    pub handle: SessionHandle,
}

impl SessionEntry {
    pub fn new(user_id: UserId, role: Role, handle: SessionHandle) -> Self {
        Self {
            user_id,
            role,
            topics: HashSet::new(),
            handle,
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
