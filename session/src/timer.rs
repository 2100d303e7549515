//! Reply tracking and the process-wide timer service.
//!
//! Every reply-expected message registers a [`PendingReply`]; the timer task
//! walks the list at a fixed cadence and fires `MESSAGE_TIMEOUT` through the
//! owning session's error callback once an entry passes its deadline. The
//! same sweep issues heartbeats for sessions that have been idle too long.

use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use lattice_wire::{ErrorCode, MessageType};
use tracing::{debug, warn};

use crate::registry::RegistryShared;

/// One outstanding reply-expected message.
#[derive(Debug, Clone)]
pub(crate) struct PendingReply {
    pub(crate) session_id: u32,
    pub(crate) message_id: u32,
    pub(crate) msg_type: MessageType,
    pub(crate) sub_type: u8,
    pub(crate) deadline: Instant,
}

/// Lock-protected list of outstanding reply-expected messages.
///
/// Lookups on reply arrival are by `(session_id, message_id)`; a linear scan
/// is fine at the expected scale of a few hundred entries.
pub(crate) struct ReplyTracker {
    entries: Mutex<Vec<PendingReply>>,
    timeout: Duration,
}

impl ReplyTracker {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            timeout,
        }
    }

    /// Register an outstanding message.
    pub(crate) fn add(&self, session_id: u32, message_id: u32, msg_type: MessageType, sub_type: u8) {
        let entry = PendingReply {
            session_id,
            message_id,
            msg_type,
            sub_type,
            deadline: Instant::now() + self.timeout,
        };
        self.entries.lock().unwrap().push(entry);
    }

    /// Remove the entry matching an arrived reply. Returns `false` when no
    /// entry matched.
    pub(crate) fn remove(&self, session_id: u32, message_id: u32) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| !(e.session_id == session_id && e.message_id == message_id));
        before != entries.len()
    }

    /// Discard all entries of a session being torn down, without firing
    /// timeouts for them.
    pub(crate) fn remove_session(&self, session_id: u32) {
        self.entries
            .lock()
            .unwrap()
            .retain(|e| e.session_id != session_id);
    }

    /// Extract all entries past their deadline. Each entry is returned at
    /// most once.
    pub(crate) fn take_expired(&self, now: Instant) -> Vec<PendingReply> {
        let mut entries = self.entries.lock().unwrap();
        let mut expired = Vec::new();
        entries.retain(|e| {
            if now > e.deadline {
                expired.push(e.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// The process-wide timer task. Exits once the owning registry is dropped.
pub(crate) async fn run_timer(shared: Weak<RegistryShared>) {
    let (tick, heartbeat_interval) = match shared.upgrade() {
        Some(s) => (s.config.tick_interval, s.config.heartbeat_interval),
        None => return,
    };

    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(shared) = shared.upgrade() else {
            break;
        };

        for entry in shared.replies.take_expired(Instant::now()) {
            let session = shared.session(entry.session_id);
            let text = format!(
                "message timeout: type={:?} subType={} messageId={}",
                entry.msg_type, entry.sub_type, entry.message_id
            );
            warn!("session {}: {}", entry.session_id, text);
            shared
                .events
                .error_occurred(session.as_ref(), ErrorCode::MessageTimeout, &text);
        }

        for session in shared.sessions_snapshot() {
            if session.heartbeat_due(heartbeat_interval) {
                session.send_heartbeat();
            }
        }
    }

    debug!("timer service stopped");
}
