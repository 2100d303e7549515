//! Session lifecycle state machine.
//!
//! States form a small hierarchy: `Connected` contains `SessionNotReady` and
//! `SessionReady`, and a ready session is implicitly `Active`. Transitions
//! are pattern matches, so adding a state without handling it fails to
//! compile instead of failing at runtime.

/// Current node in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport attached.
    NotConnected,
    /// Transport established.
    Connected(ConnectedState),
}

/// Sub-states of [`SessionState::Connected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedState {
    /// Handshake not finished yet.
    SessionNotReady,
    /// Handshake done; `active` gates data transfer.
    SessionReady {
        /// Whether data sends are currently permitted.
        active: bool,
    },
}

/// Events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Transport came up.
    Connect,
    /// Handshake completed.
    StartSession,
    /// Orderly session stop.
    StopSession,
    /// Transport goes away.
    Disconnect,
}

/// The per-session state machine. All queries and transitions go through
/// the owning session's mutex.
#[derive(Debug)]
pub struct StateMachine {
    state: SessionState,
}

impl StateMachine {
    /// Start in `NotConnected`.
    pub fn new() -> Self {
        Self {
            state: SessionState::NotConnected,
        }
    }

    /// Attempt a transition. Returns `false` without effect when the event
    /// does not apply to the current state; this is not an error by itself.
    pub fn apply(&mut self, transition: Transition) -> bool {
        use ConnectedState::*;
        use SessionState::*;

        let next = match (self.state, transition) {
            (NotConnected, Transition::Connect) => Connected(SessionNotReady),
            (Connected(SessionNotReady), Transition::StartSession) => {
                Connected(SessionReady { active: true })
            }
            (Connected(SessionReady { .. }), Transition::StopSession) => Connected(SessionNotReady),
            (Connected(_), Transition::Disconnect) => NotConnected,
            _ => return false,
        };

        self.state = next;
        true
    }

    /// Current state.
    pub fn current(&self) -> SessionState {
        self.state
    }

    /// Whether a transport is attached.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected(_))
    }

    /// Whether the handshake has completed (ready or active).
    pub fn is_ready(&self) -> bool {
        matches!(
            self.state,
            SessionState::Connected(ConnectedState::SessionReady { .. })
        )
    }

    /// Whether data sends are permitted.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::Connected(ConnectedState::SessionReady { active: true })
        )
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
