//! Per-session lifecycle

use serde::Serialize;
use std::fmt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::network::{DeviceCandidate, TransportHandle};

/// Monotonic session identifier; lower ids were admitted earlier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// `Connecting → Active → Draining → Closed`, with `Connecting → Closed`
/// on a failed handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Active) | (Connecting, Closed) | (Active, Draining) | (Draining, Closed)
        )
    }

    /// Whether the session holds one of the pool's slots
    pub fn occupies_slot(self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One admitted receiver connection
pub struct DeviceSession {
    pub(crate) id: SessionId,
    pub(crate) candidate: DeviceCandidate,
    /// Owned exclusively by this session; taken exactly once on close
    pub(crate) handle: Option<TransportHandle>,
    pub(crate) state: SessionState,
    pub(crate) last_active: Instant,
    pub(crate) rssi: Option<i32>,
    /// Writes issued but not yet finished
    pub(crate) in_flight: usize,
    pub(crate) consecutive_failures: u32,
    /// Close as soon as the handshake resolves
    pub(crate) abort_requested: bool,
    /// Cancels the disconnect watcher
    pub(crate) watcher: Option<CancellationToken>,
}

impl DeviceSession {
    pub(crate) fn connecting(id: SessionId, candidate: DeviceCandidate, now: Instant) -> Self {
        Self {
            id,
            candidate,
            handle: None,
            state: SessionState::Connecting,
            last_active: now,
            rssi: None,
            in_flight: 0,
            consecutive_failures: 0,
            abort_requested: false,
            watcher: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn candidate(&self) -> &DeviceCandidate {
        &self.candidate
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn rssi(&self) -> Option<i32> {
        self.rssi
    }

    /// Apply a transition, returning the previous state if it was legal
    pub(crate) fn transition(&mut self, next: SessionState) -> Option<SessionState> {
        if !self.state.can_transition_to(next) {
            return None;
        }
        let previous = self.state;
        self.state = next;
        Some(previous)
    }

    /// Draining and nothing left to wait for
    pub(crate) fn ready_to_close(&self) -> bool {
        self.state == SessionState::Draining && self.in_flight == 0
    }

    /// Release the handle and stop the watcher; yields the handle once
    pub(crate) fn take_resources(&mut self) -> Option<TransportHandle> {
        if let Some(token) = self.watcher.take() {
            token.cancel();
        }
        self.handle.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(Active));
        assert!(Connecting.can_transition_to(Closed));
        assert!(Active.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Closed));

        assert!(!Connecting.can_transition_to(Draining));
        assert!(!Active.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Draining.can_transition_to(Active));
    }

    #[test]
    fn test_transition_and_release_once() {
        let now = Instant::now();
        let mut session =
            DeviceSession::connecting(SessionId(1), DeviceCandidate::new("a", "A"), now);
        session.handle = Some(TransportHandle::new(10, "a"));

        assert_eq!(session.transition(SessionState::Draining), None);
        assert_eq!(session.transition(SessionState::Active), Some(SessionState::Connecting));
        assert_eq!(session.transition(SessionState::Draining), Some(SessionState::Active));
        assert!(session.ready_to_close());

        assert!(session.take_resources().is_some());
        assert!(session.take_resources().is_none());
    }

    #[test]
    fn test_session_ids_order_by_admission() {
        assert!(SessionId(1) < SessionId(2));
        assert_eq!(SessionId(3).to_string(), "session-3");
    }
}
