//! Session lifecycle state, telemetry and events
//!
//! The controller owns the one `SessionHandle`. The stream session writes
//! state transitions into it; the UI only ever reads through
//! `SharedSessionStatus` or receives `SessionEvent`s.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

/// Connection lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    /// Never started
    #[default]
    Idle,
    /// Connection opened, waiting for the first ack or chunk
    Connecting,
    /// Audio is flowing
    Streaming,
    /// Connection dropped, backing off before the next attempt
    Reconnecting,
    /// Stopped, or reconnect attempts exhausted
    Closed,
}

impl SessionState {
    pub fn is_streaming(&self) -> bool {
        matches!(self, SessionState::Streaming)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Connecting, streaming or reconnecting
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Streaming | SessionState::Reconnecting
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Closed)
                | (Connecting, Streaming)
                | (Connecting, Reconnecting)
                | (Connecting, Closed)
                | (Streaming, Reconnecting)
                | (Streaming, Closed)
                | (Reconnecting, Streaming)
                | (Reconnecting, Closed)
                | (Closed, Connecting)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Streaming => write!(f, "Streaming"),
            SessionState::Reconnecting => write!(f, "Reconnecting"),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

/// One live connection lifecycle
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub state: SessionState,
    pub last_error: Option<String>,
    /// Connect attempts made for the current session, including the first
    pub connection_attempt_count: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            state: SessionState::Idle,
            last_error: None,
            connection_attempt_count: 0,
            started_at: None,
        }
    }
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to `next` if the state machine allows it
    ///
    /// Returns `false` and leaves the state alone otherwise.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    /// Begin a fresh session: new id, counters reset
    pub fn begin(&mut self) -> bool {
        if !self.transition(SessionState::Connecting) {
            return false;
        }
        self.session_id = Uuid::new_v4();
        self.last_error = None;
        self.connection_attempt_count = 0;
        self.started_at = Some(Utc::now());
        true
    }

    pub fn record_attempt(&mut self) {
        self.connection_attempt_count += 1;
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }
}

/// Thread-safe view of the session handle
#[derive(Clone, Debug, Default)]
pub struct SharedSessionStatus {
    inner: Arc<RwLock<SessionHandle>>,
}

impl SharedSessionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, SessionHandle> {
        self.inner.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, SessionHandle> {
        self.inner.write()
    }

    pub fn snapshot(&self) -> SessionHandle {
        self.inner.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.read().last_error.clone()
    }

    pub fn connection_attempt_count(&self) -> u32 {
        self.inner.read().connection_attempt_count
    }
}

/// Notifications for the controller and UI
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Reconnect attempts exhausted; needs an explicit restart
    SessionLost(String),
    /// Diagnostic only, playback continues with silence
    PlaybackStalled { consecutive: u32 },
    /// Audio is reaching the device again after a stall
    PlaybackRecovered,
    /// Non-fatal notice from the model, e.g. a filtered prompt
    ModelWarning(String),
}

/// Numbers surfaced for display
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Telemetry {
    pub state: SessionState,
    pub fill_level: usize,
    pub fill_ratio: f32,
    pub underrun_count: u64,
    pub overflow_count: u64,
    pub dropped_frames: u64,
    pub decode_errors: u64,
    pub stall_events: u64,
    pub chunks_received: u64,
    pub revision: u64,
}

impl Telemetry {
    pub fn summary(&self) -> String {
        format!(
            "{} | fill {} ({:.0}%) | underruns {} | overflows {} | decode errors {} | rev {}",
            self.state,
            self.fill_level,
            self.fill_ratio * 100.0,
            self.underrun_count,
            self.overflow_count,
            self.decode_errors,
            self.revision
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        let mut handle = SessionHandle::new();
        assert!(handle.begin());
        assert_eq!(handle.state, SessionState::Connecting);
        assert!(handle.transition(SessionState::Streaming));
        assert!(handle.transition(SessionState::Reconnecting));
        assert!(handle.transition(SessionState::Streaming));
        assert!(handle.transition(SessionState::Closed));
    }

    #[test]
    fn test_rejected_transitions() {
        let mut handle = SessionHandle::new();
        assert!(!handle.transition(SessionState::Streaming));
        assert_eq!(handle.state, SessionState::Idle);

        handle.transition(SessionState::Closed);
        assert!(!handle.transition(SessionState::Reconnecting));
        assert!(!handle.transition(SessionState::Closed));
        assert_eq!(handle.state, SessionState::Closed);
    }

    #[test]
    fn test_begin_resets_counters() {
        let mut handle = SessionHandle::new();
        handle.begin();
        handle.record_attempt();
        handle.set_error("boom");
        let first_id = handle.session_id;
        handle.transition(SessionState::Closed);

        assert!(handle.begin());
        assert_ne!(handle.session_id, first_id);
        assert_eq!(handle.connection_attempt_count, 0);
        assert!(handle.last_error.is_none());
        assert!(handle.started_at.is_some());
    }

    #[test]
    fn test_shared_status_is_shared() {
        let status = SharedSessionStatus::new();
        let view = status.clone();
        status.write().begin();
        assert_eq!(view.state(), SessionState::Connecting);
        assert!(view.state().is_active());
    }

    #[test]
    fn test_telemetry_summary() {
        let telemetry = Telemetry {
            state: SessionState::Streaming,
            fill_level: 4800,
            fill_ratio: 0.5,
            ..Default::default()
        };
        let summary = telemetry.summary();
        assert!(summary.contains("Streaming"));
        assert!(summary.contains("50%"));
    }
}
