//! Call signaling and session coordination.
//!
//! A call is one `session` task per attempt: it owns the local media, one
//! signaling channel keyed by the participant pair, and one peer connection.
//! The `inbox` carries ringing and cancellation notices between users who
//! have no session open yet.

pub mod console;
pub mod inbox;
pub mod manager;
pub mod media;
pub mod peer;
pub mod quality;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod tone;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

use crate::bus::BusError;

/// Failures surfaced by the call core.
///
/// Stale signals and apply failures on a closed connection are not errors:
/// they are logged and dropped where they happen.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("access to camera or microphone was denied")]
    MediaAccessDenied,
    #[error("capture device not found: {0}")]
    MediaDeviceNotFound(String),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("a call is already in progress")]
    CallInProgress,
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("peer connection setup failed: {0}")]
    PeerSetup(String),
}

impl CallError {
    /// Media failures end the session in `AccessDenied`.
    pub fn is_media_failure(&self) -> bool {
        matches!(
            self,
            CallError::MediaAccessDenied | CallError::MediaDeviceNotFound(_)
        )
    }
}

/// Lifecycle of one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Ringing,
    Connecting,
    Connected,
    Reconnecting,
    Terminated,
    AccessDenied,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::AccessDenied)
    }

    /// Status line shown on the call screen.
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Initializing => "Initializing...",
            SessionState::Ringing => "Ringing...",
            SessionState::Connecting => "Connecting...",
            SessionState::Connected => "Connected",
            SessionState::Reconnecting => "Reconnecting...",
            SessionState::Terminated => "Call Ended",
            SessionState::AccessDenied => "Access Denied",
        }
    }
}
