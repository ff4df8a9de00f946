//! Call participants and intent

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable participant identifier handed out by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Media modality of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn has_video(self) -> bool {
        self == CallKind::Video
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Voice => f.write_str("voice"),
            CallKind::Video => f.write_str("video"),
        }
    }
}

/// Which side of the call this endpoint plays.
///
/// The caller is the initiator and produces the first negotiation data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Receiver,
}

/// What the user asked for when dialing or accepting.
///
/// Consumed once when a session starts; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallIntent {
    /// The other party of the call.
    pub peer_id: UserId,
    pub kind: CallKind,
    pub role: CallRole,
}

impl CallIntent {
    pub fn dial(peer_id: UserId, kind: CallKind) -> Self {
        Self {
            peer_id,
            kind,
            role: CallRole::Caller,
        }
    }

    pub fn answer(caller_id: UserId, kind: CallKind) -> Self {
        Self {
            peer_id: caller_id,
            kind,
            role: CallRole::Receiver,
        }
    }
}
