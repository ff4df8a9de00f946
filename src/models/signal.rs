//! Signaling envelopes exchanged on a per-call channel

use super::UserId;

/// Connection negotiation data. Opaque to the coordinator; only the peer
/// connection implementation knows how to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationBlob(Vec<u8>);

impl NegotiationBlob {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Envelope body, one variant per event kind on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    Negotiation(NegotiationBlob),
    ReadyPing,
    Hangup,
}

impl SignalBody {
    /// Bus event name carrying this body.
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalBody::Negotiation(_) => "signal",
            SignalBody::ReadyPing => "ready",
            SignalBody::Hangup => "hangup",
        }
    }
}

/// A message on the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub sender_id: UserId,
    pub body: SignalBody,
    pub sent_at_ms: i64,
}

impl SignalEnvelope {
    /// Build an envelope stamped with the current wall clock.
    pub fn now(sender_id: UserId, body: SignalBody) -> Self {
        Self {
            sender_id,
            body,
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}
