//! Peer connection abstraction.
//!
//! The session drives a peer connection only through this interface; it
//! never looks inside negotiation data. Connections report back through an
//! unbounded event channel handed over at creation.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::media::{LocalStream, TrackKind};
use super::quality::ConnectionQualitySample;
use super::CallError;
use crate::models::{CallRole, NegotiationBlob};

/// Remote media that arrived over the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub kinds: Vec<TrackKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerErrorKind {
    /// Connectivity checks failed; the connection may still recover.
    IceFailure,
    Other(String),
}

/// Event raised by a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Local negotiation data that must reach the other party.
    NegotiationData(NegotiationBlob),
    /// Remote media is flowing. Raised once per connection.
    RemoteStream(RemoteStream),
    /// Connectivity came back after an `IceFailure`.
    Recovered,
    Error(PeerErrorKind),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// A live connection to the other party.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Feed negotiation data from the other side. Failures are logged and
    /// swallowed; data arriving after `destroy` is ignored.
    async fn apply_remote_negotiation_data(&self, data: &NegotiationBlob);

    /// Receive-side loss counters, `None` once the connection is closed.
    async fn sample_packet_loss(&self) -> Option<ConnectionQualitySample>;

    /// Close the connection. Safe to call more than once.
    async fn destroy(&self);
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a connection sending `local`. A caller starts producing
    /// negotiation data right away; a receiver waits for the caller's.
    async fn create(
        &self,
        role: CallRole,
        local: &LocalStream,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerConnection>, CallError>;
}
