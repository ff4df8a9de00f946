//! Low-latency message bus with named broadcast channels
//!
//! Both the per-call signaling channel and the per-user inbox ride on this
//! abstraction. The bus owns fan-out; callers only hold subscription handles.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryBus;
pub use websocket::WsBus;

/// Bus transport errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connect(String),
    #[error("channel {0} is closed")]
    Closed(String),
    #[error("bus protocol error: {0}")]
    Protocol(String),
    #[error("failed to encode bus frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Per-channel delivery options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Ask the bus to acknowledge every broadcast.
    pub ack: bool,
    /// Deliver our own broadcasts back to us.
    #[serde(rename = "self")]
    pub self_delivery: bool,
}

impl ChannelConfig {
    /// Fire-and-forget without echo; used for call signaling.
    pub fn low_latency() -> Self {
        Self {
            ack: false,
            self_delivery: false,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ack: true,
            self_delivery: false,
        }
    }
}

/// One broadcast event as seen by a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub event: String,
    pub payload: serde_json::Value,
}

/// A message bus able to open named channels.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Join `name` and return once the subscription is confirmed.
    async fn open(&self, name: &str, config: ChannelConfig)
        -> Result<Box<dyn BusChannel>, BusError>;
}

/// A subscription handle to one named channel.
#[async_trait]
pub trait BusChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Broadcast to every other subscriber. No delivery guarantee.
    async fn broadcast(&self, event: &str, payload: serde_json::Value) -> Result<(), BusError>;

    /// Next event for this subscriber, `None` once the channel is gone.
    async fn recv(&mut self) -> Option<BusMessage>;

    /// Leave the channel. Calling it again is a no-op.
    async fn close(&mut self);
}
