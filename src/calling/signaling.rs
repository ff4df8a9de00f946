//! Per-call signaling channel.
//!
//! Both parties of a call meet on one bus channel whose name depends only on
//! the unordered pair of participants. Envelopes travel as bus events named
//! after their body (`signal`, `ready`, `hangup`) with a JSON payload of
//! `{from, sentAt, signal?}`; negotiation bytes are base64 in `signal`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::bus::{BusChannel, BusError, BusMessage, ChannelConfig, MessageBus};
use crate::models::{NegotiationBlob, SignalBody, SignalEnvelope, UserId};

/// Channel name for the call between `a` and `b`, identical for both sides.
pub fn channel_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("call:{}_{}", lo, hi)
}

/// True when negotiation data sent at `sent_at_ms` is too old to apply.
pub fn is_stale(sent_at_ms: i64, now_ms: i64, window_ms: u64) -> bool {
    now_ms.saturating_sub(sent_at_ms) > window_ms as i64
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayload {
    from: UserId,
    sent_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signal: Option<String>,
}

/// Bus event name and payload for an envelope.
pub fn encode(envelope: &SignalEnvelope) -> Result<(&'static str, serde_json::Value), BusError> {
    let signal = match &envelope.body {
        SignalBody::Negotiation(blob) => Some(BASE64.encode(blob.as_bytes())),
        SignalBody::ReadyPing | SignalBody::Hangup => None,
    };
    let payload = WirePayload {
        from: envelope.sender_id.clone(),
        sent_at: envelope.sent_at_ms,
        signal,
    };
    Ok((envelope.body.event_name(), serde_json::to_value(payload)?))
}

/// Parse a bus event back into an envelope.
pub fn decode(message: &BusMessage) -> Result<SignalEnvelope, BusError> {
    let payload: WirePayload = serde_json::from_value(message.payload.clone())?;
    let body = match message.event.as_str() {
        "signal" => {
            let encoded = payload
                .signal
                .ok_or_else(|| BusError::Protocol("signal event without data".to_string()))?;
            let bytes = BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| BusError::Protocol(format!("bad signal encoding: {}", e)))?;
            SignalBody::Negotiation(NegotiationBlob::new(bytes))
        }
        "ready" => SignalBody::ReadyPing,
        "hangup" => SignalBody::Hangup,
        other => return Err(BusError::Protocol(format!("unknown event {}", other))),
    };
    Ok(SignalEnvelope {
        sender_id: payload.from,
        body,
        sent_at_ms: payload.sent_at,
    })
}

/// Subscription to the signaling channel of one call.
pub struct SignalingChannel {
    inner: Box<dyn BusChannel>,
    closed: bool,
}

impl SignalingChannel {
    /// Join the channel shared with `peer`. Returns once subscribed.
    pub async fn open(bus: &dyn MessageBus, own: &UserId, peer: &UserId) -> Result<Self, BusError> {
        let key = channel_key(own, peer);
        let inner = bus.open(&key, ChannelConfig::low_latency()).await?;
        Ok(Self {
            inner,
            closed: false,
        })
    }

    pub fn key(&self) -> &str {
        self.inner.name()
    }

    pub async fn send(&self, envelope: &SignalEnvelope) -> Result<(), BusError> {
        let (event, payload) = encode(envelope)?;
        tracing::debug!("Signal out on {}: {}", self.key(), event);
        self.inner.broadcast(event, payload).await
    }

    /// Next well-formed envelope; malformed events are logged and skipped.
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        loop {
            let message = self.inner.recv().await?;
            match decode(&message) {
                Ok(envelope) => return Some(envelope),
                Err(e) => tracing::warn!("Dropping malformed signal on {}: {}", self.key(), e),
            }
        }
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use serde_json::json;

    #[test]
    fn test_channel_key_is_symmetric() {
        let pairs = [("alice", "bob"), ("u-9", "u-10"), ("same", "same")];
        for (a, b) in pairs {
            let (a, b) = (UserId::from(a), UserId::from(b));
            assert_eq!(channel_key(&a, &b), channel_key(&b, &a));
        }
        assert_eq!(
            channel_key(&UserId::from("zed"), &UserId::from("amy")),
            "call:amy_zed"
        );
    }

    #[test]
    fn test_ghost_window_boundary() {
        assert!(!is_stale(10_000, 15_000, 5000));
        assert!(is_stale(10_000, 15_001, 5000));
        // Clock skew into the future is not stale.
        assert!(!is_stale(20_000, 15_000, 5000));
    }

    #[test]
    fn test_wire_shape() {
        let env = SignalEnvelope {
            sender_id: UserId::from("alice"),
            body: SignalBody::Negotiation(NegotiationBlob::new(b"hi".to_vec())),
            sent_at_ms: 1700000000000,
        };
        let (event, payload) = encode(&env).unwrap();
        assert_eq!(event, "signal");
        assert_eq!(
            payload,
            json!({"from": "alice", "sentAt": 1700000000000i64, "signal": "aGk="})
        );

        let ready = SignalEnvelope {
            body: SignalBody::ReadyPing,
            ..env.clone()
        };
        let (event, payload) = encode(&ready).unwrap();
        assert_eq!(event, "ready");
        assert!(payload.get("signal").is_none());
    }

    #[test]
    fn test_decode_rejects_bad_events() {
        let missing = BusMessage {
            event: "signal".to_string(),
            payload: json!({"from": "a", "sentAt": 1}),
        };
        assert!(decode(&missing).is_err());

        let unknown = BusMessage {
            event: "typing".to_string(),
            payload: json!({"from": "a", "sentAt": 1}),
        };
        assert!(decode(&unknown).is_err());

        let hangup = BusMessage {
            event: "hangup".to_string(),
            payload: json!({"from": "a", "sentAt": 1}),
        };
        assert_eq!(decode(&hangup).unwrap().body, SignalBody::Hangup);
    }

    #[tokio::test]
    async fn test_channel_delivers_between_parties() {
        let bus = MemoryBus::new();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        let a = SignalingChannel::open(&bus, &alice, &bob).await.unwrap();
        let mut b = SignalingChannel::open(&bus, &bob, &alice).await.unwrap();
        assert_eq!(a.key(), b.key());

        let env = SignalEnvelope::now(alice.clone(), SignalBody::ReadyPing);
        a.send(&env).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), env);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = MemoryBus::new();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        let mut ch = SignalingChannel::open(&bus, &alice, &bob).await.unwrap();
        ch.close().await;
        ch.close().await;
        assert_eq!(bus.close_count("call:alice_bob"), 1);
    }
}
