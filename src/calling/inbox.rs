//! Per-user inbox for ringing and cancellation notices.
//!
//! Notices are fire-and-forget broadcasts on `inbox:{user}`. A notice sent
//! while the recipient is not subscribed is simply lost; the missed-call
//! row written on cancellation is the durable trace.

use std::sync::Arc;

use serde::Serialize;

use super::CallError;
use crate::api::MessageLog;
use crate::bus::{BusChannel, ChannelConfig, MessageBus};
use crate::models::{CallCancelledPayload, IncomingCallPayload, InboxEvent, NewMessage, UserId};

pub const INCOMING_CALL_EVENT: &str = "incoming-call";
pub const CALL_CANCELLED_EVENT: &str = "call-cancelled";

/// Bus channel name of `user`'s inbox.
pub fn inbox_channel(user: &UserId) -> String {
    format!("inbox:{}", user)
}

/// Sends inbox notices and opens inbox subscriptions.
#[derive(Clone)]
pub struct InboxNotifier {
    bus: Arc<dyn MessageBus>,
    log: Arc<dyn MessageLog>,
}

impl InboxNotifier {
    pub fn new(bus: Arc<dyn MessageBus>, log: Arc<dyn MessageLog>) -> Self {
        Self { bus, log }
    }

    /// Listen on our own inbox.
    pub async fn subscribe(&self, own_id: &UserId) -> Result<InboxSubscription, CallError> {
        let channel = self
            .bus
            .open(&inbox_channel(own_id), ChannelConfig::default())
            .await?;
        tracing::info!("Listening for calls on {}", channel.name());
        Ok(InboxSubscription {
            own_id: own_id.clone(),
            channel,
            log: self.log.clone(),
        })
    }

    /// Ring `callee`. Best effort.
    pub async fn notify_incoming(&self, callee: &UserId, payload: &IncomingCallPayload) {
        self.push(callee, INCOMING_CALL_EVENT, payload).await;
    }

    /// Tell `other` that an unconnected call is off. Best effort.
    pub async fn notify_cancelled(&self, other: &UserId, payload: &CallCancelledPayload) {
        self.push(other, CALL_CANCELLED_EVENT, payload).await;
    }

    async fn push<T: Serialize + Sync>(&self, target: &UserId, event: &str, payload: &T) {
        let name = inbox_channel(target);
        let value = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to encode {} notice: {}", event, e);
                return;
            }
        };
        let mut channel = match self.bus.open(&name, ChannelConfig::default()).await {
            Ok(ch) => ch,
            Err(e) => {
                tracing::warn!("Could not reach {}: {}", name, e);
                return;
            }
        };
        match channel.broadcast(event, value).await {
            Ok(()) => tracing::info!("Sent {} to {}", event, name),
            Err(e) => tracing::warn!("Failed to send {} to {}: {}", event, name, e),
        }
        channel.close().await;
    }
}

/// Open subscription to our own inbox.
pub struct InboxSubscription {
    own_id: UserId,
    channel: Box<dyn BusChannel>,
    log: Arc<dyn MessageLog>,
}

impl InboxSubscription {
    /// Next inbox event, `None` once the subscription is gone.
    ///
    /// A cancellation notice appends one missed-call row to the message
    /// log before it is returned.
    pub async fn next(&mut self) -> Option<InboxEvent> {
        loop {
            let message = self.channel.recv().await?;
            match message.event.as_str() {
                INCOMING_CALL_EVENT => {
                    match serde_json::from_value::<IncomingCallPayload>(message.payload) {
                        Ok(payload) => {
                            tracing::info!(
                                "Incoming {} call from {} ({})",
                                payload.kind,
                                payload.caller_name,
                                payload.caller_id
                            );
                            return Some(InboxEvent::IncomingCall(payload));
                        }
                        Err(e) => tracing::warn!("Malformed incoming-call notice: {}", e),
                    }
                }
                CALL_CANCELLED_EVENT => {
                    match serde_json::from_value::<CallCancelledPayload>(message.payload) {
                        Ok(payload) => {
                            self.record_missed_call(&payload).await;
                            return Some(InboxEvent::CallCancelled(payload));
                        }
                        Err(e) => tracing::warn!("Malformed call-cancelled notice: {}", e),
                    }
                }
                other => tracing::debug!("Ignoring inbox event {}", other),
            }
        }
    }

    async fn record_missed_call(&self, payload: &CallCancelledPayload) {
        let row = NewMessage {
            sender_id: payload.caller_id.clone(),
            receiver_id: self.own_id.clone(),
            text: payload.missed_call_text(),
            is_read: false,
        };
        if let Err(e) = self.log.append(row).await {
            tracing::warn!("Failed to record missed call from {}: {:#}", payload.caller_id, e);
        }
    }

    pub async fn close(&mut self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::InMemoryMessageLog;
    use crate::bus::MemoryBus;
    use crate::models::CallKind;
    use serde_json::json;
    use std::time::Duration;

    fn notifier() -> (MemoryBus, InMemoryMessageLog, InboxNotifier) {
        let bus = MemoryBus::new();
        let log = InMemoryMessageLog::new();
        let inbox = InboxNotifier::new(Arc::new(bus.clone()), Arc::new(log.clone()));
        (bus, log, inbox)
    }

    #[tokio::test]
    async fn test_incoming_call_reaches_subscriber() {
        let (_bus, log, inbox) = notifier();
        let bob = UserId::from("bob");
        let mut sub = inbox.subscribe(&bob).await.unwrap();

        let payload = IncomingCallPayload {
            caller_id: UserId::from("alice"),
            caller_name: "Alice".to_string(),
            kind: CallKind::Video,
        };
        inbox.notify_incoming(&bob, &payload).await;

        assert_eq!(sub.next().await, Some(InboxEvent::IncomingCall(payload)));
        assert!(log.rows().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_leaves_one_missed_call_row() {
        let (_bus, log, inbox) = notifier();
        let bob = UserId::from("bob");
        let mut sub = inbox.subscribe(&bob).await.unwrap();

        let payload = CallCancelledPayload {
            caller_id: UserId::from("alice"),
            kind: CallKind::Voice,
        };
        inbox.notify_cancelled(&bob, &payload).await;
        assert_eq!(sub.next().await, Some(InboxEvent::CallCancelled(payload)));

        let rows = log.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "Missed voice call");
        assert_eq!(rows[0].sender_id, UserId::from("alice"));
        assert_eq!(rows[0].receiver_id, bob);
        assert!(!rows[0].is_read);
    }

    #[tokio::test]
    async fn test_notice_without_subscriber_is_lost() {
        let (bus, _log, inbox) = notifier();
        let bob = UserId::from("bob");
        let payload = IncomingCallPayload {
            caller_id: UserId::from("alice"),
            caller_name: "Alice".to_string(),
            kind: CallKind::Voice,
        };
        inbox.notify_incoming(&bob, &payload).await;

        let mut sub = inbox.subscribe(&bob).await.unwrap();
        let next = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(next.is_err());
        assert_eq!(bus.close_count("inbox:bob"), 1);
    }

    #[tokio::test]
    async fn test_malformed_notice_is_skipped() {
        let (bus, _log, inbox) = notifier();
        let bob = UserId::from("bob");
        let mut sub = inbox.subscribe(&bob).await.unwrap();

        let raw = bus
            .open("inbox:bob", ChannelConfig::default())
            .await
            .unwrap();
        raw.broadcast(INCOMING_CALL_EVENT, json!({"callerId": 5}))
            .await
            .unwrap();
        raw.broadcast(
            CALL_CANCELLED_EVENT,
            json!({"callerId": "alice", "type": "video"}),
        )
        .await
        .unwrap();

        match sub.next().await {
            Some(InboxEvent::CallCancelled(p)) => assert_eq!(p.kind, CallKind::Video),
            other => panic!("unexpected {:?}", other),
        }
    }
}
