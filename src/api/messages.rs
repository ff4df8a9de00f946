//! Persisted direct-message log
//!
//! The call core only ever appends to it: a missed call leaves one text row
//! behind so the other party sees it in their conversation.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use super::client::RestClient;
use crate::models::NewMessage;

/// Append-only view of the message log.
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn append(&self, message: NewMessage) -> Result<()>;
}

/// Message log backed by the `messages` table.
pub struct RestMessageLog {
    client: RestClient,
}

impl RestMessageLog {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageLog for RestMessageLog {
    async fn append(&self, message: NewMessage) -> Result<()> {
        let rows = serde_json::json!([message]);
        self.client.insert("messages", &rows).await
    }
}

/// Message log kept in memory, for local demos.
#[derive(Clone, Default)]
pub struct InMemoryMessageLog {
    rows: Arc<Mutex<Vec<NewMessage>>>,
}

impl InMemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every appended row, oldest first.
    pub fn rows(&self) -> Vec<NewMessage> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl MessageLog for InMemoryMessageLog {
    async fn append(&self, message: NewMessage) -> Result<()> {
        tracing::debug!(
            "Message log: {} -> {}: {}",
            message.sender_id,
            message.receiver_id,
            message.text
        );
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserId;

    #[test]
    fn test_row_wire_shape() {
        let msg = NewMessage {
            sender_id: UserId::new("a"),
            receiver_id: UserId::new("b"),
            text: "Missed voice call".to_string(),
            is_read: false,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "sender_id": "a",
                "receiver_id": "b",
                "text": "Missed voice call",
                "is_read": false
            })
        );
    }

    #[test]
    fn test_in_memory_log_appends_in_order() {
        let log = InMemoryMessageLog::new();
        for text in ["one", "two"] {
            tokio_test::block_on(log.append(NewMessage {
                sender_id: UserId::new("a"),
                receiver_id: UserId::new("b"),
                text: text.to_string(),
                is_read: false,
            }))
            .unwrap();
        }
        let texts: Vec<String> = log.rows().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }
}
