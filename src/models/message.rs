//! Message log records

use serde::{Deserialize, Serialize};

use super::UserId;

/// Row appended to the persisted direct-message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    pub is_read: bool,
}
