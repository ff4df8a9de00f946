//! Per-user inbox notices

use serde::{Deserialize, Serialize};

use super::{CallKind, UserId};

/// Pushed to the callee's inbox when a call is dialed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallPayload {
    pub caller_id: UserId,
    pub caller_name: String,
    #[serde(rename = "type")]
    pub kind: CallKind,
}

/// Pushed to the other party's inbox when an unconnected call is cancelled
/// or declined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallCancelledPayload {
    pub caller_id: UserId,
    #[serde(rename = "type")]
    pub kind: CallKind,
}

impl CallCancelledPayload {
    /// Text of the synthetic log entry left behind by a missed call.
    pub fn missed_call_text(&self) -> String {
        match self.kind {
            CallKind::Voice => "Missed voice call".to_string(),
            CallKind::Video => "Missed video call".to_string(),
        }
    }
}

/// Event delivered to an inbox subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxEvent {
    IncomingCall(IncomingCallPayload),
    CallCancelled(CallCancelledPayload),
}
