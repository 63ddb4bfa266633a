// WebSocket message types for the pylon-notify.v1 protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notification::Notification;

/// Application close code sent to a socket displaced by a newer connection
/// for the same user.
pub const CLOSE_REPLACED: u16 = 4000;

/// Application close code for a connection that exceeded the idle ceiling.
pub const CLOSE_IDLE_TIMEOUT: u16 = 4001;

/// All message types in the pylon-notify.v1 WebSocket protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Server -> Client: sent once after a successful upgrade + auth.
    Welcome {
        user_id: Uuid,
        server_time: String,
        heartbeat_interval_ms: u32,
    },

    /// Server -> Client: a delivered notification.
    Notification { notification: Notification },

    /// Server -> Client: error.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}
