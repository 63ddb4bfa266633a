// Wire format for cross-instance notification forwarding.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notification::Notification;

/// Body published on an instance's fan-out channel: the full notification
/// plus the target user, so the receiving instance can re-enter delivery
/// against its local connection registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanoutFrame {
    pub user_id: Uuid,
    pub notification: Notification,
}
