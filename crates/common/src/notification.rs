// Core notification domain types shared across Pylon crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminator for the domain occurrence a notification describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    EventCreated,
    EventUpdated,
    EventDeleted,
    RsvpAdded,
    RsvpCancelled,
    UserFollowed,
    UserUnfollowed,
}

impl NotificationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EventCreated => "event_created",
            Self::EventUpdated => "event_updated",
            Self::EventDeleted => "event_deleted",
            Self::RsvpAdded => "rsvp_added",
            Self::RsvpCancelled => "rsvp_cancelled",
            Self::UserFollowed => "user_followed",
            Self::UserUnfollowed => "user_unfollowed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "event_created" => Some(Self::EventCreated),
            "event_updated" => Some(Self::EventUpdated),
            "event_deleted" => Some(Self::EventDeleted),
            "rsvp_added" => Some(Self::RsvpAdded),
            "rsvp_cancelled" => Some(Self::RsvpCancelled),
            "user_followed" => Some(Self::UserFollowed),
            "user_unfollowed" => Some(Self::UserUnfollowed),
            _ => None,
        }
    }
}

/// One unit of delivered-or-deliverable information, as built by the event
/// ingestor. Carries no id — ids are assigned by the offline store on
/// persistence; notifications delivered live never receive one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    /// Opaque structured data specific to `kind`.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A notification row as persisted by the offline store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredNotification {
    pub id: i64,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub payload: serde_json::Value,
    pub is_delivered: bool,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}
