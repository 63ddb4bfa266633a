use std::time::Duration;

use anyhow::Context;
use pylon_common::{
    event::{DomainEvent, MalformedEvent},
    notification::{Notification, NotificationKind},
};
use redis::{
    aio::ConnectionManager,
    streams::{StreamReadOptions, StreamReadReply},
    AsyncCommands,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{dispatch::Dispatcher, metrics};

const READ_BLOCK_MS: usize = 5_000;
const READ_BATCH_SIZE: usize = 32;
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const CONSUMER_NAME: &str = "notifier";

/// Stream entry field holding the event JSON.
const PAYLOAD_FIELD: &str = "payload";

pub fn consumer_group(instance_id: Uuid) -> String {
    format!("notifier-{instance_id}")
}

/// Build the user-facing notification for a domain event.
///
/// Copy falls back to a generic line when the event body is missing the
/// fields the richer template needs; a missing field never rejects an event.
pub fn map_event(event: &DomainEvent) -> Result<Notification, MalformedEvent> {
    let kind = NotificationKind::parse(&event.kind)
        .ok_or_else(|| MalformedEvent::UnknownKind(event.kind.clone()))?;

    let event_title = event.field_str("event_title");
    let user_name = event.field_str("user_name");

    let (title, message) = match kind {
        NotificationKind::EventCreated => (
            "New event",
            match event_title {
                Some(name) => format!("\"{name}\" was created"),
                None => "An event you follow was created".to_owned(),
            },
        ),
        NotificationKind::EventUpdated => (
            "Event updated",
            match event_title {
                Some(name) => format!("\"{name}\" was updated"),
                None => "An event you follow was updated".to_owned(),
            },
        ),
        NotificationKind::EventDeleted => (
            "Event cancelled",
            match event_title {
                Some(name) => format!("\"{name}\" was cancelled"),
                None => "An event you follow was cancelled".to_owned(),
            },
        ),
        NotificationKind::RsvpAdded => (
            "New RSVP",
            match (user_name, event_title) {
                (Some(who), Some(name)) => format!("{who} is going to \"{name}\""),
                (Some(who), None) => format!("{who} is going to your event"),
                _ => "Someone RSVPed to your event".to_owned(),
            },
        ),
        NotificationKind::RsvpCancelled => (
            "RSVP cancelled",
            match (user_name, event_title) {
                (Some(who), Some(name)) => format!("{who} is no longer going to \"{name}\""),
                (Some(who), None) => format!("{who} is no longer going to your event"),
                _ => "Someone cancelled their RSVP".to_owned(),
            },
        ),
        NotificationKind::UserFollowed => (
            "New follower",
            match user_name {
                Some(who) => format!("{who} followed you"),
                None => "Someone followed you".to_owned(),
            },
        ),
        NotificationKind::UserUnfollowed => (
            "Follower left",
            match user_name {
                Some(who) => format!("{who} unfollowed you"),
                None => "Someone unfollowed you".to_owned(),
            },
        ),
    };

    Ok(Notification {
        user_id: event.user_id,
        kind,
        title: title.to_owned(),
        message,
        payload: serde_json::Value::Object(event.data.clone()),
        created_at: chrono::Utc::now(),
    })
}

/// Consumes domain events from the shared Redis stream and feeds them to the
/// dispatcher.
///
/// Each instance reads through its own consumer group, so every instance
/// sees every event and routes it independently. Entries are acknowledged
/// once the dispatcher has settled them; malformed entries are acknowledged
/// immediately after being logged so they cannot wedge the stream.
pub struct EventIngestor {
    conn: ConnectionManager,
    stream_key: String,
    group: String,
    dispatcher: Dispatcher,
}

impl EventIngestor {
    pub fn new(
        conn: ConnectionManager,
        stream_key: String,
        instance_id: Uuid,
        dispatcher: Dispatcher,
    ) -> Self {
        Self { conn, stream_key, group: consumer_group(instance_id), dispatcher }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.ensure_group().await?;
        info!(stream = %self.stream_key, group = %self.group, "event ingestion started");

        loop {
            let options = StreamReadOptions::default()
                .group(&self.group, CONSUMER_NAME)
                .block(READ_BLOCK_MS)
                .count(READ_BATCH_SIZE);

            let reply: StreamReadReply = match self
                .conn
                .xread_options(&[&self.stream_key], &[">"], &options)
                .await
            {
                Ok(reply) => reply,
                Err(error) => {
                    warn!(stream = %self.stream_key, %error, "stream read failed, backing off");
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                    continue;
                }
            };

            for stream in reply.keys {
                for entry in stream.ids {
                    self.handle_entry(&entry.id, entry.map.get(PAYLOAD_FIELD)).await;
                }
            }
        }
    }

    async fn handle_entry(&mut self, entry_id: &str, payload: Option<&redis::Value>) {
        match payload.map(|value| redis::from_redis_value::<String>(value)) {
            Some(Ok(raw)) => self.handle_payload(entry_id, &raw).await,
            Some(Err(error)) => {
                metrics::increment_malformed_events();
                warn!(entry_id, %error, "stream entry payload is not text, skipping");
            }
            None => {
                metrics::increment_malformed_events();
                warn!(entry_id, "stream entry has no payload field, skipping");
            }
        }

        self.acknowledge(entry_id).await;
    }

    async fn handle_payload(&mut self, entry_id: &str, raw: &str) {
        let event: DomainEvent = match serde_json::from_str(raw) {
            Ok(event) => event,
            Err(error) => {
                metrics::increment_malformed_events();
                warn!(entry_id, %error, "stream entry is not a valid domain event, skipping");
                return;
            }
        };

        let notification = match map_event(&event) {
            Ok(notification) => notification,
            Err(error) => {
                metrics::increment_malformed_events();
                warn!(entry_id, %error, "domain event rejected, skipping");
                return;
            }
        };

        let outcome = self.dispatcher.dispatch(notification).await;
        debug!(entry_id, ?outcome, "domain event settled");
    }

    async fn acknowledge(&mut self, entry_id: &str) {
        if let Err(error) = self
            .conn
            .xack::<_, _, _, i64>(&self.stream_key, &self.group, &[entry_id])
            .await
        {
            warn!(entry_id, %error, "failed to acknowledge stream entry");
        }
    }

    async fn ensure_group(&mut self) -> anyhow::Result<()> {
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            // Group already exists from a previous run of this instance.
            Err(error) if error.to_string().contains("BUSYGROUP") => Ok(()),
            Err(error) => Err(error).context("failed to create stream consumer group"),
        }
    }
}
