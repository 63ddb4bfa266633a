use std::time::Duration;

use pylon_common::{
    notification::Notification,
    protocol::{fanout::FanoutFrame, ws::WsMessage},
};
use rand::Rng;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    fanout::FanoutBus,
    metrics,
    presence::PresenceDirectory,
    registry::ConnectionRegistry,
    store::OfflineStore,
};

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF_BASE: Duration = Duration::from_millis(50);
const PERSIST_BACKOFF_JITTER_MS: u64 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Pushed straight down a socket on this instance.
    DeliveredLocal,
    /// Handed to the instance that holds the user's socket.
    Forwarded,
    /// User was offline (or live delivery failed); row written for later.
    PersistedOffline,
    /// Every path failed, including the store retries. The notification is
    /// lost and the loss is logged.
    DeadLettered,
}

/// Routes one notification to wherever its user currently is.
#[derive(Clone)]
pub struct Dispatcher {
    registry: ConnectionRegistry,
    presence: PresenceDirectory,
    fanout: FanoutBus,
    store: OfflineStore,
    instance_id: Uuid,
}

impl Dispatcher {
    pub fn new(
        registry: ConnectionRegistry,
        presence: PresenceDirectory,
        fanout: FanoutBus,
        store: OfflineStore,
        instance_id: Uuid,
    ) -> Self {
        Self { registry, presence, fanout, store, instance_id }
    }

    /// Decide between live delivery, cross-instance forwarding, and the
    /// offline store. Presence is consulted once; a stale claim (user listed
    /// here but no socket found) degrades to the offline path rather than
    /// retrying the lookup.
    pub async fn dispatch(&self, notification: Notification) -> DeliveryOutcome {
        let user_id = notification.user_id;

        let record = match self.presence.lookup(user_id).await {
            Ok(record) => record,
            Err(error) => {
                warn!(%user_id, %error, "presence lookup failed, treating user as offline");
                return self.persist_offline(notification).await;
            }
        };

        let Some(record) = record else {
            return self.persist_offline(notification).await;
        };

        if record.instance_id == self.instance_id {
            if self.registry.send(user_id, &WsMessage::Notification { notification: notification.clone() }) {
                metrics::increment_delivered_local();
                debug!(%user_id, "notification delivered on local socket");
                return DeliveryOutcome::DeliveredLocal;
            }
            warn!(%user_id, "presence names this instance but no live socket, persisting");
            return self.persist_offline(notification).await;
        }

        let frame = FanoutFrame { user_id, notification: notification.clone() };
        match self.fanout.publish(&record.channel, &frame).await {
            Ok(true) => {
                metrics::increment_forwarded();
                debug!(%user_id, channel = %record.channel, "notification forwarded");
                DeliveryOutcome::Forwarded
            }
            Ok(false) => {
                warn!(%user_id, channel = %record.channel, "no subscriber on target channel, persisting");
                self.persist_offline(notification).await
            }
            Err(error) => {
                warn!(%user_id, %error, "fanout publish failed, persisting");
                self.persist_offline(notification).await
            }
        }
    }

    /// Local delivery of a frame another instance forwarded here. The user
    /// may have disconnected while the frame was in flight, in which case it
    /// falls through to the offline store.
    pub async fn deliver_forwarded(&self, frame: FanoutFrame) {
        let user_id = frame.user_id;
        if self.registry.send(user_id, &WsMessage::Notification { notification: frame.notification.clone() }) {
            metrics::increment_delivered_local();
            return;
        }

        warn!(%user_id, "forwarded notification found no local socket, persisting");
        self.persist_offline(frame.notification).await;
    }

    async fn persist_offline(&self, notification: Notification) -> DeliveryOutcome {
        let user_id = notification.user_id;

        for attempt in 0..PERSIST_ATTEMPTS {
            match self.store.insert(&notification).await {
                Ok(id) => {
                    metrics::increment_persisted_offline();
                    debug!(%user_id, id, "notification persisted for offline delivery");
                    return DeliveryOutcome::PersistedOffline;
                }
                Err(error) => {
                    warn!(%user_id, attempt, %error, "offline persist attempt failed");
                    if attempt + 1 < PERSIST_ATTEMPTS {
                        tokio::time::sleep(persist_backoff(attempt)).await;
                    }
                }
            }
        }

        metrics::increment_dead_letter();
        error!(
            %user_id,
            kind = notification.kind.as_str(),
            "notification dead-lettered after exhausting persistence retries"
        );
        DeliveryOutcome::DeadLettered
    }
}

fn persist_backoff(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..PERSIST_BACKOFF_JITTER_MS);
    PERSIST_BACKOFF_BASE * 2u32.saturating_pow(attempt) + Duration::from_millis(jitter)
}
