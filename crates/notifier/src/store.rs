use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use pylon_common::notification::{Notification, NotificationKind, StoredNotification};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

type NotificationRow = (
    i64,
    Uuid,
    String,
    String,
    String,
    serde_json::Value,
    bool,
    bool,
    DateTime<Utc>,
);

#[derive(Debug, Default)]
pub struct MemoryState {
    rows: Vec<StoredNotification>,
    next_id: i64,
}

/// Durable fallback for notifications whose target user was offline (or whose
/// live delivery failed).
#[derive(Clone)]
pub enum OfflineStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryState>>),
}

impl OfflineStore {
    pub fn postgres(pool: PgPool) -> Self {
        Self::Postgres(pool)
    }

    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryState::default())))
    }

    /// Persist a notification for later retrieval, returning its assigned id.
    pub async fn insert(&self, notification: &Notification) -> anyhow::Result<i64> {
        match self {
            Self::Postgres(pool) => {
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO notifications (user_id, kind, title, message, payload, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     RETURNING id",
                )
                .bind(notification.user_id)
                .bind(notification.kind.as_str())
                .bind(&notification.title)
                .bind(&notification.message)
                .bind(&notification.payload)
                .bind(notification.created_at)
                .fetch_one(pool)
                .await
                .context("failed to persist offline notification")?;
                Ok(id)
            }
            Self::Memory(state) => {
                let mut state = state.write().await;
                state.next_id += 1;
                let id = state.next_id;
                state.rows.push(StoredNotification {
                    id,
                    user_id: notification.user_id,
                    kind: notification.kind,
                    title: notification.title.clone(),
                    message: notification.message.clone(),
                    payload: notification.payload.clone(),
                    is_delivered: false,
                    is_read: false,
                    created_at: notification.created_at,
                });
                Ok(id)
            }
        }
    }

    /// Return the user's unread notifications, newest first, marking them
    /// delivered and read in the same statement. Retrieval is consume-once:
    /// a retried request after a success returns an empty list rather than
    /// duplicates.
    pub async fn take_unread(&self, user_id: Uuid) -> anyhow::Result<Vec<StoredNotification>> {
        match self {
            Self::Postgres(pool) => {
                let rows: Vec<NotificationRow> = sqlx::query_as(
                    "WITH marked AS (
                         UPDATE notifications
                         SET is_read = TRUE, is_delivered = TRUE
                         WHERE user_id = $1 AND is_read = FALSE
                         RETURNING id, user_id, kind, title, message, payload,
                                   is_delivered, is_read, created_at
                     )
                     SELECT id, user_id, kind, title, message, payload,
                            is_delivered, is_read, created_at
                     FROM marked
                     ORDER BY created_at DESC, id DESC",
                )
                .bind(user_id)
                .fetch_all(pool)
                .await
                .context("failed to retrieve offline notifications")?;

                rows.into_iter().map(row_to_stored).collect()
            }
            Self::Memory(state) => {
                let mut state = state.write().await;
                let mut taken = Vec::new();
                for row in &mut state.rows {
                    if row.user_id == user_id && !row.is_read {
                        row.is_read = true;
                        row.is_delivered = true;
                        taken.push(row.clone());
                    }
                }
                taken.sort_by(|a, b| {
                    b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id))
                });
                Ok(taken)
            }
        }
    }

    /// Count of unread rows for a user. Test and diagnostics helper.
    pub async fn unread_count(&self, user_id: Uuid) -> anyhow::Result<i64> {
        match self {
            Self::Postgres(pool) => {
                let count: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND is_read = FALSE",
                )
                .bind(user_id)
                .fetch_one(pool)
                .await
                .context("failed to count unread notifications")?;
                Ok(count)
            }
            Self::Memory(state) => {
                let state = state.read().await;
                let count =
                    state.rows.iter().filter(|row| row.user_id == user_id && !row.is_read).count();
                Ok(count as i64)
            }
        }
    }
}

fn row_to_stored(row: NotificationRow) -> anyhow::Result<StoredNotification> {
    let (id, user_id, kind, title, message, payload, is_delivered, is_read, created_at) = row;
    let kind = NotificationKind::parse(&kind)
        .ok_or_else(|| anyhow!("notification row {id} has unknown kind '{kind}'"))?;

    Ok(StoredNotification {
        id,
        user_id,
        kind,
        title,
        message,
        payload,
        is_delivered,
        is_read,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::OfflineStore;
    use chrono::{Duration, Utc};
    use pylon_common::notification::{Notification, NotificationKind};
    use uuid::Uuid;

    fn notification_at(user_id: Uuid, seconds_ago: i64) -> Notification {
        Notification {
            user_id,
            kind: NotificationKind::EventCreated,
            title: "New event".to_owned(),
            message: "An event you follow was created".to_owned(),
            payload: serde_json::json!({ "event_id": Uuid::new_v4() }),
            created_at: Utc::now() - Duration::seconds(seconds_ago),
        }
    }

    #[tokio::test]
    async fn insert_assigns_monotonic_ids() {
        let store = OfflineStore::memory();
        let user_id = Uuid::new_v4();

        let first = store.insert(&notification_at(user_id, 10)).await.expect("insert");
        let second = store.insert(&notification_at(user_id, 5)).await.expect("insert");

        assert!(second > first);
    }

    #[tokio::test]
    async fn take_unread_returns_newest_first_and_consumes() {
        let store = OfflineStore::memory();
        let user_id = Uuid::new_v4();

        store.insert(&notification_at(user_id, 30)).await.expect("insert");
        store.insert(&notification_at(user_id, 10)).await.expect("insert");
        store.insert(&notification_at(user_id, 20)).await.expect("insert");

        let taken = store.take_unread(user_id).await.expect("take_unread");
        assert_eq!(taken.len(), 3);
        assert!(taken.windows(2).all(|pair| pair[0].created_at >= pair[1].created_at));
        assert!(taken.iter().all(|row| row.is_read && row.is_delivered));

        let retried = store.take_unread(user_id).await.expect("take_unread retry");
        assert!(retried.is_empty());
    }

    #[tokio::test]
    async fn take_unread_is_scoped_to_one_user() {
        let store = OfflineStore::memory();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();

        store.insert(&notification_at(user_a, 5)).await.expect("insert");
        store.insert(&notification_at(user_b, 5)).await.expect("insert");

        let taken = store.take_unread(user_a).await.expect("take_unread");
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].user_id, user_a);

        assert_eq!(store.unread_count(user_b).await.expect("unread_count"), 1);
    }
}
