use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use pylon_common::notification::StoredNotification;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    auth::{
        jwt::JwtAccessTokenService,
        middleware::{require_bearer_auth, AuthenticatedUser},
    },
    error::{ErrorCode, NotifierError},
    store::OfflineStore,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationsResponse {
    pub notifications: Vec<StoredNotification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn router(store: OfflineStore, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    let auth_layer = middleware::from_fn_with_state(jwt_service, require_bearer_auth);

    Router::new()
        .route("/v1/notifications", get(list_notifications).route_layer(auth_layer))
        .with_state(store)
}

/// Drain the caller's unread offline notifications.
///
/// Rows are marked read in the same statement that returns them, so a client
/// retrying this call after a success sees an empty list, not duplicates.
async fn list_notifications(
    Extension(user): Extension<AuthenticatedUser>,
    State(store): State<OfflineStore>,
) -> Response {
    match store.take_unread(user.user_id).await {
        Ok(notifications) => {
            let message = notifications
                .is_empty()
                .then(|| "No unread offline notifications.".to_owned());
            Json(NotificationsResponse { notifications, message }).into_response()
        }
        Err(error) => {
            error!(user_id = %user.user_id, %error, "failed to retrieve offline notifications");
            NotifierError::from_code(ErrorCode::PersistenceFailure).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{router, NotificationsResponse};
    use crate::{auth::jwt::JwtAccessTokenService, store::OfflineStore};
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Request, StatusCode},
    };
    use chrono::Utc;
    use pylon_common::notification::{Notification, NotificationKind};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const TEST_SECRET: &str = "pylon_test_secret_that_is_definitely_long_enough";

    fn test_notification(user_id: Uuid) -> Notification {
        Notification {
            user_id,
            kind: NotificationKind::UserFollowed,
            title: "New follower".to_owned(),
            message: "Ada followed you".to_owned(),
            payload: serde_json::json!({ "user_name": "Ada" }),
            created_at: Utc::now(),
        }
    }

    async fn fetch(
        store: &OfflineStore,
        jwt_service: &Arc<JwtAccessTokenService>,
        token: &str,
    ) -> (StatusCode, Option<NotificationsResponse>) {
        let response = router(store.clone(), Arc::clone(jwt_service))
            .oneshot(
                Request::builder()
                    .uri("/v1/notifications")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        let status = response.status();
        if !status.is_success() {
            return (status, None);
        }
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let parsed = serde_json::from_slice(&body).expect("response body should be valid JSON");
        (status, Some(parsed))
    }

    #[tokio::test]
    async fn requires_authentication() {
        let store = OfflineStore::memory();
        let jwt_service =
            Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize"));

        let response = router(store, jwt_service)
            .oneshot(
                Request::builder()
                    .uri("/v1/notifications")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn empty_result_carries_explanatory_message() {
        let store = OfflineStore::memory();
        let jwt_service =
            Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize"));
        let token =
            jwt_service.issue_token(Uuid::new_v4()).expect("token should be issued");

        let (status, body) = fetch(&store, &jwt_service, &token).await;
        let body = body.expect("success response should parse");

        assert_eq!(status, StatusCode::OK);
        assert!(body.notifications.is_empty());
        assert_eq!(body.message.as_deref(), Some("No unread offline notifications."));
    }

    #[tokio::test]
    async fn retrieval_consumes_and_retry_is_empty() {
        let store = OfflineStore::memory();
        let jwt_service =
            Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize"));
        let user_id = Uuid::new_v4();
        let token = jwt_service.issue_token(user_id).expect("token should be issued");

        store.insert(&test_notification(user_id)).await.expect("insert");
        store.insert(&test_notification(user_id)).await.expect("insert");

        let (_, body) = fetch(&store, &jwt_service, &token).await;
        let body = body.expect("success response should parse");
        assert_eq!(body.notifications.len(), 2);
        assert!(body.notifications.iter().all(|row| row.is_read && row.is_delivered));
        assert!(body.message.is_none());

        let (_, retry) = fetch(&store, &jwt_service, &token).await;
        let retry = retry.expect("success response should parse");
        assert!(retry.notifications.is_empty());
    }

    #[tokio::test]
    async fn only_returns_the_callers_rows() {
        let store = OfflineStore::memory();
        let jwt_service =
            Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize"));
        let caller = Uuid::new_v4();
        let other = Uuid::new_v4();
        let token = jwt_service.issue_token(caller).expect("token should be issued");

        store.insert(&test_notification(caller)).await.expect("insert");
        store.insert(&test_notification(other)).await.expect("insert");

        let (_, body) = fetch(&store, &jwt_service, &token).await;
        let body = body.expect("success response should parse");

        assert_eq!(body.notifications.len(), 1);
        assert_eq!(body.notifications[0].user_id, caller);
        assert_eq!(store.unread_count(other).await.expect("count"), 1);
    }
}
