mod api;
mod auth;
mod config;
mod db;
mod dispatch;
mod error;
mod fanout;
mod ingest;
mod metrics;
mod presence;
mod registry;
mod store;
mod ws;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use redis::aio::ConnectionManager;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    auth::jwt::JwtAccessTokenService,
    config::NotifierConfig,
    dispatch::Dispatcher,
    error::{
        attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
        ErrorCode, NotifierError,
    },
    fanout::FanoutBus,
    ingest::EventIngestor,
    metrics::NotifierMetrics,
    presence::PresenceDirectory,
    registry::ConnectionRegistry,
    store::OfflineStore,
};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NotifierConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .init();

    if config.is_dev_jwt_secret() {
        warn!("using development JWT secret, set PYLON_NOTIFIER_JWT_SECRET in production");
    }

    metrics::set_global_metrics(Arc::new(NotifierMetrics::default()));

    let instance_id = Uuid::new_v4();
    let fanout_channel = fanout::instance_channel(instance_id);

    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid notifier JWT secret")?,
    );

    let database_url = config
        .database_url
        .as_deref()
        .context("PYLON_NOTIFIER_DATABASE_URL must be set")?;
    let pool_settings = db::pool::PoolSettings {
        min_connections: config.db_min_connections,
        max_connections: config.db_max_connections,
        acquire_timeout: Duration::from_secs(config.db_acquire_timeout_secs),
    };
    let pool = db::pool::connect(database_url, &pool_settings).await?;
    db::pool::check_pool_health(&pool).await?;
    db::migrations::run_migrations(&pool).await?;
    let store = OfflineStore::postgres(pool);

    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("invalid notifier Redis URL")?;
    let redis_conn = ConnectionManager::new(redis_client.clone())
        .await
        .context("failed to connect to notifier Redis")?;

    let registry = ConnectionRegistry::new();
    let presence = PresenceDirectory::redis(
        redis_conn.clone(),
        Duration::from_secs(config.presence_ttl_secs),
    );
    let fanout_bus = FanoutBus::redis(redis_client, redis_conn.clone());
    let dispatcher = Dispatcher::new(
        registry.clone(),
        presence.clone(),
        fanout_bus.clone(),
        store.clone(),
        instance_id,
    );

    {
        let bus = fanout_bus.clone();
        let dispatcher = dispatcher.clone();
        let channel = fanout_channel.clone();
        tokio::spawn(async move {
            bus.run_subscriber(channel, move |frame| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.deliver_forwarded(frame).await }
            })
            .await;
        });
    }

    {
        let ingestor = EventIngestor::new(
            redis_conn,
            config.event_stream_key.clone(),
            instance_id,
            dispatcher,
        );
        tokio::spawn(async move {
            if let Err(ingest_error) = ingestor.run().await {
                error!(error = ?ingest_error, "event ingestion stopped");
            }
        });
    }

    let ws_state = ws::WsState {
        jwt_service: Arc::clone(&jwt_service),
        registry,
        presence,
        instance_id,
        fanout_channel,
        timings: ws::WsTimings::default(),
    };
    let app = build_router(ws_state, store, jwt_service);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind notifier listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, %instance_id, "starting notifier server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("notifier server exited unexpectedly")
}

fn build_router(
    ws_state: ws::WsState,
    store: OfflineStore,
    jwt_service: Arc<JwtAccessTokenService>,
) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(ws_state))
            .merge(api::router(store, jwt_service)),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            NotifierError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;

    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::{apply_middleware, build_router};
    use crate::{
        auth::jwt::JwtAccessTokenService,
        fanout::instance_channel,
        presence::PresenceDirectory,
        registry::ConnectionRegistry,
        store::OfflineStore,
        ws::WsState,
    };

    fn test_router() -> Router {
        let jwt_service = Arc::new(
            JwtAccessTokenService::new("pylon_test_secret_that_is_definitely_long_enough")
                .expect("test jwt service should initialize"),
        );
        let instance_id = Uuid::new_v4();
        let ws_state = WsState {
            jwt_service: Arc::clone(&jwt_service),
            registry: ConnectionRegistry::new(),
            presence: PresenceDirectory::memory(),
            instance_id,
            fanout_channel: instance_channel(instance_id),
            timings: crate::ws::WsTimings::default(),
        };
        build_router(ws_state, OfflineStore::memory(), jwt_service)
    }

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn inbound_request_id_is_echoed_back() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-request-id", "req-inbound-789")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(
            response.headers().get("x-request-id").and_then(|value| value.to_str().ok()),
            Some("req-inbound-789"),
        );
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let app = apply_middleware(Router::new().route("/panic", get(panic_route)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/panic")
                    .body(Body::empty())
                    .expect("panic request should build"),
            )
            .await
            .expect("panic request should return a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("panic response body should be readable");
        let parsed: serde_json::Value =
            serde_json::from_slice(&body).expect("panic response body should be valid json");
        assert_eq!(parsed["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(parsed["error"]["retryable"], true);
    }
}
