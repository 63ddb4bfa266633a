// Notifier server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Individual modules (DB pool, etc.) may still read their own
// env vars — this module covers the core server settings.

use std::net::SocketAddr;

/// Core notifier server configuration.
///
/// Constructed via [`NotifierConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for access tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string for the offline store.
    pub database_url: Option<String>,
    /// Offline store pool floor.
    pub db_min_connections: u32,
    /// Offline store pool ceiling.
    pub db_max_connections: u32,
    /// How long a request may wait for a pooled connection, in seconds.
    pub db_acquire_timeout_secs: u64,
    /// Redis connection string (presence, fan-out, event stream).
    pub redis_url: String,
    /// Presence lease TTL in seconds.
    pub presence_ttl_secs: u64,
    /// Redis Streams key the domain events arrive on.
    pub event_stream_key: String,
    /// Log filter directive (e.g. `info`, `pylon_notifier=debug`).
    pub log_filter: String,
}

impl NotifierConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `PYLON_NOTIFIER_HOST` | `0.0.0.0` |
    /// | `PYLON_NOTIFIER_PORT` | `8080` |
    /// | `PYLON_NOTIFIER_JWT_SECRET` | dev-only placeholder |
    /// | `PYLON_NOTIFIER_DATABASE_URL` | *(none — required at startup)* |
    /// | `PYLON_NOTIFIER_DB_MIN_CONNECTIONS` | `2` |
    /// | `PYLON_NOTIFIER_DB_MAX_CONNECTIONS` | `20` |
    /// | `PYLON_NOTIFIER_DB_ACQUIRE_TIMEOUT_SECS` | `10` |
    /// | `PYLON_NOTIFIER_REDIS_URL` | `redis://127.0.0.1:6379` |
    /// | `PYLON_NOTIFIER_PRESENCE_TTL_SECS` | `90` |
    /// | `PYLON_NOTIFIER_EVENT_STREAM` | `events:domain` |
    /// | `PYLON_NOTIFIER_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("PYLON_NOTIFIER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("PYLON_NOTIFIER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("PYLON_NOTIFIER_JWT_SECRET").unwrap_or_else(|_| {
            "pylon_local_development_jwt_secret_must_be_32_chars".into()
        });

        let database_url = env("PYLON_NOTIFIER_DATABASE_URL").ok();

        let db_min_connections = env("PYLON_NOTIFIER_DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);

        let db_max_connections = env("PYLON_NOTIFIER_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        let db_acquire_timeout_secs = env("PYLON_NOTIFIER_DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let redis_url = env("PYLON_NOTIFIER_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let presence_ttl_secs = env("PYLON_NOTIFIER_PRESENCE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(90);

        let event_stream_key =
            env("PYLON_NOTIFIER_EVENT_STREAM").unwrap_or_else(|_| "events:domain".into());

        let log_filter =
            env("PYLON_NOTIFIER_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            db_min_connections,
            db_max_connections,
            db_acquire_timeout_secs,
            redis_url,
            presence_ttl_secs,
            event_stream_key,
            log_filter,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == "pylon_local_development_jwt_secret_must_be_32_chars"
    }
}
