#[path = "../src/db/migrations.rs"]
mod migrations;
#[path = "../src/db/pool.rs"]
mod pool;

use pool::{check_pool_health, connect, PoolSettings};

#[tokio::test]
async fn notifier_migrations_create_notifications_table() {
    let Some(database_url) = std::env::var("PYLON_NOTIFIER_TEST_DATABASE_URL").ok() else {
        eprintln!("skipping db migration integration test: set PYLON_NOTIFIER_TEST_DATABASE_URL");
        return;
    };

    let settings =
        PoolSettings { min_connections: 1, max_connections: 2, ..PoolSettings::default() };

    let pool =
        connect(&database_url, &settings).await.expect("pool should connect to test database");

    check_pool_health(&pool).await.expect("health check should pass");
    migrations::run_migrations(&pool).await.expect("migrations should apply");

    let table_names: Vec<String> = sqlx::query_scalar::<_, String>(
        "SELECT table_name \
         FROM information_schema.tables \
         WHERE table_schema = 'public'",
    )
    .fetch_all(&pool)
    .await
    .expect("table lookup should succeed");

    assert!(
        table_names.iter().any(|name| name == "notifications"),
        "expected table `notifications` to exist after migrations"
    );

    let unread_index_exists: bool = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS ( \
             SELECT 1 FROM pg_indexes \
             WHERE tablename = 'notifications' \
               AND indexname = 'idx_notifications_user_unread' \
         )",
    )
    .fetch_one(&pool)
    .await
    .expect("index lookup should succeed");

    assert!(unread_index_exists, "expected the partial unread index to exist after migrations");
}
