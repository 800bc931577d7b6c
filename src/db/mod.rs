//! Database pool, Redis connection and migrations.

use redis::aio::MultiplexedConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create a PostgreSQL connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Apply pending schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Open a multiplexed Redis connection shared by the counter and baseline stores.
pub async fn connect_redis(redis_url: &str) -> Result<MultiplexedConnection, redis::RedisError> {
    redis::Client::open(redis_url)?
        .get_multiplexed_async_connection()
        .await
}
