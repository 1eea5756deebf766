use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::time::Duration;

/// Upper bound on waiting for a pooled connection. A flush that hits it fails
/// and drops its batch.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// One pool per process. Buffer flushes, feed reads and plain CRUD all draw
/// from it.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<Pool<Postgres>> {
    let max_connections = max_connections.max(1);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
        .context("connect to postgres")?;
    tracing::debug!(max_connections, "postgres pool ready");
    Ok(pool)
}

pub async fn check_ready(pool: &Pool<Postgres>) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("postgres readiness probe")?;
    Ok(())
}
