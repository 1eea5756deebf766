use anyhow::{Context, Result};
use sqlx::{migrate::Migrator, Pool, Postgres};

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run(pool: &Pool<Postgres>) -> Result<()> {
    MIGRATOR.run(pool).await.context("apply migrations")?;
    tracing::info!(schema_version = latest_version(), "schema up to date");
    Ok(())
}

pub fn latest_version() -> i64 {
    MIGRATOR
        .iter()
        .map(|migration| migration.version)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_schema_is_embedded() {
        let feed = MIGRATOR
            .iter()
            .find(|migration| migration.version == 1)
            .expect("migration 0001");
        assert_eq!(feed.description, "feed");
        assert!(feed.sql.contains("CONSTRAINT pk__likes"));
        assert!(latest_version() >= 1);
    }
}
