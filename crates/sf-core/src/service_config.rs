use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{Pool, Postgres};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service: String,
    pub version: i64,
    pub config_json: Value,
}

pub async fn load_service_config(
    pool: &Pool<Postgres>,
    service: &str,
) -> Result<Option<ServiceConfig>> {
    let row = sqlx::query_as::<_, (String, i64, Value)>(
        "SELECT service, version, config_json FROM service_configs WHERE service = $1",
    )
    .bind(service)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("load service config {service}"))?;

    Ok(row.map(|(service, version, config_json)| ServiceConfig {
        service,
        version,
        config_json,
    }))
}

/// Stored config for `service`, or `default_config` (version 0) when no row
/// exists yet.
pub async fn load_or_default(
    pool: &Pool<Postgres>,
    service: &str,
    default_config: Value,
) -> Result<ServiceConfig> {
    match load_service_config(pool, service).await? {
        Some(config) => {
            tracing::info!(service = service, version = config.version, "service config loaded");
            Ok(config)
        }
        None => Ok(ServiceConfig {
            service: service.to_string(),
            version: 0,
            config_json: default_config,
        }),
    }
}

/// Inserts `config_json` for `service` unless a row already exists. Returns
/// whether a row was written.
pub async fn seed_service_config(
    pool: &Pool<Postgres>,
    service: &str,
    config_json: Value,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO service_configs (service, version, config_json) VALUES ($1, 1, $2) \
         ON CONFLICT (service) DO NOTHING",
    )
    .bind(service)
    .bind(config_json)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
