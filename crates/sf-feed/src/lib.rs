use anyhow::{anyhow, Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sf_core::{config as env_config, db, http, logging, metrics, server, service_config};
use sqlx::{Pool, Postgres};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod buffer;
pub mod config;
pub mod error;
pub mod feed;
pub mod flush;
pub mod model;
pub mod pending;
pub mod repository;


pub use buffer::{BatchBuffer, FlushReport, FlushSink, FlushTrigger};
pub use config::{BufferSettings, FeedRuntimeConfig};
pub use error::{FeedError, FeedStage};
pub use feed::{FeedAggregator, FeedSource, PgFeedSource};
pub use flush::PgFlushPipeline;
pub use model::{NewPost, Post, PostAuthor, PostFilter, PostView};
pub use pending::{PostId, UserId};
pub use repository::{InteractionBuffers, PendingCounts, PgPostRepository, PostRepository};

pub const SERVICE_NAME: &str = "sf-feed";
/// `service_configs` row holding the buffer settings.
pub const CONFIG_SERVICE: &str = "feed";

/// Where buffer settings come from: the `service_configs` row, or the
/// built-in defaults. Env overrides apply on top of either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Database,
    Env,
}

impl FromStr for ConfigSource {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "db" | "database" => Ok(ConfigSource::Database),
            "env" => Ok(ConfigSource::Env),
            other => Err(anyhow!("unknown config source: {other}")),
        }
    }
}

#[derive(Clone)]
pub struct FeedServiceConfig {
    pub addr: SocketAddr,
    pub database_url: String,
    pub max_connections: u32,
    pub config_source: ConfigSource,
}

#[derive(Clone)]
struct AppState {
    pool: Pool<Postgres>,
    repository: Arc<PgPostRepository>,
}

#[derive(Serialize)]
struct HealthStatus {
    status: String,
    pending: PendingCounts,
}

pub fn load_config() -> Result<FeedServiceConfig> {
    let addr = env_config::socket_addr_from_env("FEED_ADDR", "0.0.0.0:8080")?;
    let database_url = env_config::required_env("DATABASE_URL")?;
    let max_connections = env_config::optional_u64_env("FEED_DB_MAX_CONNECTIONS")?
        .map(|value| u32::try_from(value).unwrap_or(u32::MAX))
        .unwrap_or(10);
    let config_source = match std::env::var("FEED_CONFIG_SOURCE") {
        Ok(value) => value.parse()?,
        Err(_) => ConfigSource::Database,
    };
    Ok(FeedServiceConfig {
        addr,
        database_url,
        max_connections,
        config_source,
    })
}

pub async fn load_runtime_config(
    pool: &Pool<Postgres>,
    source: ConfigSource,
) -> Result<FeedRuntimeConfig> {
    let document = match source {
        ConfigSource::Database => {
            service_config::load_or_default(pool, CONFIG_SERVICE, config::default_config_json())
                .await
                .context("load feed service config")?
                .config_json
        }
        ConfigSource::Env => config::default_config_json(),
    };
    FeedRuntimeConfig::from_json_with_env(&document)
}

pub async fn run(config: FeedServiceConfig) -> Result<()> {
    logging::init(SERVICE_NAME);
    metrics::init(SERVICE_NAME);

    let pool = db::connect(&config.database_url, config.max_connections).await?;
    let runtime = load_runtime_config(&pool, config.config_source).await?;
    let shutdown = CancellationToken::new();
    let repository = Arc::new(PgPostRepository::start_with_shutdown(
        pool.clone(),
        &runtime,
        shutdown.child_token(),
    ));

    let state = AppState {
        pool,
        repository: Arc::clone(&repository),
    };
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state);

    let router = http::apply_standard_layers(router, SERVICE_NAME, http::HttpLimits::PROBES);
    let served = server::serve(config.addr, router, shutdown).await;

    // Buffered events are abandoned, matching the crash case.
    let pending = repository.pending_counts().await;
    tracing::info!(
        likes = pending.likes,
        dislikes = pending.dislikes,
        views = pending.views,
        replies = pending.replies,
        "stopping flush timers"
    );
    repository.shutdown().await;
    served
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let pending = state.repository.pending_counts().await;
    match db::check_ready(&state.pool).await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthStatus {
                status: "ok".into(),
                pending,
            }),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthStatus {
                    status: "unavailable".into(),
                    pending,
                }),
            )
        }
    }
}

async fn metrics_endpoint() -> impl IntoResponse {
    metrics::metrics_response(SERVICE_NAME)
}
