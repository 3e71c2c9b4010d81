use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tally_api::{app, worker, AppState, AuthConfig};
use tally_core::NoopMediaStore;
use tally_store::app_config::Config;
use tally_store::{DbClient, EventProducer, KafkaReindexSink, PostgresInventoryRepository, RedisClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_api=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Tally API on port {}", config.server.port);

    let db = DbClient::new(&config.database.url)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    let inventory = match db.fetch_inventory_overrides(config.inventory.clone()).await {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Using file inventory settings, overrides unavailable: {}", e);
            config.inventory.clone()
        }
    };

    let redis = RedisClient::new(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;
    let events = EventProducer::new(&config.kafka.brokers).context("Failed to create Kafka producer")?;

    let repo = Arc::new(PostgresInventoryRepository::new(db.pool.clone()));
    let reindex = Arc::new(KafkaReindexSink::new(events.clone()));

    let app_state = AppState::new(
        repo,
        Arc::new(NoopMediaStore),
        reindex,
        inventory,
        AuthConfig {
            secret: config.auth.jwt_secret.clone(),
            expiration: config.auth.jwt_expiration_seconds,
        },
    )
    .with_redis(Arc::new(redis), config.server.rate_limit_per_minute)
    .with_events(Arc::new(events));

    if config.worker.enabled {
        worker::start_background_workers(app_state.clone(), config.worker.clone());
    }

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
