use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use adminguard::config::{AppConfig, SecurityConfig};
use adminguard::routes;
use adminguard::services::alerting::{self, DeliveryPolicy, QueuedDispatcher};
use adminguard::services::anomaly::AnomalyEngine;
use adminguard::services::clock::{Clock, SystemClock};
use adminguard::services::monitoring::MonitoringService;
use adminguard::services::patterns::PatternLibrary;
use adminguard::services::validator::InputValidator;
use adminguard::store::postgres::{PgAlertStore, PgEventStore};
use adminguard::store::redis::{RedisBaselineSource, RedisCounterStore};
use adminguard::store::Stores;
use adminguard::{db, AppState, Backends};
use mimalloc::MiMalloc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// M-MIMALLOC-APP: Use mimalloc as global allocator for improved performance.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const ROTATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adminguard=debug,security=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = AppConfig::from_env()?;
    let security = Arc::new(SecurityConfig::load(config.security_config_path.as_deref())?);

    let pool = db::create_pool(&config.database_url, config.database_max_connections).await?;
    db::run_migrations(&pool).await?;
    let redis = db::connect_redis(&config.redis_url).await?;

    let stores = Stores {
        events: Arc::new(PgEventStore::new(pool.clone())),
        alerts: Arc::new(PgAlertStore::new(pool.clone())),
        counters: Arc::new(RedisCounterStore::new(redis.clone())),
        baseline: Arc::new(RedisBaselineSource::new(redis.clone())),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let patterns = Arc::new(PatternLibrary::new()?);

    let channels = alerting::build_channels(
        &security.alerting,
        stores.alerts.clone(),
        reqwest::Client::new(),
    );
    tracing::info!(channels = channels.len(), "Alert channels configured");
    let (dispatcher, _dispatch_worker) = QueuedDispatcher::spawn(
        channels,
        DeliveryPolicy::from(&security.alerting),
        security.alerting.queue_capacity,
    );

    let engine = AnomalyEngine::new(
        security.clone(),
        patterns.clone(),
        stores.events.clone(),
        stores.baseline.as_ref(),
        clock.clone(),
    )
    .await?;

    let monitoring = Arc::new(
        MonitoringService::new(security.clone(), stores, Arc::new(dispatcher), clock)
            .with_engine(Arc::new(engine))
            .with_store_timeout(config.store_timeout_ms),
    );
    let validator = InputValidator::new(patterns, security.validation.clone(), monitoring.clone())?;

    let rotation = monitoring.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ROTATION_INTERVAL);
        // The first tick completes immediately; rotate a full interval after startup.
        interval.tick().await;
        loop {
            interval.tick().await;
            rotation.manage_log_rotation().await;
        }
    });

    let state = AppState {
        monitoring,
        validator,
        backends: Backends {
            db: Some(pool),
            redis: Some(redis),
        },
    };
    let app = routes::router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!(host = %addr, "Starting adminguard API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
