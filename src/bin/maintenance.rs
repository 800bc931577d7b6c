//! Scheduled maintenance: log rotation, baseline refresh and counter rebuild.
//!
//! Usage: `maintenance [rotate|baseline|counters|all]` (default `all`).

use std::sync::Arc;

use adminguard::config::{AppConfig, SecurityConfig};
use adminguard::db;
use adminguard::models::alert::Alert;
use adminguard::services::alerting::NotificationDispatcher;
use adminguard::services::anomaly::behavioral::compute_baseline;
use adminguard::services::clock::{Clock, SystemClock};
use adminguard::services::monitoring::MonitoringService;
use adminguard::store::postgres::{PgAlertStore, PgEventStore};
use adminguard::store::redis::{RedisBaselineSource, RedisCounterStore};
use adminguard::store::{BaselineSource, Stores};
use chrono::Duration;
use mimalloc::MiMalloc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Maintenance never logs events, so nothing reaches the dispatcher.
struct NoDispatch;

impl NotificationDispatcher for NoDispatch {
    fn dispatch(&self, alert: Alert) {
        tracing::warn!(alert_id = %alert.id, "Alert raised during maintenance was not dispatched");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adminguard=info,maintenance=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let task = std::env::args().nth(1).unwrap_or_else(|| "all".to_string());
    if !matches!(task.as_str(), "rotate" | "baseline" | "counters" | "all") {
        anyhow::bail!("unknown task '{task}', expected rotate, baseline, counters or all");
    }

    let config = AppConfig::from_env()?;
    let security = Arc::new(SecurityConfig::load(config.security_config_path.as_deref())?);

    let pool = db::create_pool(&config.database_url, config.database_max_connections).await?;
    db::run_migrations(&pool).await?;
    let redis = db::connect_redis(&config.redis_url).await?;

    let stores = Stores {
        events: Arc::new(PgEventStore::new(pool.clone())),
        alerts: Arc::new(PgAlertStore::new(pool)),
        counters: Arc::new(RedisCounterStore::new(redis.clone())),
        baseline: Arc::new(RedisBaselineSource::new(redis)),
    };
    let baseline_store = stores.baseline.clone();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let monitoring = MonitoringService::new(security.clone(), stores, Arc::new(NoDispatch), clock.clone());

    if matches!(task.as_str(), "rotate" | "all") {
        let report = monitoring.manage_log_rotation().await;
        for failure in report.failures() {
            tracing::error!(
                severity = %failure.severity,
                cutoff = %failure.cutoff,
                error = failure.error.as_deref().unwrap_or_default(),
                "Rotation incomplete"
            );
        }
    }

    if matches!(task.as_str(), "baseline" | "all") {
        let events = monitoring.recent_events(Duration::hours(24)).await?;
        let window = Duration::seconds(security.detection.behavioral_window_secs);
        let baseline = compute_baseline(&events, window, clock.now());
        baseline_store.save(&baseline).await?;
        tracing::info!(
            sample_size = baseline.sample_size,
            avg_request_frequency = baseline.avg_request_frequency,
            "Behavioral baseline refreshed"
        );
    }

    if matches!(task.as_str(), "counters" | "all") {
        monitoring.rebuild_counters().await?;
    }

    Ok(())
}
