use std::sync::Arc;

use leadroute_core::clock::{Clock, SystemClock};
use leadroute_core::config::{AppConfig, ConfigError, LoadOptions};
use leadroute_core::engine::{AssignmentEngine, EngineConfig};
use leadroute_core::events::{EventEmitter, TracingEventEmitter};
use leadroute_core::quota::QuotaGate;
use leadroute_db::repositories::{
    SqlAssignmentOutcomeRepository, SqlQuotaCounterStore, SqlRuleRepository,
};
use leadroute_db::{connect_with_settings, migrations, DbPool};
use thiserror::Error;
use tracing::info;

use crate::webhook::WebhookEventEmitter;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<AssignmentEngine>,
    pub rules: Arc<SqlRuleRepository>,
    pub outcomes: Arc<SqlAssignmentOutcomeRepository>,
    pub quota: QuotaGate,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("webhook client could not be built: {0}")]
    Webhook(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let emitter: Arc<dyn EventEmitter> =
        match WebhookEventEmitter::from_config(&config.events).map_err(BootstrapError::Webhook)? {
            Some(webhook) => {
                info!(
                    event_name = "system.bootstrap.events",
                    transport = "webhook",
                    "lead events will be posted to the configured webhook"
                );
                Arc::new(webhook)
            }
            None => {
                info!(
                    event_name = "system.bootstrap.events",
                    transport = "log",
                    "no webhook configured; lead events are logged only"
                );
                Arc::new(TracingEventEmitter)
            }
        };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let quota = QuotaGate::new(Arc::new(SqlQuotaCounterStore::new(db_pool.clone())));
    let engine = Arc::new(AssignmentEngine::new(
        quota.clone(),
        emitter,
        clock.clone(),
        EngineConfig::from(&config.engine),
    ));

    Ok(Application {
        rules: Arc::new(SqlRuleRepository::new(db_pool.clone())),
        outcomes: Arc::new(SqlAssignmentOutcomeRepository::new(db_pool.clone())),
        config,
        db_pool,
        engine,
        quota,
        clock,
    })
}
