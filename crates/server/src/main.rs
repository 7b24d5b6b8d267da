mod admin;
mod bootstrap;
mod error;
mod health;
mod intake;
mod webhook;
mod worker;

use std::time::Duration;

use anyhow::Result;
use axum::Router;
use leadroute_core::config::{AppConfig, LoadOptions};
use leadroute_core::domain::lead::LeadInput;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admin::AdminState;
use crate::bootstrap::Application;
use crate::health::HealthState;
use crate::intake::IntakeState;
use crate::worker::AssignmentWorker;

fn init_logging(config: &AppConfig) {
    use leadroute_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging has to be up before bootstrap emits its first event.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let (queue, receiver) = mpsc::channel(app.config.server.intake_queue_capacity);
    let cancel = CancellationToken::new();

    let worker = AssignmentWorker::new(app.engine.clone(), app.rules.clone(), app.outcomes.clone());
    let worker_cancel = cancel.clone();
    let worker_task = tokio::spawn(async move { worker.run(receiver, worker_cancel).await });

    let router = http_router(&app, queue);
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        bind_address = %address,
        "leadroute-server listening"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(event_name = "system.server.stopping", "leadroute-server stopping");
    cancel.cancel();
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, worker_task).await.is_err() {
        tracing::warn!(
            event_name = "system.server.worker_timeout",
            grace_secs = grace.as_secs(),
            "assignment worker did not stop within the grace period"
        );
    }
    app.db_pool.close().await;

    Ok(())
}

fn http_router(app: &Application, queue: mpsc::Sender<LeadInput>) -> Router {
    Router::new()
        .merge(health::router(HealthState::new(app.db_pool.clone(), queue.clone())))
        .merge(admin::router(AdminState::new(
            app.rules.clone(),
            app.quota.clone(),
            app.clock.clone(),
        )))
        .merge(intake::router(IntakeState::new(queue, app.outcomes.clone(), app.clock.clone())))
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            error = %error,
            "could not listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
