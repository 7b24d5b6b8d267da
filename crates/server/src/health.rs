use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use leadroute_core::domain::lead::LeadInput;
use leadroute_db::DbPool;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    queue: mpsc::Sender<LeadInput>,
}

impl HealthState {
    pub fn new(db_pool: DbPool, queue: mpsc::Sender<LeadInput>) -> Self {
        Self { db_pool, queue }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub intake_queue: HealthCheck,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let intake_queue = queue_check(&state.queue);
    let ready = database.status == "ready" && intake_queue.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "leadroute-server runtime initialized".to_string(),
        },
        database,
        intake_queue,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn queue_check(queue: &mpsc::Sender<LeadInput>) -> HealthCheck {
    if queue.is_closed() {
        return HealthCheck {
            status: "degraded",
            detail: "assignment worker is not consuming leads".to_string(),
        };
    }
    HealthCheck {
        status: "ready",
        detail: format!("{} of {} slots free", queue.capacity(), queue.max_capacity()),
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, http::StatusCode, Json};
    use leadroute_db::connect_with_settings;
    use tokio::sync::mpsc;

    use crate::health::{health, HealthState};

    #[tokio::test]
    async fn health_returns_ready_when_database_and_worker_are_up() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5)
            .await
            .expect("pool should connect");
        let (tx, _rx) = mpsc::channel(8);

        let (status, Json(payload)) = health(State(HealthState::new(pool.clone(), tx))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.intake_queue.detail, "8 of 8 slots free");

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5)
            .await
            .expect("pool should connect");
        pool.close().await;
        let (tx, _rx) = mpsc::channel(1);

        let (status, Json(payload)) = health(State(HealthState::new(pool, tx))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }

    #[tokio::test]
    async fn health_degrades_when_worker_has_stopped() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5)
            .await
            .expect("pool should connect");
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let (status, Json(payload)) = health(State(HealthState::new(pool, tx))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.intake_queue.status, "degraded");
    }
}
