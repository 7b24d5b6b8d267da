use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use leadroute_core::clock::Clock;
use leadroute_core::domain::lead::{LeadId, LeadInput};
use leadroute_core::domain::outcome::AssignmentOutcome;
use leadroute_core::errors::ApplicationError;
use leadroute_db::repositories::{AssignmentOutcomeRepository, ClaimOutcome};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{application_error, bad_request, not_found, unavailable, ApiFailure};

#[derive(Clone)]
pub struct IntakeState {
    queue: mpsc::Sender<LeadInput>,
    outcomes: Arc<dyn AssignmentOutcomeRepository>,
    clock: Arc<dyn Clock>,
}

impl IntakeState {
    pub fn new(
        queue: mpsc::Sender<LeadInput>,
        outcomes: Arc<dyn AssignmentOutcomeRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { queue, outcomes, clock }
    }
}

#[derive(Debug, Deserialize)]
pub struct LeadIntakeRequest {
    #[serde(default, alias = "leadId")]
    pub lead_id: Option<String>,
    #[serde(alias = "funnelId")]
    pub funnel_id: String,
    #[serde(default)]
    pub zip: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LeadAccepted {
    pub lead_id: String,
    pub status: &'static str,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssignmentView {
    pub lead_id: String,
    pub funnel_id: String,
    pub zip: String,
    pub received_at: DateTime<Utc>,
    /// `pending` until the worker has stored an outcome.
    pub status: &'static str,
    pub outcome: Option<AssignmentOutcome>,
}

pub fn router(state: IntakeState) -> Router {
    Router::new()
        .route("/leads", post(submit_lead))
        .route("/leads/{lead_id}/assignment", get(get_assignment))
        .with_state(state)
}

async fn submit_lead(
    State(state): State<IntakeState>,
    Json(request): Json<LeadIntakeRequest>,
) -> Result<(StatusCode, Json<LeadAccepted>), ApiFailure> {
    if request.funnel_id.trim().is_empty() {
        return Err(bad_request("funnel_id is required"));
    }
    let lead_id = match request.lead_id.as_deref().map(str::trim) {
        Some("") => return Err(bad_request("lead_id must not be blank")),
        Some(id) => id.to_string(),
        None => Uuid::new_v4().to_string(),
    };

    let lead =
        LeadInput::new(lead_id, request.funnel_id, request.zip.as_deref(), state.clock.now());
    let accepted = LeadAccepted {
        lead_id: lead.lead_id.0.clone(),
        status: "queued",
        received_at: lead.received_at,
    };

    let claim = state
        .outcomes
        .claim(&lead, lead.received_at)
        .await
        .map_err(|error| application_error(ApplicationError::Persistence(error.to_string())))?;
    if claim == ClaimOutcome::AlreadyClaimed {
        return Err(bad_request(format!("lead `{}` was already submitted", accepted.lead_id)));
    }

    match state.queue.try_send(lead) {
        Ok(()) => {
            info!(
                event_name = "intake.lead_queued",
                lead_id = %accepted.lead_id,
                "lead queued for assignment"
            );
            Ok((StatusCode::ACCEPTED, Json(accepted)))
        }
        Err(TrySendError::Full(lead)) => {
            warn!(
                event_name = "intake.queue_full",
                lead_id = %lead.lead_id,
                funnel_id = %lead.funnel_id,
                "intake queue full; rejecting lead"
            );
            release_claim(&state, &lead.lead_id).await;
            Err(unavailable("assignment queue is full"))
        }
        Err(TrySendError::Closed(lead)) => {
            warn!(
                event_name = "intake.queue_closed",
                lead_id = %lead.lead_id,
                "assignment worker is not running; rejecting lead"
            );
            release_claim(&state, &lead.lead_id).await;
            Err(unavailable("assignment worker is not running"))
        }
    }
}

/// A rejected lead must not keep its pending row, or a retry would look like a duplicate.
async fn release_claim(state: &IntakeState, lead_id: &LeadId) {
    if let Err(error) = state.outcomes.release(lead_id).await {
        warn!(
            event_name = "intake.release_failed",
            lead_id = %lead_id,
            error = %error,
            "pending claim for rejected lead could not be released"
        );
    }
}

async fn get_assignment(
    State(state): State<IntakeState>,
    Path(lead_id): Path<String>,
) -> Result<Json<AssignmentView>, ApiFailure> {
    let record = state
        .outcomes
        .find(&LeadId(lead_id.clone()))
        .await
        .map_err(|error| application_error(ApplicationError::Persistence(error.to_string())))?
        .ok_or_else(|| not_found(format!("lead `{lead_id}` has no assignment")))?;

    let status = record.outcome.as_ref().map_or("pending", |outcome| outcome.status.as_str());
    Ok(Json(AssignmentView {
        lead_id: record.lead_id.0,
        funnel_id: record.funnel_id,
        zip: record.zip,
        received_at: record.received_at,
        status,
        outcome: record.outcome,
    }))
}
