//! Rule administration and the test-match debugging endpoint.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use leadroute_core::clock::Clock;
use leadroute_core::domain::rule::{AssignmentRule, RuleDraft, RuleId, WILDCARD_FUNNEL};
use leadroute_core::errors::ApplicationError;
use leadroute_core::matching::{explain, MatchReport};
use leadroute_core::quota::{QuotaGate, QuotaUsage};
use leadroute_db::repositories::{RepositoryError, RuleRepository};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{application_error, bad_request, not_found, ApiFailure};

#[derive(Clone)]
pub struct AdminState {
    rules: Arc<dyn RuleRepository>,
    quota: QuotaGate,
    clock: Arc<dyn Clock>,
}

impl AdminState {
    pub fn new(rules: Arc<dyn RuleRepository>, quota: QuotaGate, clock: Arc<dyn Clock>) -> Self {
        Self { rules, quota, clock }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRulesQuery {
    #[serde(default, alias = "funnelId")]
    pub funnel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub draft: RuleDraft,
}

#[derive(Debug, Deserialize)]
pub struct TestMatchRequest {
    #[serde(alias = "funnelId")]
    pub funnel_id: String,
    #[serde(default)]
    pub zip: Option<String>,
    /// Evaluate these rules instead of the stored ones.
    #[serde(default)]
    pub rules: Option<Vec<AssignmentRule>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/rules", get(list_rules).post(create_rule))
        .route("/admin/rules/test", post(test_match))
        .route("/admin/rules/{rule_id}", get(get_rule).put(update_rule))
        .route("/admin/rules/{rule_id}/usage", get(rule_usage))
        .with_state(state)
}

async fn list_rules(
    State(state): State<AdminState>,
    Query(query): Query<ListRulesQuery>,
) -> Result<Json<Vec<AssignmentRule>>, ApiFailure> {
    let funnel = query.funnel_id.as_deref().map(str::trim).filter(|funnel| !funnel.is_empty());
    let rules = state.rules.list(funnel).await.map_err(repository_error)?;
    Ok(Json(rules))
}

async fn create_rule(
    State(state): State<AdminState>,
    Json(request): Json<CreateRuleRequest>,
) -> Result<(StatusCode, Json<AssignmentRule>), ApiFailure> {
    let id = match request.id.as_deref().map(str::trim) {
        Some("") => return Err(bad_request("id must not be blank")),
        Some(id) => RuleId(id.to_string()),
        None => RuleId(Uuid::new_v4().to_string()),
    };

    let rule = request
        .draft
        .into_rule(id, state.clock.now())
        .map_err(|error| application_error(error.into()))?;
    if !state.rules.insert(rule.clone()).await.map_err(repository_error)? {
        return Err(bad_request(format!("rule `{}` already exists", rule.id)));
    }

    info!(
        event_name = "admin.rule_created",
        rule_id = %rule.id,
        funnel_id = %rule.funnel_id,
        org_id = %rule.org_id.0,
        priority = rule.priority,
        "assignment rule created"
    );
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn get_rule(
    State(state): State<AdminState>,
    Path(rule_id): Path<String>,
) -> Result<Json<AssignmentRule>, ApiFailure> {
    let rule = load_rule(&state, &rule_id).await?;
    Ok(Json(rule))
}

async fn update_rule(
    State(state): State<AdminState>,
    Path(rule_id): Path<String>,
    Json(draft): Json<RuleDraft>,
) -> Result<Json<AssignmentRule>, ApiFailure> {
    let existing = load_rule(&state, &rule_id).await?;
    let updated = draft
        .apply_to(&existing, state.clock.now())
        .map_err(|error| application_error(error.into()))?;
    state.rules.save(updated.clone()).await.map_err(repository_error)?;

    info!(
        event_name = "admin.rule_updated",
        rule_id = %updated.id,
        funnel_id = %updated.funnel_id,
        is_active = updated.is_active,
        "assignment rule updated"
    );
    Ok(Json(updated))
}

async fn rule_usage(
    State(state): State<AdminState>,
    Path(rule_id): Path<String>,
) -> Result<Json<QuotaUsage>, ApiFailure> {
    let rule = load_rule(&state, &rule_id).await?;
    let usage = state
        .quota
        .usage(&rule.id, rule.caps, state.clock.now())
        .await
        .map_err(|error| application_error(error.into()))?;
    Ok(Json(usage))
}

async fn test_match(
    State(state): State<AdminState>,
    Json(request): Json<TestMatchRequest>,
) -> Result<Json<MatchReport>, ApiFailure> {
    let funnel_id = request.funnel_id.trim();
    if funnel_id.is_empty() {
        return Err(bad_request("funnel_id is required"));
    }
    let zip = request.zip.as_deref().map(str::trim).unwrap_or_default();

    let rules = match request.rules {
        Some(rules) => rules,
        None => stored_rules_for(&state, funnel_id).await?,
    };

    Ok(Json(explain(funnel_id, zip, &rules)))
}

/// Every stored rule, active or not, that could apply to `funnel_id`.
async fn stored_rules_for(
    state: &AdminState,
    funnel_id: &str,
) -> Result<Vec<AssignmentRule>, ApiFailure> {
    let mut rules = state.rules.list(Some(funnel_id)).await.map_err(repository_error)?;
    if funnel_id != WILDCARD_FUNNEL {
        rules.extend(state.rules.list(Some(WILDCARD_FUNNEL)).await.map_err(repository_error)?);
    }
    Ok(rules)
}

async fn load_rule(state: &AdminState, rule_id: &str) -> Result<AssignmentRule, ApiFailure> {
    state
        .rules
        .find_by_id(&RuleId(rule_id.to_string()))
        .await
        .map_err(repository_error)?
        .ok_or_else(|| not_found(format!("rule `{rule_id}` not found")))
}

fn repository_error(error: RepositoryError) -> ApiFailure {
    application_error(ApplicationError::Persistence(error.to_string()))
}
