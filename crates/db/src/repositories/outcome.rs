use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;

use leadroute_core::domain::lead::{LeadId, LeadInput};
use leadroute_core::domain::outcome::{
    AssignmentOutcome, AssignmentStatus, CandidateAttempt, UnassignedReason,
};
use leadroute_core::domain::rule::{OrgId, RuleId, UserId};

use super::{
    parse_timestamp, AssignmentOutcomeRepository, ClaimOutcome, LeadAssignmentRecord,
    RepositoryError,
};
use crate::DbPool;

const PENDING: &str = "pending";

pub struct SqlAssignmentOutcomeRepository {
    pool: DbPool,
}

impl SqlAssignmentOutcomeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<LeadAssignmentRecord, RepositoryError> {
    let lead_id: String =
        row.try_get("lead_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let funnel_id: String =
        row.try_get("funnel_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let zip: String = row.try_get("zip").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status: String =
        row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let matched_rule_id: Option<String> =
        row.try_get("matched_rule_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let assigned_org_id: Option<String> =
        row.try_get("assigned_org_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let assigned_user_id: Option<String> =
        row.try_get("assigned_user_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let reason: Option<String> =
        row.try_get("reason").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let attempts_json: String =
        row.try_get("attempts_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let received_at: String =
        row.try_get("received_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let evaluated_at: Option<String> =
        row.try_get("evaluated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let received_at = parse_timestamp("received_at", &received_at)?;
    let lead_id = LeadId(lead_id);

    let outcome = if status == PENDING {
        None
    } else {
        let status = AssignmentStatus::parse(&status).ok_or_else(|| {
            RepositoryError::Decode(format!("lead {lead_id} has unknown status `{status}`"))
        })?;
        let attempts: Vec<CandidateAttempt> =
            serde_json::from_str(&attempts_json).map_err(|e| {
                RepositoryError::Decode(format!("lead {lead_id} has malformed attempts_json: {e}"))
            })?;
        let evaluated_at = match evaluated_at {
            Some(raw) => parse_timestamp("evaluated_at", &raw)?,
            None => received_at,
        };

        Some(AssignmentOutcome {
            lead_id: lead_id.clone(),
            funnel_id: funnel_id.clone(),
            status,
            matched_rule_id: matched_rule_id.map(RuleId),
            assigned_org_id: assigned_org_id.map(OrgId),
            assigned_user_id: assigned_user_id.map(UserId),
            reason: reason.as_deref().map(UnassignedReason::parse),
            attempts,
            evaluated_at,
        })
    };

    Ok(LeadAssignmentRecord { lead_id, funnel_id, zip, received_at, outcome })
}

#[async_trait]
impl AssignmentOutcomeRepository for SqlAssignmentOutcomeRepository {
    async fn claim(
        &self,
        lead: &LeadInput,
        at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO lead_assignment (lead_id, funnel_id, zip, status, received_at,
                                          created_at, updated_at)
             VALUES (?, ?, ?, 'pending', ?, ?, ?)
             ON CONFLICT(lead_id) DO NOTHING",
        )
        .bind(&lead.lead_id.0)
        .bind(&lead.funnel_id)
        .bind(&lead.zip)
        .bind(lead.received_at.to_rfc3339())
        .bind(at.to_rfc3339())
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            ClaimOutcome::Claimed
        } else {
            ClaimOutcome::AlreadyClaimed
        })
    }

    async fn record(&self, outcome: &AssignmentOutcome) -> Result<(), RepositoryError> {
        let attempts_json = serde_json::to_string(&outcome.attempts)
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;
        let evaluated_at = outcome.evaluated_at.to_rfc3339();

        sqlx::query(
            "INSERT INTO lead_assignment (lead_id, funnel_id, status, matched_rule_id,
                                          assigned_org_id, assigned_user_id, reason,
                                          attempts_json, received_at, evaluated_at,
                                          created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?9, ?9)
             ON CONFLICT(lead_id) DO UPDATE SET
                 status = excluded.status,
                 matched_rule_id = excluded.matched_rule_id,
                 assigned_org_id = excluded.assigned_org_id,
                 assigned_user_id = excluded.assigned_user_id,
                 reason = excluded.reason,
                 attempts_json = excluded.attempts_json,
                 evaluated_at = excluded.evaluated_at,
                 updated_at = excluded.updated_at",
        )
        .bind(&outcome.lead_id.0)
        .bind(&outcome.funnel_id)
        .bind(outcome.status.as_str())
        .bind(outcome.matched_rule_id.as_ref().map(|id| id.0.as_str()))
        .bind(outcome.assigned_org_id.as_ref().map(|id| id.0.as_str()))
        .bind(outcome.assigned_user_id.as_ref().map(|id| id.0.as_str()))
        .bind(outcome.reason.as_ref().map(ToString::to_string))
        .bind(&attempts_json)
        .bind(&evaluated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release(&self, lead_id: &LeadId) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("DELETE FROM lead_assignment WHERE lead_id = ? AND status = 'pending'")
                .bind(&lead_id.0)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() > 0 {
            debug!(
                event_name = "db.lead_assignment.claim_released",
                lead_id = %lead_id,
                "pending claim released"
            );
        }
        Ok(())
    }

    async fn find(
        &self,
        lead_id: &LeadId,
    ) -> Result<Option<LeadAssignmentRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT lead_id, funnel_id, zip, status, matched_rule_id, assigned_org_id,
                    assigned_user_id, reason, attempts_json, received_at, evaluated_at
             FROM lead_assignment WHERE lead_id = ?",
        )
        .bind(&lead_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_record(r)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use leadroute_core::domain::lead::{LeadId, LeadInput};
    use leadroute_core::domain::outcome::{
        AssignmentOutcome, AttemptResult, CandidateAttempt, UnassignedReason,
    };
    use leadroute_core::domain::quota::PeriodKind;
    use leadroute_core::domain::rule::{AssignmentRule, OrgId, RuleCaps, RuleId};

    use super::SqlAssignmentOutcomeRepository;
    use crate::repositories::{AssignmentOutcomeRepository, ClaimOutcome};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlAssignmentOutcomeRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlAssignmentOutcomeRepository::new(pool)
    }

    fn lead(id: &str) -> LeadInput {
        let received = Utc.with_ymd_and_hms(2026, 8, 3, 9, 15, 0).single().expect("timestamp");
        LeadInput::new(id, "roofing", Some("90210"), received)
    }

    fn rule() -> AssignmentRule {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("timestamp");
        AssignmentRule {
            id: RuleId("rule-9".to_string()),
            funnel_id: "roofing".to_string(),
            org_id: OrgId("org-9".to_string()),
            target_user_id: None,
            zip_patterns: Vec::new(),
            priority: 1,
            caps: RuleCaps::unlimited(),
            is_active: true,
            created_at: created,
            updated_at: created,
        }
    }

    #[tokio::test]
    async fn second_claim_for_same_lead_is_rejected() {
        let repo = setup().await;
        let lead = lead("lead-100");

        assert_eq!(repo.claim(&lead, Utc::now()).await.expect("claim"), ClaimOutcome::Claimed);
        assert_eq!(
            repo.claim(&lead, Utc::now()).await.expect("claim"),
            ClaimOutcome::AlreadyClaimed
        );

        let pending = repo.find(&lead.lead_id).await.expect("find").expect("record exists");
        assert_eq!(pending.outcome, None);
        assert_eq!(pending.zip, "90210");
    }

    #[tokio::test]
    async fn recorded_outcome_replaces_claim() {
        let repo = setup().await;
        let lead = lead("lead-101");
        repo.claim(&lead, Utc::now()).await.expect("claim");

        let outcome = AssignmentOutcome::assigned(
            lead.lead_id.clone(),
            &lead.funnel_id,
            &rule(),
            vec![
                CandidateAttempt {
                    rule_id: RuleId("rule-1".to_string()),
                    result: AttemptResult::CapExceeded { period: PeriodKind::Daily },
                },
                CandidateAttempt { rule_id: RuleId("rule-9".to_string()), result: AttemptResult::Reserved },
            ],
            lead.received_at + Duration::milliseconds(40),
        );
        repo.record(&outcome).await.expect("record");

        let stored = repo.find(&lead.lead_id).await.expect("find").expect("record exists");
        assert_eq!(stored.received_at, lead.received_at);
        assert_eq!(stored.outcome, Some(outcome));
    }

    #[tokio::test]
    async fn unassigned_reason_is_stored_as_operator_string() {
        let repo = setup().await;
        let lead = lead("lead-102");
        repo.claim(&lead, Utc::now()).await.expect("claim");

        let outcome = AssignmentOutcome::unassigned(
            lead.lead_id.clone(),
            &lead.funnel_id,
            UnassignedReason::CapacityExhausted,
            Vec::new(),
            lead.received_at,
        );
        repo.record(&outcome).await.expect("record");

        let stored = repo.find(&lead.lead_id).await.expect("find").and_then(|r| r.outcome);
        assert_eq!(stored.and_then(|o| o.reason), Some(UnassignedReason::CapacityExhausted));
    }

    #[tokio::test]
    async fn release_only_drops_pending_claims() {
        let repo = setup().await;
        let pending = lead("lead-103");
        let done = lead("lead-104");
        repo.claim(&pending, Utc::now()).await.expect("claim");
        repo.claim(&done, Utc::now()).await.expect("claim");
        repo.record(&AssignmentOutcome::unassigned(
            done.lead_id.clone(),
            &done.funnel_id,
            UnassignedReason::NoMatchingRule,
            Vec::new(),
            done.received_at,
        ))
        .await
        .expect("record");

        repo.release(&pending.lead_id).await.expect("release");
        repo.release(&done.lead_id).await.expect("release");

        assert!(repo.find(&pending.lead_id).await.expect("find").is_none());
        assert!(repo.find(&done.lead_id).await.expect("find").is_some());
        assert_eq!(repo.claim(&pending, Utc::now()).await.expect("claim"), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn unknown_lead_is_none() {
        let repo = setup().await;
        assert!(repo.find(&LeadId("missing".to_string())).await.expect("find").is_none());
    }
}
