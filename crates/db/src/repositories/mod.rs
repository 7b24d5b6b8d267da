use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use leadroute_core::domain::lead::{LeadId, LeadInput};
use leadroute_core::domain::outcome::AssignmentOutcome;
use leadroute_core::domain::rule::{AssignmentRule, RuleId};
use leadroute_core::engine::RuleStoreError;

pub mod memory;
pub mod outcome;
pub mod quota;
pub mod rule;

pub use memory::{InMemoryAssignmentOutcomeRepository, InMemoryRuleRepository};
pub use outcome::SqlAssignmentOutcomeRepository;
pub use quota::SqlQuotaCounterStore;
pub use rule::SqlRuleRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for RuleStoreError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => Self::Unavailable(error.to_string()),
            RepositoryError::Decode(detail) => Self::Decode(detail),
        }
    }
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn find_by_id(&self, id: &RuleId) -> Result<Option<AssignmentRule>, RepositoryError>;

    /// All rules, optionally narrowed to one funnel id (exact, `*` is not expanded).
    async fn list(&self, funnel_id: Option<&str>) -> Result<Vec<AssignmentRule>, RepositoryError>;

    /// Active rules for `funnel_id` plus active wildcard-funnel rules.
    async fn list_active_for_funnel(
        &self,
        funnel_id: &str,
    ) -> Result<Vec<AssignmentRule>, RepositoryError>;

    async fn save(&self, rule: AssignmentRule) -> Result<(), RepositoryError>;

    /// Stores a new rule. Returns `false`, leaving the stored rule untouched, when the
    /// id is already taken.
    async fn insert(&self, rule: AssignmentRule) -> Result<bool, RepositoryError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The lead id was not seen before; the caller owns its assignment.
    Claimed,
    /// Another intake already claimed or completed this lead id.
    AlreadyClaimed,
}

/// Stored state of one lead. `outcome` is `None` while the claim is pending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadAssignmentRecord {
    pub lead_id: LeadId,
    pub funnel_id: String,
    pub zip: String,
    pub received_at: DateTime<Utc>,
    pub outcome: Option<AssignmentOutcome>,
}

#[async_trait]
pub trait AssignmentOutcomeRepository: Send + Sync {
    /// Inserts a pending row for the lead unless one already exists.
    async fn claim(
        &self,
        lead: &LeadInput,
        at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, RepositoryError>;

    /// Stores the final outcome, replacing the pending claim.
    async fn record(&self, outcome: &AssignmentOutcome) -> Result<(), RepositoryError>;

    /// Drops a still-pending claim so the lead can be submitted again.
    async fn release(&self, lead_id: &LeadId) -> Result<(), RepositoryError>;

    async fn find(&self, lead_id: &LeadId)
        -> Result<Option<LeadAssignmentRecord>, RepositoryError>;
}

pub(crate) fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{column} `{raw}` is not RFC 3339: {e}")))
}
