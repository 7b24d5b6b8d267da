use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::lead::LeadId;
use crate::domain::quota::PeriodKind;
use crate::domain::rule::{AssignmentRule, OrgId, RuleId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    Unassigned,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Unassigned => "unassigned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "assigned" => Some(Self::Assigned),
            "unassigned" => Some(Self::Unassigned),
            _ => None,
        }
    }
}

/// Why a lead ended up unassigned. `Display` is the operator-facing reason string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnassignedReason {
    NoMatchingRule,
    CapacityExhausted,
    DependencyError(String),
}

impl UnassignedReason {
    pub fn parse(value: &str) -> Self {
        match value {
            "no matching rule" => Self::NoMatchingRule,
            "all matching rules at capacity" => Self::CapacityExhausted,
            other => Self::DependencyError(
                other.strip_prefix("dependency error: ").unwrap_or(other).to_string(),
            ),
        }
    }
}

impl fmt::Display for UnassignedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMatchingRule => f.write_str("no matching rule"),
            Self::CapacityExhausted => f.write_str("all matching rules at capacity"),
            Self::DependencyError(detail) => write!(f, "dependency error: {detail}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptResult {
    Reserved,
    CapExceeded { period: PeriodKind },
    Failed { error: String, retried: bool },
}

/// One candidate the engine tried, in the order it was tried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAttempt {
    pub rule_id: RuleId,
    #[serde(flatten)]
    pub result: AttemptResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentOutcome {
    pub lead_id: LeadId,
    pub funnel_id: String,
    pub status: AssignmentStatus,
    pub matched_rule_id: Option<RuleId>,
    pub assigned_org_id: Option<OrgId>,
    pub assigned_user_id: Option<UserId>,
    pub reason: Option<UnassignedReason>,
    pub attempts: Vec<CandidateAttempt>,
    pub evaluated_at: DateTime<Utc>,
}

impl AssignmentOutcome {
    pub fn assigned(
        lead_id: LeadId,
        funnel_id: impl Into<String>,
        rule: &AssignmentRule,
        attempts: Vec<CandidateAttempt>,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            lead_id,
            funnel_id: funnel_id.into(),
            status: AssignmentStatus::Assigned,
            matched_rule_id: Some(rule.id.clone()),
            assigned_org_id: Some(rule.org_id.clone()),
            assigned_user_id: rule.target_user_id.clone(),
            reason: None,
            attempts,
            evaluated_at,
        }
    }

    pub fn unassigned(
        lead_id: LeadId,
        funnel_id: impl Into<String>,
        reason: UnassignedReason,
        attempts: Vec<CandidateAttempt>,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            lead_id,
            funnel_id: funnel_id.into(),
            status: AssignmentStatus::Unassigned,
            matched_rule_id: None,
            assigned_org_id: None,
            assigned_user_id: None,
            reason: Some(reason),
            attempts,
            evaluated_at,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.status == AssignmentStatus::Assigned
    }
}

#[cfg(test)]
mod tests {
    use super::UnassignedReason;

    #[test]
    fn reason_strings_survive_storage() {
        for reason in [
            UnassignedReason::NoMatchingRule,
            UnassignedReason::CapacityExhausted,
            UnassignedReason::DependencyError("quota store timeout".to_string()),
        ] {
            assert_eq!(UnassignedReason::parse(&reason.to_string()), reason);
        }
    }

    #[test]
    fn dependency_reason_is_prefixed_for_operators() {
        let reason = UnassignedReason::DependencyError("rule r1: connection reset".to_string());
        assert_eq!(reason.to_string(), "dependency error: rule r1: connection reset");
    }
}
