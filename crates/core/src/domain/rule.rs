use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Funnel id on a rule that matches every funnel.
pub const WILDCARD_FUNNEL: &str = "*";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrgId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

/// Per-period capacity limits of a rule. `None` means unlimited for that period.
///
/// Values are kept signed so that rows written before validation existed can still be
/// loaded; the quota gate treats a non-positive cap as permanently exhausted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCaps {
    pub daily: Option<i64>,
    pub monthly: Option<i64>,
}

impl RuleCaps {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_unlimited(&self) -> bool {
        self.daily.is_none() && self.monthly.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRule {
    pub id: RuleId,
    pub funnel_id: String,
    pub org_id: OrgId,
    pub target_user_id: Option<UserId>,
    pub zip_patterns: Vec<String>,
    pub priority: i32,
    pub caps: RuleCaps,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AssignmentRule {
    pub fn applies_to_all_funnels(&self) -> bool {
        self.funnel_id == WILDCARD_FUNNEL
    }
}

/// A single entry of a rule's `zip_patterns`, as the matcher interprets it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ZipPattern {
    /// Empty string or a bare `*`.
    Any,
    /// Literal prefix, stored without the trailing `*`.
    Prefix(String),
    Exact(String),
}

impl ZipPattern {
    /// Lenient interpretation used at match time; never fails on stored data.
    pub fn from_raw(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.strip_suffix('*') {
            Some("") => Self::Any,
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None if trimmed.is_empty() => Self::Any,
            None => Self::Exact(trimmed.to_string()),
        }
    }

    /// Strict interpretation used when a rule is created or edited.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let pattern = Self::from_raw(raw);
        let valid = match &pattern {
            Self::Any => true,
            Self::Prefix(prefix) => {
                prefix.len() <= 4 && prefix.chars().all(|ch| ch.is_ascii_digit())
            }
            Self::Exact(zip) => zip.len() == 5 && zip.chars().all(|ch| ch.is_ascii_digit()),
        };

        if valid {
            Ok(pattern)
        } else {
            Err(DomainError::InvalidRule(format!(
                "zip pattern `{raw}` must be a 5-digit ZIP, up to 4 digits followed by `*`, or empty"
            )))
        }
    }

    pub fn matches(&self, zip: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => zip.starts_with(prefix.as_str()),
            Self::Exact(exact) => zip == exact,
        }
    }
}

/// Admin-supplied rule definition, validated before it reaches storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub funnel_id: String,
    pub org_id: String,
    #[serde(default)]
    pub target_user_id: Option<String>,
    #[serde(default)]
    pub zip_patterns: Vec<String>,
    pub priority: i32,
    #[serde(default)]
    pub daily_cap: Option<i64>,
    #[serde(default)]
    pub monthly_cap: Option<i64>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl RuleDraft {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.funnel_id.trim().is_empty() {
            return Err(DomainError::InvalidRule("funnel_id is required".to_string()));
        }
        if self.org_id.trim().is_empty() {
            return Err(DomainError::InvalidRule("org_id is required".to_string()));
        }
        if matches!(&self.target_user_id, Some(user) if user.trim().is_empty()) {
            return Err(DomainError::InvalidRule(
                "target_user_id must be omitted or non-empty".to_string(),
            ));
        }
        for (name, cap) in [("daily_cap", self.daily_cap), ("monthly_cap", self.monthly_cap)] {
            if matches!(cap, Some(value) if value <= 0) {
                return Err(DomainError::InvalidRule(format!(
                    "{name} must be a positive integer when set"
                )));
            }
        }
        for pattern in &self.zip_patterns {
            ZipPattern::parse(pattern)?;
        }
        Ok(())
    }

    /// Builds a new rule with the given id. Timestamps are both set to `now`.
    pub fn into_rule(self, id: RuleId, now: DateTime<Utc>) -> Result<AssignmentRule, DomainError> {
        self.validate()?;
        Ok(AssignmentRule {
            id,
            funnel_id: self.funnel_id.trim().to_string(),
            org_id: OrgId(self.org_id.trim().to_string()),
            target_user_id: self.target_user_id.map(|user| UserId(user.trim().to_string())),
            zip_patterns: self.zip_patterns.iter().map(|p| p.trim().to_string()).collect(),
            priority: self.priority,
            caps: RuleCaps { daily: self.daily_cap, monthly: self.monthly_cap },
            is_active: self.is_active,
            created_at: now,
            updated_at: now,
        })
    }

    /// Applies this draft over an existing rule, keeping its id and creation time.
    pub fn apply_to(
        self,
        existing: &AssignmentRule,
        now: DateTime<Utc>,
    ) -> Result<AssignmentRule, DomainError> {
        let mut updated = self.into_rule(existing.id.clone(), now)?;
        updated.created_at = existing.created_at;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{RuleDraft, RuleId, ZipPattern};
    use crate::errors::DomainError;

    fn draft() -> RuleDraft {
        RuleDraft {
            funnel_id: "roofing".to_string(),
            org_id: "org-a".to_string(),
            target_user_id: None,
            zip_patterns: vec!["90210".to_string(), "91*".to_string()],
            priority: 5,
            daily_cap: Some(10),
            monthly_cap: None,
            is_active: true,
        }
    }

    #[test]
    fn raw_patterns_are_classified() {
        assert_eq!(ZipPattern::from_raw(""), ZipPattern::Any);
        assert_eq!(ZipPattern::from_raw("*"), ZipPattern::Any);
        assert_eq!(ZipPattern::from_raw(" 90* "), ZipPattern::Prefix("90".to_string()));
        assert_eq!(ZipPattern::from_raw("90210"), ZipPattern::Exact("90210".to_string()));
    }

    #[test]
    fn prefix_pattern_does_not_match_empty_zip() {
        assert!(!ZipPattern::from_raw("90*").matches(""));
        assert!(ZipPattern::from_raw("*").matches(""));
        assert!(ZipPattern::from_raw("90*").matches("90001"));
    }

    #[test]
    fn strict_parse_rejects_malformed_patterns() {
        assert!(ZipPattern::parse("9021").is_err());
        assert!(ZipPattern::parse("90a*").is_err());
        assert!(ZipPattern::parse("90210*").is_err());
        assert!(ZipPattern::parse("9*").is_ok());
    }

    #[test]
    fn draft_rejects_non_positive_caps() {
        let mut invalid = draft();
        invalid.monthly_cap = Some(0);

        let error = invalid.validate().expect_err("zero cap must be rejected");
        assert!(matches!(error, DomainError::InvalidRule(ref message) if message.contains("monthly_cap")));
    }

    #[test]
    fn apply_to_keeps_identity_and_creation_time() {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("timestamp");
        let later = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().expect("timestamp");
        let rule = draft().into_rule(RuleId("r1".to_string()), created).expect("valid draft");

        let mut edit = draft();
        edit.priority = 1;
        let updated = edit.apply_to(&rule, later).expect("valid edit");

        assert_eq!(updated.id, rule.id);
        assert_eq!(updated.created_at, created);
        assert_eq!(updated.updated_at, later);
        assert_eq!(updated.priority, 1);
    }
}
