use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::rule::RuleId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    Daily,
    Monthly,
}

impl PeriodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(Self::Daily),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }

    /// Calendar bucket of `at` in UTC: `YYYY-MM-DD` for daily, `YYYY-MM` for monthly.
    pub fn period_key(&self, at: DateTime<Utc>) -> String {
        match self {
            Self::Daily => at.format("%Y-%m-%d").to_string(),
            Self::Monthly => at.format("%Y-%m").to_string(),
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QuotaKey {
    pub rule_id: RuleId,
    pub kind: PeriodKind,
    pub period_key: String,
}

impl QuotaKey {
    pub fn for_period(rule_id: &RuleId, kind: PeriodKind, at: DateTime<Utc>) -> Self {
        Self { rule_id: rule_id.clone(), kind, period_key: kind.period_key(at) }
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.rule_id, self.kind, self.period_key)
    }
}
