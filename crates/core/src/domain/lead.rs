use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadId(pub String);

impl fmt::Display for LeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the assignment engine needs to know about an inbound lead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadInput {
    pub lead_id: LeadId,
    pub funnel_id: String,
    /// Empty when the lead carried no ZIP code.
    pub zip: String,
    pub received_at: DateTime<Utc>,
}

impl LeadInput {
    pub fn new(
        lead_id: impl Into<String>,
        funnel_id: impl Into<String>,
        zip: Option<&str>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            lead_id: LeadId(lead_id.into()),
            funnel_id: funnel_id.into().trim().to_string(),
            zip: zip.map(str::trim).unwrap_or_default().to_string(),
            received_at,
        }
    }

    pub fn has_zip(&self) -> bool {
        !self.zip.is_empty()
    }
}
