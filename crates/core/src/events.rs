use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::domain::lead::LeadId;
use crate::domain::outcome::{AssignmentOutcome, AssignmentStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadEventType {
    #[serde(rename = "lead.assigned")]
    Assigned,
    #[serde(rename = "lead.unassigned")]
    Unassigned,
    /// Published by the lead store when an operator changes a lead's status.
    #[serde(rename = "lead.status_changed")]
    StatusChanged,
}

impl LeadEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "lead.assigned",
            Self::Unassigned => "lead.unassigned",
            Self::StatusChanged => "lead.status_changed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadEvent {
    pub event_id: String,
    pub event_type: LeadEventType,
    pub lead_id: LeadId,
    pub funnel_id: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl LeadEvent {
    pub fn new(
        event_type: LeadEventType,
        lead_id: LeadId,
        funnel_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            lead_id,
            funnel_id: funnel_id.into(),
            payload: serde_json::Value::Object(Default::default()),
            occurred_at,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// `lead.assigned` or `lead.unassigned`, carrying the outcome as payload.
    pub fn from_outcome(outcome: &AssignmentOutcome) -> Self {
        let event_type = match outcome.status {
            AssignmentStatus::Assigned => LeadEventType::Assigned,
            AssignmentStatus::Unassigned => LeadEventType::Unassigned,
        };
        let payload = serde_json::json!({
            "status": outcome.status.as_str(),
            "matched_rule_id": outcome.matched_rule_id.as_ref().map(|id| id.0.as_str()),
            "assigned_org_id": outcome.assigned_org_id.as_ref().map(|id| id.0.as_str()),
            "assigned_user_id": outcome.assigned_user_id.as_ref().map(|id| id.0.as_str()),
            "reason": outcome.reason.as_ref().map(ToString::to_string),
        });

        Self::new(event_type, outcome.lead_id.clone(), &outcome.funnel_id, outcome.evaluated_at)
            .with_payload(payload)
    }
}

/// Fire-and-forget publication. Implementations must not block the caller on
/// delivery and must swallow (and log) their own failures.
pub trait EventEmitter: Send + Sync {
    fn publish(&self, event: LeadEvent);
}

#[derive(Clone, Default)]
pub struct InMemoryEventEmitter {
    events: Arc<Mutex<Vec<LeadEvent>>>,
}

impl InMemoryEventEmitter {
    pub fn events(&self) -> Vec<LeadEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventEmitter for InMemoryEventEmitter {
    fn publish(&self, event: LeadEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Writes events to the log only. Used when no downstream transport is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventEmitter;

impl EventEmitter for TracingEventEmitter {
    fn publish(&self, event: LeadEvent) {
        info!(
            event_name = event.event_type.as_str(),
            event_id = %event.event_id,
            lead_id = %event.lead_id,
            funnel_id = %event.funnel_id,
            payload = %event.payload,
            "lead event published"
        );
    }
}
