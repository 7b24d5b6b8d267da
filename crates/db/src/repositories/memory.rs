use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use leadroute_core::domain::lead::{LeadId, LeadInput};
use leadroute_core::domain::outcome::AssignmentOutcome;
use leadroute_core::domain::rule::{AssignmentRule, RuleId, WILDCARD_FUNNEL};
use leadroute_core::engine::{RuleStore, RuleStoreError};

use super::{
    AssignmentOutcomeRepository, ClaimOutcome, LeadAssignmentRecord, RepositoryError,
    RuleRepository,
};

#[derive(Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<HashMap<String, AssignmentRule>>,
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn find_by_id(&self, id: &RuleId) -> Result<Option<AssignmentRule>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules.get(&id.0).cloned())
    }

    async fn list(&self, funnel_id: Option<&str>) -> Result<Vec<AssignmentRule>, RepositoryError> {
        let rules = self.rules.read().await;
        let mut listed: Vec<AssignmentRule> = rules
            .values()
            .filter(|rule| funnel_id.map_or(true, |funnel| rule.funnel_id == funnel))
            .cloned()
            .collect();
        listed.sort_by(|a, b| {
            (&a.funnel_id, a.priority, a.created_at, &a.id)
                .cmp(&(&b.funnel_id, b.priority, b.created_at, &b.id))
        });
        Ok(listed)
    }

    async fn list_active_for_funnel(
        &self,
        funnel_id: &str,
    ) -> Result<Vec<AssignmentRule>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules
            .values()
            .filter(|rule| {
                rule.is_active && (rule.funnel_id == funnel_id || rule.funnel_id == WILDCARD_FUNNEL)
            })
            .cloned()
            .collect())
    }

    async fn save(&self, rule: AssignmentRule) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        let created_at = rules.get(&rule.id.0).map(|existing| existing.created_at);
        let mut rule = rule;
        if let Some(created_at) = created_at {
            rule.created_at = created_at;
        }
        rules.insert(rule.id.0.clone(), rule);
        Ok(())
    }

    async fn insert(&self, rule: AssignmentRule) -> Result<bool, RepositoryError> {
        let mut rules = self.rules.write().await;
        if rules.contains_key(&rule.id.0) {
            return Ok(false);
        }
        rules.insert(rule.id.0.clone(), rule);
        Ok(true)
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleRepository {
    async fn active_rules(&self, funnel_id: &str) -> Result<Vec<AssignmentRule>, RuleStoreError> {
        Ok(self.list_active_for_funnel(funnel_id).await?)
    }
}

#[derive(Default)]
pub struct InMemoryAssignmentOutcomeRepository {
    records: RwLock<HashMap<String, LeadAssignmentRecord>>,
}

#[async_trait]
impl AssignmentOutcomeRepository for InMemoryAssignmentOutcomeRepository {
    async fn claim(
        &self,
        lead: &LeadInput,
        _at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, RepositoryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&lead.lead_id.0) {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        records.insert(
            lead.lead_id.0.clone(),
            LeadAssignmentRecord {
                lead_id: lead.lead_id.clone(),
                funnel_id: lead.funnel_id.clone(),
                zip: lead.zip.clone(),
                received_at: lead.received_at,
                outcome: None,
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn record(&self, outcome: &AssignmentOutcome) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        let record = records.entry(outcome.lead_id.0.clone()).or_insert_with(|| {
            LeadAssignmentRecord {
                lead_id: outcome.lead_id.clone(),
                funnel_id: outcome.funnel_id.clone(),
                zip: String::new(),
                received_at: outcome.evaluated_at,
                outcome: None,
            }
        });
        record.outcome = Some(outcome.clone());
        Ok(())
    }

    async fn release(&self, lead_id: &LeadId) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if matches!(records.get(&lead_id.0), Some(record) if record.outcome.is_none()) {
            records.remove(&lead_id.0);
        }
        Ok(())
    }

    async fn find(
        &self,
        lead_id: &LeadId,
    ) -> Result<Option<LeadAssignmentRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&lead_id.0).cloned())
    }
}
