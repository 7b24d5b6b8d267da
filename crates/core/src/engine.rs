//! Lead assignment orchestration.
//!
//! [`AssignmentEngine::assign`] walks the matcher's candidate list strictly in order
//! and reserves capacity on the first rule that still has room. Each candidate is
//! tried at most once per call (plus one retry when the counter store fails), so a
//! single call never holds more than one reservation. Every call ends in exactly one
//! [`AssignmentOutcome`]; business non-matches are encoded in the outcome, never
//! returned as errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::domain::lead::LeadInput;
use crate::domain::outcome::{
    AssignmentOutcome, AttemptResult, CandidateAttempt, UnassignedReason,
};
use crate::domain::rule::AssignmentRule;
use crate::events::{EventEmitter, LeadEvent};
use crate::matching::find_candidates;
use crate::quota::{QuotaGate, QuotaStoreError, Reservation};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RuleStoreError {
    #[error("rule store unavailable: {0}")]
    Unavailable(String),
    #[error("stored rule could not be decoded: {0}")]
    Decode(String),
}

/// Read side of the rule store as the engine sees it.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Active rules whose funnel is `funnel_id` or `*`. Order is not significant.
    async fn active_rules(&self, funnel_id: &str) -> Result<Vec<AssignmentRule>, RuleStoreError>;
}

/// Hard failures that prevent the engine from evaluating a lead at all.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("could not load rules for funnel `{funnel_id}`: {source}")]
    RuleStore {
        funnel_id: String,
        #[source]
        source: RuleStoreError,
    },
}

/// Time budgets for one assignment, passed in explicitly per engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Pause before the single retry of a failed store call.
    pub retry_backoff: Duration,
    /// Wall-clock allowance per candidate; the call's deadline grows with the list.
    pub attempt_budget: Duration,
    /// Upper bound on the whole call regardless of candidate count.
    pub overall_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_millis(50),
            attempt_budget: Duration::from_millis(250),
            overall_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            attempt_budget: Duration::from_millis(settings.attempt_budget_ms),
            overall_timeout: Duration::from_millis(settings.overall_timeout_ms),
        }
    }
}

impl EngineConfig {
    fn budget_for(&self, candidates: usize) -> Duration {
        let per_candidate = u32::try_from(candidates).unwrap_or(u32::MAX);
        self.attempt_budget.saturating_mul(per_candidate).min(self.overall_timeout)
    }
}

pub struct AssignmentEngine {
    quota: QuotaGate,
    emitter: Arc<dyn EventEmitter>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl AssignmentEngine {
    pub fn new(
        quota: QuotaGate,
        emitter: Arc<dyn EventEmitter>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self { quota, emitter, clock, config }
    }

    pub fn quota(&self) -> &QuotaGate {
        &self.quota
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Closes out a lead that will not be evaluated, e.g. because its rules could not
    /// be loaded or the worker is shutting down. The outcome is logged and published
    /// like any evaluated one; no quota is touched.
    pub fn abandon(&self, lead: &LeadInput, detail: impl Into<String>) -> AssignmentOutcome {
        self.finish(AssignmentOutcome::unassigned(
            lead.lead_id.clone(),
            &lead.funnel_id,
            UnassignedReason::DependencyError(detail.into()),
            Vec::new(),
            self.clock.now(),
        ))
    }

    /// Assigns `lead` against an already loaded rule snapshot.
    ///
    /// Not idempotent: every assigned outcome consumes one unit of quota, so callers
    /// must make sure a lead id is only submitted once.
    pub async fn assign(&self, lead: &LeadInput, active_rules: &[AssignmentRule]) -> AssignmentOutcome {
        self.assign_until_cancelled(lead, active_rules, &CancellationToken::new()).await
    }

    /// Like [`assign`](Self::assign), but stops trying further candidates once `cancel`
    /// fires. A reservation already in flight is allowed to finish.
    pub async fn assign_until_cancelled(
        &self,
        lead: &LeadInput,
        active_rules: &[AssignmentRule],
        cancel: &CancellationToken,
    ) -> AssignmentOutcome {
        let candidates = find_candidates(&lead.funnel_id, &lead.zip, active_rules);
        if candidates.is_empty() {
            return self.finish(AssignmentOutcome::unassigned(
                lead.lead_id.clone(),
                &lead.funnel_id,
                UnassignedReason::NoMatchingRule,
                Vec::new(),
                self.clock.now(),
            ));
        }

        let deadline = Instant::now() + self.config.budget_for(candidates.len());
        let mut attempts = Vec::with_capacity(candidates.len());
        let mut dependency_failure: Option<String> = None;

        for rule in candidates {
            if cancel.is_cancelled() {
                dependency_failure = Some(format!("assignment cancelled before rule {}", rule.id));
                break;
            }
            if Instant::now() >= deadline {
                dependency_failure = Some(format!("deadline exceeded before rule {}", rule.id));
                break;
            }

            debug!(
                event_name = "assignment.candidate_attempt",
                lead_id = %lead.lead_id,
                rule_id = %rule.id,
                priority = rule.priority,
                "attempting reservation"
            );

            match self.reserve_with_retry(rule, lead, deadline).await {
                Ok(Reservation::Reserved) => {
                    attempts.push(CandidateAttempt {
                        rule_id: rule.id.clone(),
                        result: AttemptResult::Reserved,
                    });
                    return self.finish(AssignmentOutcome::assigned(
                        lead.lead_id.clone(),
                        &lead.funnel_id,
                        rule,
                        attempts,
                        self.clock.now(),
                    ));
                }
                Ok(Reservation::CapExceeded { period }) => {
                    attempts.push(CandidateAttempt {
                        rule_id: rule.id.clone(),
                        result: AttemptResult::CapExceeded { period },
                    });
                }
                Err((error, retried)) => {
                    warn!(
                        event_name = "assignment.candidate_skipped",
                        lead_id = %lead.lead_id,
                        rule_id = %rule.id,
                        retried,
                        error = %error,
                        "quota store failed; moving to next candidate"
                    );
                    dependency_failure = Some(format!("rule {}: {error}", rule.id));
                    attempts.push(CandidateAttempt {
                        rule_id: rule.id.clone(),
                        result: AttemptResult::Failed { error: error.to_string(), retried },
                    });
                }
            }
        }

        let reason = match dependency_failure {
            Some(detail) => UnassignedReason::DependencyError(detail),
            None => UnassignedReason::CapacityExhausted,
        };
        self.finish(AssignmentOutcome::unassigned(
            lead.lead_id.clone(),
            &lead.funnel_id,
            reason,
            attempts,
            self.clock.now(),
        ))
    }

    /// Loads the funnel's active rules and assigns the lead.
    ///
    /// The rule fetch is retried once; if it still fails the error is returned so
    /// the caller can requeue the whole lead.
    pub async fn assign_from_store(
        &self,
        store: &dyn RuleStore,
        lead: &LeadInput,
        cancel: &CancellationToken,
    ) -> Result<AssignmentOutcome, AssignmentError> {
        let rules = match store.active_rules(&lead.funnel_id).await {
            Ok(rules) => rules,
            Err(error) => {
                warn!(
                    event_name = "assignment.rule_fetch_retry",
                    lead_id = %lead.lead_id,
                    funnel_id = %lead.funnel_id,
                    error = %error,
                    "rule fetch failed; retrying once"
                );
                tokio::time::sleep(self.config.retry_backoff).await;
                store.active_rules(&lead.funnel_id).await.map_err(|source| {
                    AssignmentError::RuleStore { funnel_id: lead.funnel_id.clone(), source }
                })?
            }
        };

        Ok(self.assign_until_cancelled(lead, &rules, cancel).await)
    }

    async fn reserve_with_retry(
        &self,
        rule: &AssignmentRule,
        lead: &LeadInput,
        deadline: Instant,
    ) -> Result<Reservation, (QuotaStoreError, bool)> {
        let first = self.quota.try_reserve(&rule.id, rule.caps, lead.received_at).await;
        let error = match first {
            Ok(reservation) => return Ok(reservation),
            Err(error) => error,
        };

        if Instant::now() + self.config.retry_backoff >= deadline {
            return Err((error, false));
        }

        tokio::time::sleep(self.config.retry_backoff).await;
        self.quota
            .try_reserve(&rule.id, rule.caps, lead.received_at)
            .await
            .map_err(|error| (error, true))
    }

    fn finish(&self, outcome: AssignmentOutcome) -> AssignmentOutcome {
        info!(
            event_name = "assignment.completed",
            lead_id = %outcome.lead_id,
            funnel_id = %outcome.funnel_id,
            status = outcome.status.as_str(),
            rule_id = outcome.matched_rule_id.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
            reason = %outcome.reason.as_ref().map(ToString::to_string).unwrap_or_default(),
            attempts = outcome.attempts.len(),
            "lead assignment evaluated"
        );
        self.emitter.publish(LeadEvent::from_outcome(&outcome));
        outcome
    }
}
