use std::sync::Arc;

use leadroute_core::domain::lead::LeadInput;
use leadroute_core::domain::outcome::AssignmentOutcome;
use leadroute_core::engine::{AssignmentEngine, RuleStore};
use leadroute_db::repositories::{AssignmentOutcomeRepository, ClaimOutcome, RepositoryError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SHUTDOWN_DETAIL: &str = "shutdown before evaluation";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("lead claim storage failed: {0}")]
    Claim(#[source] RepositoryError),
    #[error("could not persist assignment outcome: {0}")]
    Record(#[source] RepositoryError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Processed {
    Completed(AssignmentOutcome),
    Duplicate,
}

/// Drains queued leads into the assignment engine and persists each outcome.
#[derive(Clone)]
pub struct AssignmentWorker {
    engine: Arc<AssignmentEngine>,
    rules: Arc<dyn RuleStore>,
    outcomes: Arc<dyn AssignmentOutcomeRepository>,
}

impl AssignmentWorker {
    pub fn new(
        engine: Arc<AssignmentEngine>,
        rules: Arc<dyn RuleStore>,
        outcomes: Arc<dyn AssignmentOutcomeRepository>,
    ) -> Self {
        Self { engine, rules, outcomes }
    }

    /// Runs until `cancel` fires or every sender is dropped.
    ///
    /// Leads still queued at cancellation are recorded as unassigned rather than
    /// dropped, so every accepted lead ends with a stored outcome.
    pub async fn run(&self, mut receiver: mpsc::Receiver<LeadInput>, cancel: CancellationToken) {
        info!(event_name = "worker.started", "assignment worker started");

        loop {
            let lead = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.shed_queue(&mut receiver).await;
                    break;
                }
                next = receiver.recv() => match next {
                    Some(lead) => lead,
                    None => break,
                },
            };

            if let Err(error) = self.process(&lead, &cancel).await {
                error!(
                    event_name = "worker.lead_failed",
                    lead_id = %lead.lead_id,
                    funnel_id = %lead.funnel_id,
                    error = %error,
                    "lead could not be assigned"
                );
            }
        }

        info!(event_name = "worker.stopped", "assignment worker stopped");
    }

    /// Takes ownership of the lead id, assigns it and stores the outcome.
    ///
    /// A pending claim left by intake belongs to this lead and is taken over. A rule
    /// store that stays down ends the lead as unassigned with a dependency error.
    pub async fn process(
        &self,
        lead: &LeadInput,
        cancel: &CancellationToken,
    ) -> Result<Processed, WorkerError> {
        if !self.take_claim(lead).await? {
            return Ok(Processed::Duplicate);
        }

        let outcome = match self.engine.assign_from_store(self.rules.as_ref(), lead, cancel).await
        {
            Ok(outcome) => outcome,
            Err(assignment_error) => {
                warn!(
                    event_name = "worker.rules_unavailable",
                    lead_id = %lead.lead_id,
                    funnel_id = %lead.funnel_id,
                    error = %assignment_error,
                    "rules could not be loaded; lead left unassigned"
                );
                self.engine.abandon(lead, assignment_error.to_string())
            }
        };

        self.store_outcome(&outcome).await?;
        Ok(Processed::Completed(outcome))
    }

    async fn shed_queue(&self, receiver: &mut mpsc::Receiver<LeadInput>) {
        receiver.close();
        let mut shed = 0usize;
        while let Some(lead) = receiver.recv().await {
            let result = match self.take_claim(&lead).await {
                Ok(true) => {
                    let outcome = self.engine.abandon(&lead, SHUTDOWN_DETAIL);
                    self.store_outcome(&outcome).await
                }
                Ok(false) => Ok(()),
                Err(error) => Err(error),
            };
            match result {
                Ok(()) => shed += 1,
                Err(error) => error!(
                    event_name = "worker.shed_failed",
                    lead_id = %lead.lead_id,
                    error = %error,
                    "queued lead could not be closed out at shutdown"
                ),
            }
        }
        if shed > 0 {
            warn!(
                event_name = "worker.queue_shed",
                leads = shed,
                "queued leads recorded as unassigned at shutdown"
            );
        }
    }

    /// True when this worker owns the lead: a fresh claim, or a pending one from intake.
    async fn take_claim(&self, lead: &LeadInput) -> Result<bool, WorkerError> {
        let claimed_at = self.engine.clock().now();
        match self.outcomes.claim(lead, claimed_at).await.map_err(WorkerError::Claim)? {
            ClaimOutcome::Claimed => Ok(true),
            ClaimOutcome::AlreadyClaimed => {
                let pending = self
                    .outcomes
                    .find(&lead.lead_id)
                    .await
                    .map_err(WorkerError::Claim)?
                    .is_some_and(|record| record.outcome.is_none());
                if !pending {
                    warn!(
                        event_name = "worker.duplicate_lead",
                        lead_id = %lead.lead_id,
                        funnel_id = %lead.funnel_id,
                        "lead id already has an outcome; skipping"
                    );
                }
                Ok(pending)
            }
        }
    }

    /// Stores the outcome, retrying once after the engine's backoff. A second failure
    /// is logged with the full outcome so quota already spent can be reconciled.
    async fn store_outcome(&self, outcome: &AssignmentOutcome) -> Result<(), WorkerError> {
        let first_error = match self.outcomes.record(outcome).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        warn!(
            event_name = "worker.record_retry",
            lead_id = %outcome.lead_id,
            error = %first_error,
            "outcome write failed; retrying once"
        );
        tokio::time::sleep(self.engine.config().retry_backoff).await;

        if let Err(error) = self.outcomes.record(outcome).await {
            let snapshot =
                serde_json::to_string(outcome).unwrap_or_else(|_| format!("{outcome:?}"));
            error!(
                event_name = "worker.outcome_lost",
                lead_id = %outcome.lead_id,
                funnel_id = %outcome.funnel_id,
                status = outcome.status.as_str(),
                outcome = %snapshot,
                error = %error,
                "assignment outcome could not be stored; reconcile manually"
            );
            return Err(WorkerError::Record(error));
        }
        Ok(())
    }
}
