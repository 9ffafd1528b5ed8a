//! Pipeline orchestrator.
//!
//! Sequences the fixed conversion stages for each lead. Each stage runs
//! under a per-lead lock; its outcome decides whether the next stage is
//! enqueued at its offset, the run is retried with backoff, or the lead is
//! flagged and the pipeline moves on regardless.

pub mod queue;
pub mod retry;
mod scheduler;
pub mod stages;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use leadflow_core::config::PipelineConfig;
use leadflow_core::types::{Lead, NewLead, PipelineStage, StageRun, Timestamp};

use crate::collaborator::Collaborators;
use crate::conversation::ConversationStageMachine;
use crate::error::PipelineError;
use crate::gate::ApprovalGate;
use crate::store::Store;

pub use queue::StageQueue;
pub use retry::RetryPolicy;
pub use stages::personalize;

use queue::now_ms;
use stages::{StageResult, StageWork};

/// What happened when a stage ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded {
        next: Option<PipelineStage>,
    },
    /// The stage raised an approval; nothing more is enqueued until it is
    /// resolved.
    AwaitingApproval {
        approval_id: Uuid,
    },
    Retrying {
        attempt: u32,
        retry_in_ms: u64,
    },
    /// Abandoned and flagged on the lead. The next stage is still enqueued.
    Failed {
        error: String,
        next: Option<PipelineStage>,
    },
    /// The lead is closed; remaining stages are not run.
    Skipped,
}

/// Validate, persist and start the pipeline for a new lead.
pub(crate) fn ingest_lead(
    store: &Store,
    queue: &StageQueue,
    input: NewLead,
) -> Result<Lead, PipelineError> {
    let input = input.normalized().map_err(PipelineError::from_lead_error)?;
    let lead = Lead::from_new(input, Timestamp::now());
    store.leads.insert(&lead)?;
    queue
        .enqueue(lead.id, PipelineStage::Enrichment, Duration::ZERO)
        .map_err(PipelineError::from_lead_error)?;
    info!(lead_id = %lead.id, company = %lead.company, "Lead ingested");
    Ok(lead)
}

pub struct PipelineOrchestrator {
    store: Store,
    queue: Arc<StageQueue>,
    work: StageWork,
    retry: RetryPolicy,
    poll_interval: Duration,
    max_concurrent: usize,
    lead_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl PipelineOrchestrator {
    pub(crate) fn new(
        store: Store,
        queue: Arc<StageQueue>,
        collaborators: Collaborators,
        conversation: Arc<ConversationStageMachine>,
        gate: Arc<ApprovalGate>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            work: StageWork {
                store: store.clone(),
                collaborators,
                conversation,
                gate,
                timeout: config.stage_timeout(),
            },
            store,
            queue,
            retry: RetryPolicy::from_config(config),
            poll_interval: config.poll_interval(),
            max_concurrent: config.max_concurrent_stages.max(1),
            lead_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ingest(&self, input: NewLead) -> Result<Lead, PipelineError> {
        ingest_lead(&self.store, &self.queue, input)
    }

    /// Schedule `stage` for a lead no earlier than `delay` from now.
    pub fn enqueue(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
        delay: Duration,
    ) -> Result<(), PipelineError> {
        self.queue
            .enqueue(lead_id, stage, delay)
            .map_err(PipelineError::from_lead_error)?;
        Ok(())
    }

    /// Run one stage for one lead now.
    ///
    /// Storage failures and unknown leads are returned as errors; every
    /// other failure is absorbed into the outcome.
    pub async fn execute_stage(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
    ) -> Result<StageOutcome, PipelineError> {
        self.store
            .leads
            .require(lead_id)
            .map_err(PipelineError::from_lead_error)?;
        let attempt = match self.store.runs.get(lead_id, stage)? {
            Some(run) => run.attempts.max(1),
            None => {
                // Park a row far in the future so the outcome has somewhere
                // to land without the scheduler claiming it.
                self.store.runs.schedule(lead_id, stage, i64::MAX)?;
                1
            }
        };
        self.execute_with_lock(lead_id, stage, attempt).await
    }

    /// Failed stage runs for operator attention.
    pub fn failures(&self, lead_id: Uuid) -> Result<Vec<StageRun>, PipelineError> {
        self.store
            .leads
            .require(lead_id)
            .map_err(PipelineError::from_lead_error)?;
        Ok(self.store.runs.failures_for(lead_id)?)
    }

    /// Run the scheduler loop until `shutdown` is notified.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) {
        scheduler::run(self, shutdown).await
    }

    /// Execute everything that is due now, including work that becomes due
    /// as a result, and return the number of stage runs executed.
    pub async fn run_until_idle(self: &Arc<Self>) -> Result<usize, PipelineError> {
        let mut executed = 0;
        loop {
            let claimed = self.store.runs.claim_due(now_ms(), self.max_concurrent)?;
            if claimed.is_empty() {
                return Ok(executed);
            }
            executed += claimed.len();
            let mut tasks = JoinSet::new();
            for run in claimed {
                let pipeline = Arc::clone(self);
                tasks.spawn(async move { pipeline.execute_claimed(run).await });
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Stage task panicked");
                }
            }
        }
    }

    pub(crate) fn queue(&self) -> &Arc<StageQueue> {
        &self.queue
    }

    /// Execute a run claimed from the queue. Errors never escape: the run
    /// is put back with backoff, or failed once its budget is spent.
    pub(crate) async fn execute_claimed(&self, run: StageRun) {
        let attempt = run.attempts.max(1);
        match self.execute_with_lock(run.lead_id, run.stage, attempt).await {
            Ok(outcome) => {
                debug!(lead_id = %run.lead_id, stage = %run.stage, ?outcome, "Stage run finished")
            }
            Err(err) => {
                error!(lead_id = %run.lead_id, stage = %run.stage, attempt, error = %err, "Stage run errored");
                let message = err.to_string();
                let result = if self.retry.should_retry(attempt) {
                    let due = now_ms().saturating_add(self.retry.backoff(attempt).as_millis() as i64);
                    self.store.runs.retry_at(run.lead_id, run.stage, due, &message)
                } else {
                    self.store.runs.mark_failed(run.lead_id, run.stage, &message)
                };
                if let Err(e) = result {
                    error!(lead_id = %run.lead_id, stage = %run.stage, error = %e, "Failed to record stage run error");
                }
            }
        }
    }

    async fn execute_with_lock(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
        attempt: u32,
    ) -> Result<StageOutcome, PipelineError> {
        let lock = self.lead_lock(lead_id);
        let outcome = {
            let _guard = lock.lock().await;
            self.execute_locked(lead_id, stage, attempt).await
        };
        self.release_lead_lock(lead_id, lock);
        outcome
    }

    async fn execute_locked(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
        attempt: u32,
    ) -> Result<StageOutcome, PipelineError> {
        let lead = self
            .store
            .leads
            .require(lead_id)
            .map_err(PipelineError::from_lead_error)?;
        if lead.status.is_terminal() || lead.conversation_stage.is_terminal() {
            self.store.runs.mark_succeeded(lead_id, stage)?;
            info!(lead_id = %lead_id, stage = %stage, "Lead is closed, skipping stage");
            return Ok(StageOutcome::Skipped);
        }

        debug!(lead_id = %lead_id, stage = %stage, attempt, "Executing stage");
        match self.work.run(&lead, stage).await {
            Ok(StageResult::Completed) => {
                self.store.runs.mark_succeeded(lead_id, stage)?;
                if lead.failed_stages.contains(&stage) {
                    self.store.modify_lead(lead_id, |l| l.clear_stage_flag(stage))?;
                }
                let next = self.advance(lead_id, stage)?;
                info!(lead_id = %lead_id, stage = %stage, next = ?next, "Stage succeeded");
                Ok(StageOutcome::Succeeded { next })
            }
            Ok(StageResult::Gated(approval_id)) => {
                self.store.runs.mark_awaiting_approval(lead_id, stage)?;
                info!(lead_id = %lead_id, stage = %stage, approval_id = %approval_id, "Stage awaiting approval");
                Ok(StageOutcome::AwaitingApproval { approval_id })
            }
            Err(err @ (PipelineError::Storage(_) | PipelineError::LeadNotFound(_))) => Err(err),
            Err(err) if err.is_transient() && self.retry.should_retry(attempt) => {
                let delay = self.retry.backoff(attempt);
                let due = now_ms().saturating_add(delay.as_millis() as i64);
                self.store
                    .runs
                    .retry_at(lead_id, stage, due, &err.to_string())?;
                warn!(
                    lead_id = %lead_id,
                    stage = %stage,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "Stage failed, retrying"
                );
                Ok(StageOutcome::Retrying {
                    attempt,
                    retry_in_ms: delay.as_millis() as u64,
                })
            }
            Err(err) => {
                let message = err.to_string();
                self.store.runs.mark_failed(lead_id, stage, &message)?;
                self.store.modify_lead(lead_id, |l| l.flag_stage(stage))?;
                let next = self.advance(lead_id, stage)?;
                warn!(
                    lead_id = %lead_id,
                    stage = %stage,
                    attempt,
                    error = %message,
                    "Stage failed, lead flagged"
                );
                Ok(StageOutcome::Failed {
                    error: message,
                    next,
                })
            }
        }
    }

    fn advance(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
    ) -> Result<Option<PipelineStage>, PipelineError> {
        match stage.next() {
            Some(next) => {
                self.queue.enqueue_at_offset(lead_id, next)?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }

    fn lead_lock(&self, lead_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.lead_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(lead_id).or_default())
    }

    fn release_lead_lock(&self, lead_id: Uuid, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.lead_locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and this caller hold it: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&lead_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::mock::{
        MockArtifacts, MockDispatch, MockDistributor, MockEnrichment, MockPayments,
    };
    use crate::collaborator::RecordedDispatch;
    use crate::error::CollaboratorError;
    use leadflow_core::error::LeadflowError;
    use leadflow_core::types::{ConversationStage, Enrichment, LeadStatus, StageRunStatus};
    use leadflow_storage::Database;

    struct Harness {
        pipeline: Arc<PipelineOrchestrator>,
        store: Store,
        db: Arc<Database>,
        distributor: Arc<MockDistributor>,
    }

    fn harness(enrichment: MockEnrichment, artifacts: MockArtifacts) -> Harness {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = Store::new(Arc::clone(&db));
        let config = PipelineConfig {
            delay_unit_secs: 0,
            stage_timeout_ms: 50,
            backoff_base_ms: 0,
            ..PipelineConfig::default()
        };
        let distributor = Arc::new(MockDistributor::new());
        let collaborators = Collaborators {
            dispatch: Arc::new(MockDispatch::new()),
            enrichment: Arc::new(enrichment),
            artifacts: Arc::new(artifacts),
            payments: Arc::new(MockPayments::new()),
            distributor: distributor.clone(),
        };
        let conversation = Arc::new(ConversationStageMachine::new(Arc::clone(&store.leads)));
        let queue = Arc::new(StageQueue::new(
            Arc::clone(&store.leads),
            Arc::clone(&store.runs),
            Duration::ZERO,
        ));
        let dispatch = RecordedDispatch::new(
            Arc::clone(&collaborators.dispatch),
            Arc::clone(&store.events),
            config.stage_timeout(),
        );
        let gate = Arc::new(ApprovalGate::new(
            store.clone(),
            Arc::clone(&conversation),
            Arc::clone(&queue),
            Arc::clone(&collaborators.payments),
            dispatch,
            config.stage_timeout(),
        ));
        let pipeline = Arc::new(PipelineOrchestrator::new(
            store.clone(),
            queue,
            collaborators,
            conversation,
            gate,
            &config,
        ));
        Harness {
            pipeline,
            store,
            db,
            distributor,
        }
    }

    fn new_lead() -> NewLead {
        NewLead {
            name: "Dana Ruiz".to_string(),
            company: "Ruiz Plumbing".to_string(),
            phone: Some("(555) 010-2030".to_string()),
            ..NewLead::default()
        }
    }

    fn plumber() -> Enrichment {
        Enrichment {
            category: Some("Plumber".to_string()),
            rating: Some(4.7),
            ..Enrichment::default()
        }
    }

    #[tokio::test]
    async fn test_ingest_normalizes_and_enqueues_enrichment() {
        let h = harness(MockEnrichment::returning(plumber()), MockArtifacts::new());
        let lead = h.pipeline.ingest(new_lead()).unwrap();

        assert_eq!(lead.phone.as_deref(), Some("5550102030"));
        assert_eq!(lead.status, LeadStatus::Created);
        assert_eq!(lead.conversation_stage, ConversationStage::New);
        let run = h
            .store
            .runs
            .get(lead.id, PipelineStage::Enrichment)
            .unwrap()
            .unwrap();
        assert_eq!(run.status, StageRunStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_ingest_rejects_missing_company() {
        let h = harness(MockEnrichment::returning(plumber()), MockArtifacts::new());
        let err = h
            .pipeline
            .ingest(NewLead {
                name: "Dana".to_string(),
                ..NewLead::default()
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidLead(_)));
        assert_eq!(h.store.leads.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pipeline_runs_to_approval_gate() {
        let h = harness(MockEnrichment::returning(plumber()), MockArtifacts::new());
        let lead = h.pipeline.ingest(new_lead()).unwrap();

        let executed = h.pipeline.run_until_idle().await.unwrap();
        assert_eq!(executed, 4);

        let stored = h.store.leads.require(lead.id).unwrap();
        assert_eq!(stored.status, LeadStatus::Enriched);
        assert!(stored.artifact.is_some());
        assert!(stored.personalization.is_some());
        assert!(stored.draft_message.is_some());
        assert_eq!(
            stored.conversation_stage,
            ConversationStage::PreviewPendingApproval
        );
        let drafting = h
            .store
            .runs
            .get(lead.id, PipelineStage::MessageDrafting)
            .unwrap()
            .unwrap();
        assert_eq!(drafting.status, StageRunStatus::AwaitingApproval);
        assert!(h
            .store
            .runs
            .get(lead.id, PipelineStage::Distribution)
            .unwrap()
            .is_none());
        assert!(h.distributor.distributed().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_flags() {
        let h = harness(
            MockEnrichment::failing(CollaboratorError::RateLimited),
            MockArtifacts::new(),
        );
        let lead = h.pipeline.ingest(new_lead()).unwrap();
        h.pipeline.run_until_idle().await.unwrap();

        let run = h
            .store
            .runs
            .get(lead.id, PipelineStage::Enrichment)
            .unwrap()
            .unwrap();
        assert_eq!(run.status, StageRunStatus::Failed);
        assert_eq!(run.attempts, 3);

        let stored = h.store.leads.require(lead.id).unwrap();
        assert_eq!(stored.failed_stages, vec![PipelineStage::Enrichment]);
        assert_eq!(stored.status, LeadStatus::Created);
        assert!(stored.artifact.is_some());
        assert_eq!(h.pipeline.failures(lead.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_structural_failure_not_retried() {
        let h = harness(
            MockEnrichment::failing(CollaboratorError::Rejected("unknown business".to_string())),
            MockArtifacts::new(),
        );
        let lead = h.pipeline.ingest(new_lead()).unwrap();
        let outcome = h
            .pipeline
            .execute_stage(lead.id, PipelineStage::Enrichment)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            StageOutcome::Failed {
                next: Some(PipelineStage::ArtifactGeneration),
                ..
            }
        ));
        let run = h
            .store
            .runs
            .get(lead.id, PipelineStage::Enrichment)
            .unwrap()
            .unwrap();
        assert_eq!(run.status, StageRunStatus::Failed);
    }

    #[tokio::test]
    async fn test_drafting_without_destination_fails_and_moves_on() {
        let h = harness(MockEnrichment::returning(plumber()), MockArtifacts::new());
        let lead = h
            .pipeline
            .ingest(NewLead {
                phone: None,
                ..new_lead()
            })
            .unwrap();
        h.pipeline.run_until_idle().await.unwrap();

        let stored = h.store.leads.require(lead.id).unwrap();
        assert!(stored.failed_stages.contains(&PipelineStage::MessageDrafting));
        assert!(stored.failed_stages.contains(&PipelineStage::Distribution));
        assert_eq!(stored.conversation_stage, ConversationStage::Qualified);
    }

    #[tokio::test]
    async fn test_failed_approval_insert_leaves_stage_unchanged() {
        let h = harness(MockEnrichment::returning(plumber()), MockArtifacts::new());
        let lead = h.pipeline.ingest(new_lead()).unwrap();
        for stage in [
            PipelineStage::Enrichment,
            PipelineStage::ArtifactGeneration,
            PipelineStage::Personalization,
        ] {
            h.pipeline.execute_stage(lead.id, stage).await.unwrap();
        }
        h.db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER approvals_offline BEFORE INSERT ON approvals
                 BEGIN SELECT RAISE(ABORT, 'approvals offline'); END;",
            )
            .map_err(|e| LeadflowError::Storage(e.to_string()))
        })
        .unwrap();

        let outcome = h
            .pipeline
            .execute_stage(lead.id, PipelineStage::MessageDrafting)
            .await
            .unwrap();
        assert!(matches!(outcome, StageOutcome::Failed { .. }));

        let stored = h.store.leads.require(lead.id).unwrap();
        assert_eq!(stored.conversation_stage, ConversationStage::Qualified);
        assert!(stored.failed_stages.contains(&PipelineStage::MessageDrafting));
        assert!(h.store.approvals.list(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_preview_blocks_drafting() {
        let h = harness(MockEnrichment::returning(plumber()), MockArtifacts::expired());
        let lead = h.pipeline.ingest(new_lead()).unwrap();
        h.pipeline.run_until_idle().await.unwrap();

        let failures = h.pipeline.failures(lead.id).unwrap();
        let drafting = failures
            .iter()
            .find(|r| r.stage == PipelineStage::MessageDrafting)
            .unwrap();
        assert!(drafting.last_error.as_deref().unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn test_closed_lead_skips_stages() {
        let h = harness(MockEnrichment::returning(plumber()), MockArtifacts::new());
        let lead = h.pipeline.ingest(new_lead()).unwrap();
        h.store
            .modify_lead(lead.id, |l| l.status = LeadStatus::Closed)
            .unwrap();

        let outcome = h
            .pipeline
            .execute_stage(lead.id, PipelineStage::Enrichment)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Skipped);
        assert!(h
            .store
            .runs
            .get(lead.id, PipelineStage::ArtifactGeneration)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_success_clears_previous_flag() {
        let h = harness(MockEnrichment::returning(plumber()), MockArtifacts::new());
        let lead = h.pipeline.ingest(new_lead()).unwrap();
        h.store
            .modify_lead(lead.id, |l| l.flag_stage(PipelineStage::Enrichment))
            .unwrap();

        h.pipeline
            .execute_stage(lead.id, PipelineStage::Enrichment)
            .await
            .unwrap();
        assert!(h
            .store
            .leads
            .require(lead.id)
            .unwrap()
            .failed_stages
            .is_empty());
    }

    #[tokio::test]
    async fn test_execute_stage_unknown_lead() {
        let h = harness(MockEnrichment::returning(plumber()), MockArtifacts::new());
        let err = h
            .pipeline
            .execute_stage(Uuid::new_v4(), PipelineStage::Enrichment)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::LeadNotFound(_)));
    }

    #[tokio::test]
    async fn test_lead_locks_are_released() {
        let h = harness(MockEnrichment::returning(plumber()), MockArtifacts::new());
        h.pipeline.ingest(new_lead()).unwrap();
        h.pipeline.ingest(new_lead()).unwrap();
        h.pipeline.run_until_idle().await.unwrap();
        assert!(h.pipeline.lead_locks.lock().unwrap().is_empty());
    }
}
