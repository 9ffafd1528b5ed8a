//! Durable stage queue backed by the `stage_runs` table.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use leadflow_core::error::LeadflowError;
use leadflow_core::types::{PipelineStage, Timestamp};
use leadflow_storage::{LeadRepository, StageRunRepository};

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Scheduling front for stage runs. Every enqueue wakes the scheduler so
/// zero-delay work does not wait for the next poll.
pub struct StageQueue {
    leads: Arc<LeadRepository>,
    runs: Arc<StageRunRepository>,
    delay_unit: Duration,
    wake: Arc<Notify>,
}

impl StageQueue {
    pub fn new(
        leads: Arc<LeadRepository>,
        runs: Arc<StageRunRepository>,
        delay_unit: Duration,
    ) -> Self {
        Self {
            leads,
            runs,
            delay_unit,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Schedule `stage` no earlier than `delay` from now. Returns `false`
    /// if the stage is currently running for this lead.
    pub fn enqueue(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
        delay: Duration,
    ) -> Result<bool, LeadflowError> {
        self.leads.require(lead_id)?;
        let due = now_ms().saturating_add(delay.as_millis() as i64);
        self.schedule(lead_id, stage, due)
    }

    /// Schedule `stage` at its fixed offset from the lead's creation, or
    /// now if that moment has already passed.
    pub fn enqueue_at_offset(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
    ) -> Result<bool, LeadflowError> {
        let lead = self.leads.require(lead_id)?;
        let due = self.offset_due_ms(lead.created_at, stage).max(now_ms());
        self.schedule(lead_id, stage, due)
    }

    pub(crate) fn offset_due_ms(&self, created_at: Timestamp, stage: PipelineStage) -> i64 {
        let offset_ms = self.delay_unit.as_millis() as i64 * stage.offset_units() as i64;
        created_at.0.saturating_mul(1000).saturating_add(offset_ms)
    }

    pub(crate) fn runs(&self) -> &Arc<StageRunRepository> {
        &self.runs
    }

    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    fn schedule(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
        due_at_ms: i64,
    ) -> Result<bool, LeadflowError> {
        let scheduled = self.runs.schedule(lead_id, stage, due_at_ms)?;
        if scheduled {
            self.wake.notify_one();
        }
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::types::{Lead, NewLead, StageRunStatus};
    use leadflow_storage::Database;

    fn setup(unit: Duration) -> (StageQueue, Lead) {
        let db = Arc::new(Database::in_memory().unwrap());
        let leads = Arc::new(LeadRepository::new(Arc::clone(&db)));
        let runs = Arc::new(StageRunRepository::new(db));
        let lead = Lead::from_new(
            NewLead {
                name: "Dana".to_string(),
                company: "Ruiz Plumbing".to_string(),
                ..NewLead::default()
            },
            Timestamp::now(),
        );
        leads.insert(&lead).unwrap();
        (StageQueue::new(leads, runs, unit), lead)
    }

    #[test]
    fn test_enqueue_schedules_run() {
        let (queue, lead) = setup(Duration::from_secs(60));
        let before = now_ms();
        assert!(queue
            .enqueue(lead.id, PipelineStage::Enrichment, Duration::from_secs(5))
            .unwrap());

        let run = queue
            .runs()
            .get(lead.id, PipelineStage::Enrichment)
            .unwrap()
            .unwrap();
        assert_eq!(run.status, StageRunStatus::Scheduled);
        assert!(run.due_at_ms >= before + 5_000);
    }

    #[test]
    fn test_enqueue_unknown_lead() {
        let (queue, _) = setup(Duration::from_secs(60));
        let err = queue
            .enqueue(Uuid::new_v4(), PipelineStage::Enrichment, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, LeadflowError::LeadNotFound(_)));
    }

    #[test]
    fn test_offsets_follow_lead_creation() {
        let (queue, lead) = setup(Duration::from_secs(60));
        let base = lead.created_at.0 * 1000;
        assert_eq!(queue.offset_due_ms(lead.created_at, PipelineStage::Enrichment), base);
        assert_eq!(
            queue.offset_due_ms(lead.created_at, PipelineStage::Personalization),
            base + 10 * 60_000
        );
        assert_eq!(
            queue.offset_due_ms(lead.created_at, PipelineStage::Distribution),
            base + 20 * 60_000
        );
    }

    #[test]
    fn test_overdue_offset_schedules_now() {
        let (queue, lead) = setup(Duration::ZERO);
        queue
            .enqueue_at_offset(lead.id, PipelineStage::Distribution)
            .unwrap();
        let run = queue
            .runs()
            .get(lead.id, PipelineStage::Distribution)
            .unwrap()
            .unwrap();
        assert!(run.due_at_ms >= lead.created_at.0 * 1000);
        assert!(run.due_at_ms <= now_ms());
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        let (queue, lead) = setup(Duration::ZERO);
        let wake = queue.wake_handle();
        queue
            .enqueue(lead.id, PipelineStage::Enrichment, Duration::ZERO)
            .unwrap();
        // The permit is stored, so this returns immediately.
        tokio::time::timeout(Duration::from_secs(1), wake.notified())
            .await
            .unwrap();
    }
}
