//! Background scheduler loop for due stage runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info};

use super::queue::now_ms;
use super::PipelineOrchestrator;

/// Claim due runs and execute each in its own task until `shutdown` fires.
///
/// Runs left `running` by a previous process are returned to the queue
/// first. Sleeps until the next due run, an enqueue wake-up, a finished
/// task, or the poll interval, whichever comes first.
pub(super) async fn run(pipeline: Arc<PipelineOrchestrator>, shutdown: Arc<Notify>) {
    if let Err(e) = pipeline.store.runs.recover_running() {
        error!(error = %e, "Failed to recover interrupted stage runs");
    }

    let permits = Arc::new(Semaphore::new(pipeline.max_concurrent));
    let wake = pipeline.queue().wake_handle();
    let mut tasks = JoinSet::new();
    info!(max_concurrent = pipeline.max_concurrent, "Pipeline scheduler started");

    loop {
        match pipeline
            .store
            .runs
            .claim_due(now_ms(), permits.available_permits())
        {
            Ok(claimed) => {
                for run in claimed {
                    let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                        break;
                    };
                    let pipeline = Arc::clone(&pipeline);
                    tasks.spawn(async move {
                        let _permit = permit;
                        pipeline.execute_claimed(run).await;
                    });
                }
            }
            Err(e) => error!(error = %e, "Failed to claim due stage runs"),
        }

        let wait = next_wait(&pipeline);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = wake.notified() => {}
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Stage task panicked");
                }
            }
            _ = shutdown.notified() => break,
        }
    }

    info!(in_flight = tasks.len(), "Pipeline scheduler stopping");
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Stage task panicked");
        }
    }
}

/// Time until the next scheduled run, capped by the poll interval. Work that
/// is already due but was not claimed is blocked on a running stage or on
/// concurrency; a finishing task wakes the loop for it.
fn next_wait(pipeline: &PipelineOrchestrator) -> Duration {
    match pipeline.store.runs.next_due_at_ms() {
        Ok(Some(due)) => {
            let until = due.saturating_sub(now_ms());
            if until > 0 {
                Duration::from_millis(until as u64).min(pipeline.poll_interval)
            } else {
                pipeline.poll_interval
            }
        }
        Ok(None) => pipeline.poll_interval,
        Err(e) => {
            error!(error = %e, "Failed to read next due stage run");
            pipeline.poll_interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::Collaborators;
    use crate::LeadflowEngine;
    use leadflow_core::config::LeadflowConfig;
    use leadflow_core::types::{ConversationStage, NewLead, PipelineStage, StageRunStatus};
    use leadflow_storage::Database;

    fn engine() -> LeadflowEngine {
        let mut config = LeadflowConfig::default();
        config.pipeline.delay_unit_secs = 0;
        config.pipeline.poll_interval_secs = 1;
        LeadflowEngine::new(
            Arc::new(Database::in_memory().unwrap()),
            Collaborators::dry_run(14),
            &config,
        )
    }

    #[tokio::test]
    async fn test_scheduler_shutdown() {
        let engine = engine();
        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();

        tokio::time::timeout(
            Duration::from_secs(2),
            Arc::clone(&engine.pipeline).run(Arc::clone(&shutdown)),
        )
        .await
        .expect("Scheduler should shut down within timeout");
    }

    #[tokio::test]
    async fn test_scheduler_drives_lead_to_gate() {
        let engine = engine();
        let lead = engine
            .pipeline
            .ingest(NewLead {
                name: "Dana".to_string(),
                company: "Ruiz Plumbing".to_string(),
                email: Some("dana@ruiz.test".to_string()),
                ..NewLead::default()
            })
            .unwrap();

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(Arc::clone(&engine.pipeline).run(Arc::clone(&shutdown)));

        let mut gated = false;
        for _ in 0..100 {
            let run = engine
                .store
                .runs
                .get(lead.id, PipelineStage::MessageDrafting)
                .unwrap();
            if run.map(|r| r.status) == Some(StageRunStatus::AwaitingApproval) {
                gated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.notify_one();
        handle.await.unwrap();

        assert!(gated, "message drafting never reached its approval gate");
        assert_eq!(
            engine.store.leads.require(lead.id).unwrap().conversation_stage,
            ConversationStage::PreviewPendingApproval
        );
    }

    #[tokio::test]
    async fn test_scheduler_recovers_orphaned_runs() {
        let engine = engine();
        let lead = engine
            .pipeline
            .ingest(NewLead {
                name: "Dana".to_string(),
                company: "Ruiz Plumbing".to_string(),
                ..NewLead::default()
            })
            .unwrap();
        // Simulate a crash mid-stage.
        engine.store.runs.claim_due(i64::MAX, 10).unwrap();

        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();
        tokio::time::timeout(
            Duration::from_secs(2),
            Arc::clone(&engine.pipeline).run(shutdown),
        )
        .await
        .unwrap();

        let run = engine
            .store
            .runs
            .get(lead.id, PipelineStage::Enrichment)
            .unwrap()
            .unwrap();
        assert_ne!(run.status, StageRunStatus::Running);
    }
}
