//! Conversion engine for Leadflow.
//!
//! Runs leads through the fixed production pipeline, holds gated actions
//! for human approval, tracks the conversation stage of each lead and keeps
//! engagement scores current.

pub mod collaborator;
pub mod conversation;
pub mod error;
pub mod gate;
pub mod pipeline;
pub mod scoring;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use leadflow_core::config::LeadflowConfig;
use leadflow_storage::Database;

pub use collaborator::{Collaborators, Delivery, RecordedDispatch};
pub use conversation::{Authority, ConversationStageMachine, Transition};
pub use error::{
    CollaboratorError, ConversationError, ExecutionError, GateError, PipelineError, TimelineError,
};
pub use gate::{ApprovalGate, ApprovalRequest};
pub use pipeline::{PipelineOrchestrator, StageOutcome, StageQueue};
pub use scoring::{EngagementScorer, ScoreBreakdown, ScoreRefresher};
pub use store::Store;

/// The wired engine. The conversation stage machine is shared only between
/// the pipeline and the gate engine.
pub struct LeadflowEngine {
    pub store: Store,
    pub pipeline: Arc<PipelineOrchestrator>,
    pub gate: Arc<ApprovalGate>,
    pub scores: Arc<ScoreRefresher>,
}

impl LeadflowEngine {
    pub fn new(db: Arc<Database>, collaborators: Collaborators, config: &LeadflowConfig) -> Self {
        let store = Store::new(db);
        let timeout = config.pipeline.stage_timeout();

        let conversation = Arc::new(ConversationStageMachine::new(Arc::clone(&store.leads)));
        let queue = Arc::new(StageQueue::new(
            Arc::clone(&store.leads),
            Arc::clone(&store.runs),
            Duration::from_secs(config.pipeline.delay_unit_secs),
        ));
        let dispatch = RecordedDispatch::new(
            Arc::clone(&collaborators.dispatch),
            Arc::clone(&store.events),
            timeout,
        );
        let gate = Arc::new(ApprovalGate::new(
            store.clone(),
            Arc::clone(&conversation),
            Arc::clone(&queue),
            Arc::clone(&collaborators.payments),
            dispatch,
            timeout,
        ));
        let pipeline = Arc::new(PipelineOrchestrator::new(
            store.clone(),
            queue,
            collaborators,
            conversation,
            Arc::clone(&gate),
            &config.pipeline,
        ));
        let scores = Arc::new(ScoreRefresher::new(
            store.clone(),
            EngagementScorer::new(config.scoring.trend_period_days),
        ));

        Self {
            store,
            pipeline,
            gate,
            scores,
        }
    }
}
