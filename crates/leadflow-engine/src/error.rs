//! Error types for the conversion engine.

use leadflow_core::error::LeadflowError;
use leadflow_core::types::{ApprovalStatus, ConversationStage, PipelineStage};
use uuid::Uuid;

use crate::conversation::Authority;

/// Failures reported by external collaborators (dispatch channels,
/// enrichment, content generation, payments, distribution).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Call timed out after {0} ms")]
    Timeout(u64),
    #[error("Rate limited by provider")]
    RateLimited,
    #[error("Upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    /// Timeouts, rate limits and 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            CollaboratorError::Timeout(_) | CollaboratorError::RateLimited => true,
            CollaboratorError::Upstream { status, .. } => *status >= 500,
            CollaboratorError::Rejected(_) => false,
        }
    }
}

/// Errors from conversation stage transitions.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("Invalid conversation transition: {0} -> {1}")]
    InvalidTransition(ConversationStage, ConversationStage),
    #[error("{authority} may not move a lead {from} -> {to}")]
    Unauthorized {
        authority: Authority,
        from: ConversationStage,
        to: ConversationStage,
    },
    #[error("Conversation stage of lead {0} changed concurrently")]
    Conflict(Uuid),
    #[error("Storage error: {0}")]
    Storage(#[from] LeadflowError),
}

/// Errors from the approval gate engine. Executor failures are not here:
/// they are stored on the approval, never returned to the resolver.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Approval not found: {0}")]
    NotFound(Uuid),
    #[error("Approval {id} already resolved as {status}")]
    AlreadyResolved { id: Uuid, status: ApprovalStatus },
    #[error("Approval {0} is not approved")]
    NotApproved(Uuid),
    #[error("Invalid approval request: {0}")]
    InvalidRequest(String),
    #[error("Payment provider failed: {0}")]
    Payment(#[from] CollaboratorError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error("Storage error: {0}")]
    Storage(#[from] LeadflowError),
}

/// Failure of a gate executor while carrying out an approved action.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Invalid approval metadata: {0}")]
    InvalidMetadata(String),
    #[error("Lead not found: {0}")]
    LeadNotFound(Uuid),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error("Storage error: {0}")]
    Storage(#[from] LeadflowError),
}

/// Errors from the pipeline orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Lead not found: {0}")]
    LeadNotFound(Uuid),
    #[error("Invalid lead: {0}")]
    InvalidLead(String),
    #[error("Stage {stage} failed: {source}")]
    Collaborator {
        stage: PipelineStage,
        #[source]
        source: CollaboratorError,
    },
    #[error("Stage {stage} is missing a prerequisite: {reason}")]
    MissingPrerequisite {
        stage: PipelineStage,
        reason: String,
    },
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("Storage error: {0}")]
    Storage(#[from] LeadflowError),
}

impl PipelineError {
    /// Only transient collaborator failures are retried; everything else is
    /// structural for the stage.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Collaborator { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn from_lead_error(err: LeadflowError) -> Self {
        match err {
            LeadflowError::LeadNotFound(id) => PipelineError::LeadNotFound(id),
            LeadflowError::Validation { .. } => PipelineError::InvalidLead(err.to_string()),
            other => PipelineError::Storage(other),
        }
    }
}

/// Errors from recording inbound timeline events.
#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("Event type {0} is written by the engine, not recorded from outside")]
    ReservedEventType(leadflow_core::events::EventType),
    #[error("Storage error: {0}")]
    Storage(#[from] LeadflowError),
}
