//! Conversation stage machine.
//!
//! The single writer of `Lead::conversation_stage`. Instances are created
//! only inside this crate and handed to the pipeline orchestrator and the
//! approval gate engine, so every stage change is attributable to one of
//! those two call sites through its [`Authority`].

pub mod state_machine;

use std::fmt;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use leadflow_core::types::{ConversationStage, PipelineStage};
use leadflow_storage::LeadRepository;

use crate::error::ConversationError;

pub use state_machine::{validate_transition, Direction};

/// Who is asking for a conversation stage change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// The orchestrator completing (or gating) a pipeline stage.
    PipelineStage(PipelineStage),
    /// The gate engine raising a new approval for the lead.
    PendingGate(Uuid),
    /// The gate engine executing an approved approval.
    ApprovedGate(Uuid),
    /// The gate engine compensating a denied approval.
    DeniedGate(Uuid),
}

impl Authority {
    pub fn may_advance(&self) -> bool {
        !matches!(self, Authority::DeniedGate(_))
    }

    pub fn may_revert(&self) -> bool {
        matches!(self, Authority::DeniedGate(_))
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authority::PipelineStage(stage) => write!(f, "pipeline stage {}", stage),
            Authority::PendingGate(id) => write!(f, "pending approval {}", id),
            Authority::ApprovedGate(id) => write!(f, "approved approval {}", id),
            Authority::DeniedGate(id) => write!(f, "denied approval {}", id),
        }
    }
}

/// A stage change that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConversationStage,
    pub to: ConversationStage,
}

pub struct ConversationStageMachine {
    leads: Arc<LeadRepository>,
}

impl ConversationStageMachine {
    pub(crate) fn new(leads: Arc<LeadRepository>) -> Self {
        Self { leads }
    }

    /// Move the lead from its current stage to `to`.
    ///
    /// Fails with `InvalidTransition` / `Unauthorized` if the table forbids
    /// it, and with `Conflict` if another writer changed the stage between
    /// the read and the compare-and-set.
    pub fn transition(
        &self,
        lead_id: Uuid,
        to: ConversationStage,
        authority: Authority,
    ) -> Result<Transition, ConversationError> {
        let from = self.leads.require(lead_id)?.conversation_stage;
        validate_transition(from, to, authority)?;
        if !self.leads.compare_and_set_stage(lead_id, from, to)? {
            return Err(ConversationError::Conflict(lead_id));
        }
        info!(lead_id = %lead_id, %from, %to, %authority, "Conversation stage changed");
        Ok(Transition { from, to })
    }

    /// Move the lead `from -> to` only if it is currently at `from`.
    ///
    /// Returns `Ok(None)` when the lead is elsewhere; used by executors and
    /// compensations whose effect is conditional on where the lead stands.
    pub fn transition_if_at(
        &self,
        lead_id: Uuid,
        from: ConversationStage,
        to: ConversationStage,
        authority: Authority,
    ) -> Result<Option<Transition>, ConversationError> {
        validate_transition(from, to, authority)?;
        if self.leads.compare_and_set_stage(lead_id, from, to)? {
            info!(lead_id = %lead_id, %from, %to, %authority, "Conversation stage changed");
            Ok(Some(Transition { from, to }))
        } else {
            Ok(None)
        }
    }

    /// Close the conversation from wherever it stands. No-op if already
    /// closed.
    pub fn close(
        &self,
        lead_id: Uuid,
        authority: Authority,
    ) -> Result<Option<Transition>, ConversationError> {
        let current = self.leads.require(lead_id)?.conversation_stage;
        if current.is_terminal() {
            return Ok(None);
        }
        self.transition(lead_id, ConversationStage::ClosedLost, authority)
            .map(Some)
    }

    pub fn current(&self, lead_id: Uuid) -> Result<ConversationStage, ConversationError> {
        Ok(self.leads.require(lead_id)?.conversation_stage)
    }
}
