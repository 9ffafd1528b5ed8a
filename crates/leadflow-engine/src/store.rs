//! Shared handle to every repository the engine writes through.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use leadflow_core::error::LeadflowError;
use leadflow_core::types::Lead;
use leadflow_storage::{
    ApprovalRepository, Database, EventRepository, LeadRepository, StageRunRepository,
};

/// Attempts for a read-modify-write on a lead before giving up on a
/// version conflict.
const LEAD_WRITE_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct Store {
    pub leads: Arc<LeadRepository>,
    pub events: Arc<EventRepository>,
    pub approvals: Arc<ApprovalRepository>,
    pub runs: Arc<StageRunRepository>,
}

impl Store {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            leads: Arc::new(LeadRepository::new(Arc::clone(&db))),
            events: Arc::new(EventRepository::new(Arc::clone(&db))),
            approvals: Arc::new(ApprovalRepository::new(Arc::clone(&db))),
            runs: Arc::new(StageRunRepository::new(db)),
        }
    }

    /// Re-read, mutate and write a lead, retrying on version conflicts.
    ///
    /// `apply` may run more than once and must be idempotent over a fresh
    /// copy of the lead.
    pub fn modify_lead<F>(&self, id: Uuid, mut apply: F) -> Result<Lead, LeadflowError>
    where
        F: FnMut(&mut Lead),
    {
        let mut attempt = 1;
        loop {
            let mut lead = self.leads.require(id)?;
            apply(&mut lead);
            match self.leads.update(&lead) {
                Err(LeadflowError::VersionConflict { .. }) if attempt < LEAD_WRITE_ATTEMPTS => {
                    debug!(lead_id = %id, attempt, "Lead version conflict, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
