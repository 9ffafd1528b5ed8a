//! Approval gate engine.
//!
//! Gated actions are persisted as pending approvals and carried out only
//! after a human decision. Approval runs the gate's executor; denial applies
//! the gate's compensating transition and records a single
//! `approval_denied` event. Executor failures are stored on the approval and
//! can be retried with [`ApprovalGate::redeliver`].

pub mod compensation;
pub mod executor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use leadflow_core::error::LeadflowError;
use leadflow_core::events::{Event, EventType};
use leadflow_core::types::{
    Approval, ApprovalStatus, ConversationStage, Decision, GateType, Metadata, PriorityTier,
    Timestamp,
};
use leadflow_storage::{Resolution, ResolveOutcome};

use crate::collaborator::{with_timeout, PaymentProvider, PaymentRequest, RecordedDispatch};
use crate::conversation::{Authority, ConversationStageMachine};
use crate::error::GateError;
use crate::pipeline::StageQueue;
use crate::store::Store;

pub use compensation::compensation;

/// A gated action waiting to be persisted.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub gate_type: GateType,
    pub lead_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub priority: PriorityTier,
    pub description: String,
    pub draft_content: Option<String>,
    pub metadata: Metadata,
}

impl ApprovalRequest {
    pub fn new(gate_type: GateType, description: impl Into<String>) -> Self {
        Self {
            gate_type,
            lead_id: None,
            client_id: None,
            priority: PriorityTier::default(),
            description: description.into(),
            draft_content: None,
            metadata: Metadata::new(),
        }
    }

    pub fn for_lead(mut self, lead_id: Uuid) -> Self {
        self.lead_id = Some(lead_id);
        self
    }

    pub fn for_client(mut self, client_id: Uuid) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn with_priority(mut self, priority: PriorityTier) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_draft(mut self, draft: impl Into<String>) -> Self {
        self.draft_content = Some(draft.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    fn validate(&self) -> Result<(), GateError> {
        if self.description.trim().is_empty() {
            return Err(GateError::InvalidRequest(
                "description must not be empty".to_string(),
            ));
        }
        let needs_lead = match self.gate_type {
            GateType::PaymentLink
            | GateType::SitePublish
            | GateType::OutboundMessage
            | GateType::StatusChange
            | GateType::LeadDeletion
            | GateType::PricingOverride => true,
            GateType::Refund | GateType::SubscriptionCancel => {
                if self.lead_id.is_none() && self.client_id.is_none() {
                    return Err(GateError::InvalidRequest(format!(
                        "{} requires a lead or client",
                        self.gate_type
                    )));
                }
                false
            }
            GateType::BulkSend | GateType::ExternalImport => false,
        };
        if needs_lead && self.lead_id.is_none() {
            return Err(GateError::InvalidRequest(format!(
                "{} requires a lead",
                self.gate_type
            )));
        }
        Ok(())
    }
}

pub struct ApprovalGate {
    store: Store,
    conversation: Arc<ConversationStageMachine>,
    queue: Arc<StageQueue>,
    payments: Arc<dyn PaymentProvider>,
    dispatch: RecordedDispatch,
    timeout: Duration,
    // At most one executor runs per approval at a time.
    exec_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl ApprovalGate {
    pub(crate) fn new(
        store: Store,
        conversation: Arc<ConversationStageMachine>,
        queue: Arc<StageQueue>,
        payments: Arc<dyn PaymentProvider>,
        dispatch: RecordedDispatch,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            conversation,
            queue,
            payments,
            dispatch,
            timeout,
            exec_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a pending approval and return its id.
    ///
    /// A payment link request without a `payment_url` gets one from the
    /// payment provider up front so the operator reviews the real link, and
    /// moves a lead at `preview_sent` to `payment_pending_approval`.
    pub async fn request_approval(&self, mut request: ApprovalRequest) -> Result<Uuid, GateError> {
        request.validate()?;
        let lead = match request.lead_id {
            Some(id) => Some(
                self.store
                    .leads
                    .get(id)?
                    .ok_or_else(|| GateError::InvalidRequest(format!("unknown lead {}", id)))?,
            ),
            None => None,
        };

        if request.gate_type == GateType::PaymentLink && !request.metadata.contains_key("payment_url")
        {
            if let Some(lead) = &lead {
                let payment = PaymentRequest {
                    lead_id: lead.id,
                    company: lead.company.clone(),
                    amount_cents: request
                        .metadata
                        .get("amount_cents")
                        .and_then(|v| v.as_i64())
                        .or(lead.pricing_override_cents),
                };
                let url = with_timeout(self.timeout, self.payments.create_link(&payment)).await?;
                request
                    .metadata
                    .insert("payment_url".to_string(), url.into());
            }
        }

        let approval = Approval {
            id: Uuid::new_v4(),
            gate_type: request.gate_type,
            lead_id: request.lead_id,
            client_id: request.client_id,
            priority: request.priority,
            description: request.description,
            draft_content: request.draft_content,
            metadata: request.metadata,
            status: ApprovalStatus::Pending,
            resolver: None,
            resolved_at: None,
            denial_reason: None,
            execution_error: None,
            created_at: Timestamp::now(),
        };
        self.store.approvals.insert(&approval)?;

        if let (GateType::PaymentLink, Some(lead_id)) = (approval.gate_type, approval.lead_id) {
            self.conversation.transition_if_at(
                lead_id,
                ConversationStage::PreviewSent,
                ConversationStage::PaymentPendingApproval,
                Authority::PendingGate(approval.id),
            )?;
        }

        info!(
            approval_id = %approval.id,
            gate_type = %approval.gate_type,
            lead_id = ?approval.lead_id,
            priority = %approval.priority,
            "Approval requested"
        );
        Ok(approval.id)
    }

    /// Approve or deny a pending approval. The first resolver wins; later
    /// calls get [`GateError::AlreadyResolved`].
    pub async fn resolve(
        &self,
        id: Uuid,
        decision: Decision,
        resolver: &str,
        denial_reason: Option<&str>,
        metadata_override: Option<Metadata>,
    ) -> Result<Approval, GateError> {
        if resolver.trim().is_empty() {
            return Err(GateError::InvalidRequest(
                "resolver must not be empty".to_string(),
            ));
        }
        let current = self.get(id)?;
        if current.status != ApprovalStatus::Pending {
            return Err(GateError::AlreadyResolved {
                id,
                status: current.status,
            });
        }

        let mut metadata = current.metadata;
        let denial_reason = match decision {
            Decision::Approve => {
                metadata.extend(metadata_override.unwrap_or_default());
                None
            }
            Decision::Deny => {
                if let Some(reason) = denial_reason {
                    metadata.insert("denial_reason".to_string(), reason.into());
                }
                denial_reason
            }
        };

        let resolution = Resolution {
            status: decision.resulting_status(),
            resolver,
            resolved_at: Timestamp::now(),
            denial_reason,
            metadata: &metadata,
        };
        let approval = match self.store.approvals.resolve(id, &resolution) {
            Ok(ResolveOutcome::Resolved(approval)) => approval,
            Ok(ResolveOutcome::AlreadyResolved(existing)) => {
                return Err(GateError::AlreadyResolved {
                    id,
                    status: existing.status,
                })
            }
            Err(LeadflowError::ApprovalNotFound(id)) => return Err(GateError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };
        info!(
            approval_id = %id,
            gate_type = %approval.gate_type,
            status = %approval.status,
            resolver,
            "Approval resolved"
        );

        match decision {
            Decision::Approve => self.execute_and_record(approval).await,
            Decision::Deny => {
                self.record_denial(&approval)?;
                self.compensate(&approval)?;
                Ok(approval)
            }
        }
    }

    /// Re-run the executor of an approved approval, e.g. after a delivery
    /// failure. Sends that already went out are not repeated.
    pub async fn redeliver(&self, id: Uuid) -> Result<Approval, GateError> {
        let approval = self.get(id)?;
        if approval.status != ApprovalStatus::Approved {
            return Err(GateError::NotApproved(id));
        }
        info!(approval_id = %id, gate_type = %approval.gate_type, "Redelivering approval");
        self.execute_and_record(approval).await
    }

    pub fn get(&self, id: Uuid) -> Result<Approval, GateError> {
        self.store.approvals.get(id)?.ok_or(GateError::NotFound(id))
    }

    pub fn list(&self, status: Option<ApprovalStatus>) -> Result<Vec<Approval>, GateError> {
        Ok(self.store.approvals.list(status)?)
    }

    pub fn pending(&self) -> Result<Vec<Approval>, GateError> {
        self.list(Some(ApprovalStatus::Pending))
    }

    /// The pending approval of `gate_type` for a lead, if one exists.
    pub fn pending_for(
        &self,
        lead_id: Uuid,
        gate_type: GateType,
    ) -> Result<Option<Approval>, GateError> {
        Ok(self
            .pending()?
            .into_iter()
            .find(|a| a.gate_type == gate_type && a.lead_id == Some(lead_id)))
    }

    /// Run the executor while holding the approval's execution lock. A
    /// caller that waited re-reads the approval and finds earlier sends
    /// already recorded.
    async fn execute_and_record(&self, approval: Approval) -> Result<Approval, GateError> {
        let id = approval.id;
        let lock = self.exec_lock(id);
        let outcome = {
            let _guard = lock.lock().await;
            match self.get(id) {
                Ok(latest) => self.execute_locked(latest).await,
                Err(e) => Err(e),
            }
        };
        self.release_exec_lock(id, lock);
        outcome
    }

    async fn execute_locked(&self, approval: Approval) -> Result<Approval, GateError> {
        let id = approval.id;
        match executor::execute(self, &approval).await {
            Ok(()) => {
                if approval.execution_error.is_some() {
                    self.store.approvals.record_execution_error(id, None)?;
                }
                info!(approval_id = %id, gate_type = %approval.gate_type, "Approval executed");
            }
            Err(err) => {
                warn!(
                    approval_id = %id,
                    gate_type = %approval.gate_type,
                    error = %err,
                    "Approval execution failed"
                );
                self.store
                    .approvals
                    .record_execution_error(id, Some(&err.to_string()))?;
            }
        }
        self.get(id)
    }

    fn exec_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.exec_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id).or_default())
    }

    fn release_exec_lock(&self, id: Uuid, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.exec_locks.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&id);
        }
    }

    fn compensate(&self, approval: &Approval) -> Result<(), GateError> {
        let (Some((from, to)), Some(lead_id)) = (compensation(approval.gate_type), approval.lead_id)
        else {
            return Ok(());
        };
        let applied = self.conversation.transition_if_at(
            lead_id,
            from,
            to,
            Authority::DeniedGate(approval.id),
        )?;
        if applied.is_none() {
            debug!(
                approval_id = %approval.id,
                lead_id = %lead_id,
                %from,
                "Lead no longer at compensated stage, nothing to revert"
            );
        }
        Ok(())
    }

    fn record_denial(&self, approval: &Approval) -> Result<(), GateError> {
        let subject = approval
            .lead_id
            .or(approval.client_id)
            .unwrap_or(approval.id);
        let event = Event::new(subject, EventType::ApprovalDenied, Timestamp::now())
            .with_metadata("approval_id", approval.id.to_string())
            .with_metadata("gate_type", approval.gate_type.as_str())
            .with_metadata("reason", approval.denial_reason.clone())
            .with_dedupe_key(format!("denied:{}", approval.id));
        self.store.events.append(&event)?;
        Ok(())
    }
}
