//! Executors for approved gated actions.
//!
//! Every executor can be re-run by `redeliver`. Sends are deduplicated by
//! [`RecordedDispatch`](crate::collaborator::RecordedDispatch); the other
//! executors check for their own event (keyed `<approval_id>:<event_type>`)
//! before acting a second time.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info};
use uuid::Uuid;

use leadflow_core::events::{Event, EventType};
use leadflow_core::types::{
    Approval, ConversationStage, GateType, Lead, LeadStatus, NewLead, PipelineStage, Timestamp,
};

use crate::collaborator::{with_timeout, Delivery};
use crate::conversation::Authority;
use crate::error::ExecutionError;
use crate::pipeline::ingest_lead;

use super::ApprovalGate;

/// The event type that records a gate's effect on the timeline.
/// `message_sent` gates are recorded by dispatch, the rest by the engine.
pub fn recorded_event(gate_type: GateType) -> EventType {
    match gate_type {
        GateType::PaymentLink | GateType::BulkSend | GateType::OutboundMessage => {
            EventType::MessageSent
        }
        GateType::SitePublish => EventType::SitePublished,
        GateType::Refund => EventType::RefundIssued,
        GateType::SubscriptionCancel => EventType::SubscriptionCancelled,
        GateType::StatusChange | GateType::LeadDeletion => EventType::StatusChanged,
        GateType::ExternalImport => EventType::LeadImported,
        GateType::PricingOverride => EventType::PricingOverridden,
    }
}

pub(crate) async fn execute(gate: &ApprovalGate, approval: &Approval) -> Result<(), ExecutionError> {
    debug!(approval_id = %approval.id, gate_type = %approval.gate_type, "Executing approval");
    match approval.gate_type {
        GateType::PaymentLink => payment_link(gate, approval).await,
        GateType::SitePublish => site_publish(gate, approval),
        GateType::Refund => refund(gate, approval).await,
        GateType::SubscriptionCancel => subscription_cancel(gate, approval).await,
        GateType::BulkSend => bulk_send(gate, approval).await,
        GateType::OutboundMessage => outbound_message(gate, approval).await,
        GateType::StatusChange => status_change(gate, approval),
        GateType::ExternalImport => external_import(gate, approval),
        GateType::LeadDeletion => lead_deletion(gate, approval),
        GateType::PricingOverride => pricing_override(gate, approval),
    }
}

// =============================================================================
// Dispatching gates
// =============================================================================

async fn payment_link(gate: &ApprovalGate, approval: &Approval) -> Result<(), ExecutionError> {
    let lead = require_lead(gate, approval)?;
    let url = approval
        .metadata_str("payment_url")
        .ok_or_else(|| missing_metadata("payment_url"))?;
    let content = match &approval.draft_content {
        Some(draft) if draft.contains(url) => draft.clone(),
        Some(draft) => format!("{}\n\n{}", draft, url),
        None => format!("Here is your secure payment link: {}", url),
    };
    send_to_lead(gate, approval, &lead, &content).await?;
    gate.conversation.transition_if_at(
        lead.id,
        ConversationStage::PaymentPendingApproval,
        ConversationStage::PaymentSent,
        Authority::ApprovedGate(approval.id),
    )?;
    Ok(())
}

async fn outbound_message(gate: &ApprovalGate, approval: &Approval) -> Result<(), ExecutionError> {
    let lead = require_lead(gate, approval)?;
    let content = approval
        .draft_content
        .as_deref()
        .ok_or_else(|| ExecutionError::InvalidMetadata("no draft content to send".to_string()))?;
    send_to_lead(gate, approval, &lead, content).await?;
    gate.conversation.transition_if_at(
        lead.id,
        ConversationStage::PreviewPendingApproval,
        ConversationStage::PreviewSent,
        Authority::ApprovedGate(approval.id),
    )?;

    if let Some(raw) = approval.metadata_str("resume_stage") {
        let stage: PipelineStage = raw.parse().map_err(ExecutionError::InvalidMetadata)?;
        if gate.store.runs.get(lead.id, stage)?.is_none() {
            gate.queue.enqueue_at_offset(lead.id, stage)?;
            info!(lead_id = %lead.id, stage = %stage, "Pipeline resumed after approval");
        }
    }
    Ok(())
}

async fn bulk_send(gate: &ApprovalGate, approval: &Approval) -> Result<(), ExecutionError> {
    let lead_ids = metadata_uuids(approval, "lead_ids")?;
    let template = approval
        .draft_content
        .as_deref()
        .or_else(|| approval.metadata_str("content"))
        .ok_or_else(|| missing_metadata("content"))?;

    let mut failures = Vec::new();
    for lead_id in &lead_ids {
        let lead = match gate.store.leads.get(*lead_id)? {
            Some(lead) => lead,
            None => {
                failures.push(format!("{}: lead not found", lead_id));
                continue;
            }
        };
        let Some(destination) = lead.contact_destination() else {
            failures.push(format!("{}: no contact destination", lead_id));
            continue;
        };
        let content = render_template(template, &lead);
        let correlation_ref = format!("{}/{}", approval.id, lead.id);
        if let Err(e) = gate
            .dispatch
            .send(lead.id, &destination, &content, &correlation_ref)
            .await
        {
            failures.push(format!("{}: {}", lead_id, e));
        }
    }

    if failures.is_empty() {
        info!(approval_id = %approval.id, recipients = lead_ids.len(), "Bulk send complete");
        Ok(())
    } else {
        Err(ExecutionError::Delivery(format!(
            "{} of {} sends failed: {}",
            failures.len(),
            lead_ids.len(),
            failures.join("; ")
        )))
    }
}

async fn send_to_lead(
    gate: &ApprovalGate,
    approval: &Approval,
    lead: &Lead,
    content: &str,
) -> Result<Delivery, ExecutionError> {
    let destination = lead.contact_destination().ok_or_else(|| {
        ExecutionError::Delivery(format!("lead {} has no contact destination", lead.id))
    })?;
    gate.dispatch
        .send(lead.id, &destination, content, &approval.id.to_string())
        .await
}

/// Fill `{{name}}`, `{{first_name}}` and `{{company}}` from the lead.
pub fn render_template(template: &str, lead: &Lead) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let pattern = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*(name|first_name|company)\s*\}\}").expect("placeholder pattern is valid")
    });
    pattern
        .replace_all(template, |caps: &regex::Captures<'_>| match &caps[1] {
            "name" => lead.name.clone(),
            "first_name" => lead
                .name
                .split_whitespace()
                .next()
                .unwrap_or(&lead.name)
                .to_string(),
            _ => lead.company.clone(),
        })
        .into_owned()
}

// =============================================================================
// Engine-recorded gates
// =============================================================================

fn site_publish(gate: &ApprovalGate, approval: &Approval) -> Result<(), ExecutionError> {
    let lead = require_lead(gate, approval)?;
    if already_recorded(gate, approval)? {
        return Ok(());
    }
    gate.store.modify_lead(lead.id, |l| l.site_live = true)?;
    gate.conversation.transition_if_at(
        lead.id,
        ConversationStage::Client,
        ConversationStage::Live,
        Authority::ApprovedGate(approval.id),
    )?;
    let mut event = engine_event(approval, lead.id);
    if let Some(url) = approval.metadata_str("site_url") {
        event = event.with_metadata("site_url", url);
    }
    gate.store.events.append(&event)?;
    info!(lead_id = %lead.id, "Site published");
    Ok(())
}

async fn refund(gate: &ApprovalGate, approval: &Approval) -> Result<(), ExecutionError> {
    let subject = subject_of(approval)?;
    if already_recorded(gate, approval)? {
        return Ok(());
    }
    let amount_cents = metadata_i64(approval, "amount_cents")?;
    if amount_cents <= 0 {
        return Err(ExecutionError::InvalidMetadata(format!(
            "amount_cents must be positive, got {}",
            amount_cents
        )));
    }
    let payment_ref = approval.metadata_str("payment_ref");
    let refund_ref = with_timeout(
        gate.timeout,
        gate.payments.refund(subject, amount_cents, payment_ref),
    )
    .await?;
    let event = engine_event(approval, subject)
        .with_metadata("amount_cents", amount_cents)
        .with_metadata("refund_ref", refund_ref);
    gate.store.events.append(&event)?;
    info!(subject_id = %subject, amount_cents, "Refund issued");
    Ok(())
}

async fn subscription_cancel(gate: &ApprovalGate, approval: &Approval) -> Result<(), ExecutionError> {
    let subject = subject_of(approval)?;
    if already_recorded(gate, approval)? {
        return Ok(());
    }
    with_timeout(
        gate.timeout,
        gate.payments
            .cancel_subscription(subject, approval.metadata_str("subscription_ref")),
    )
    .await?;
    if let Some(lead_id) = approval.lead_id {
        close_lead(gate, approval, lead_id)?;
    }
    gate.store.events.append(&engine_event(approval, subject))?;
    info!(subject_id = %subject, "Subscription cancelled");
    Ok(())
}

fn status_change(gate: &ApprovalGate, approval: &Approval) -> Result<(), ExecutionError> {
    let lead = require_lead(gate, approval)?;
    if already_recorded(gate, approval)? {
        return Ok(());
    }
    let raw = approval
        .metadata_str("status")
        .ok_or_else(|| missing_metadata("status"))?;
    let status: LeadStatus = raw.parse().map_err(ExecutionError::InvalidMetadata)?;

    let from = lead.status;
    gate.store.modify_lead(lead.id, |l| l.status = status)?;
    match status {
        LeadStatus::Closed => {
            gate.conversation
                .close(lead.id, Authority::ApprovedGate(approval.id))?;
        }
        LeadStatus::Client => {
            gate.conversation.transition_if_at(
                lead.id,
                ConversationStage::PaymentSent,
                ConversationStage::Client,
                Authority::ApprovedGate(approval.id),
            )?;
        }
        LeadStatus::Created | LeadStatus::Enriched | LeadStatus::Distributed => {}
    }
    let event = engine_event(approval, lead.id)
        .with_metadata("from", from.as_str())
        .with_metadata("to", status.as_str());
    gate.store.events.append(&event)?;
    info!(lead_id = %lead.id, %from, to = %status, "Lead status changed");
    Ok(())
}

fn lead_deletion(gate: &ApprovalGate, approval: &Approval) -> Result<(), ExecutionError> {
    let lead = require_lead(gate, approval)?;
    if already_recorded(gate, approval)? {
        return Ok(());
    }
    close_lead(gate, approval, lead.id)?;
    let event = engine_event(approval, lead.id)
        .with_metadata("from", lead.status.as_str())
        .with_metadata("to", LeadStatus::Closed.as_str())
        .with_metadata("reason", "deleted");
    gate.store.events.append(&event)?;
    info!(lead_id = %lead.id, "Lead closed on deletion request");
    Ok(())
}

fn pricing_override(gate: &ApprovalGate, approval: &Approval) -> Result<(), ExecutionError> {
    let lead = require_lead(gate, approval)?;
    if already_recorded(gate, approval)? {
        return Ok(());
    }
    let price_cents = metadata_i64(approval, "price_cents")?;
    if price_cents < 0 {
        return Err(ExecutionError::InvalidMetadata(format!(
            "price_cents must not be negative, got {}",
            price_cents
        )));
    }
    gate.store
        .modify_lead(lead.id, |l| l.pricing_override_cents = Some(price_cents))?;
    let event = engine_event(approval, lead.id)
        .with_metadata("price_cents", price_cents)
        .with_metadata("previous_cents", lead.pricing_override_cents);
    gate.store.events.append(&event)?;
    info!(lead_id = %lead.id, price_cents, "Pricing overridden");
    Ok(())
}

/// Ingest every lead listed under `leads`. Each entry is recorded with its
/// own event, so a re-run only retries the entries that failed.
fn external_import(gate: &ApprovalGate, approval: &Approval) -> Result<(), ExecutionError> {
    let entries = approval
        .metadata
        .get("leads")
        .and_then(|v| v.as_array())
        .ok_or_else(|| missing_metadata("leads"))?;

    let mut imported = 0;
    let mut rejected = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let dedupe_key = format!("{}:import:{}", approval.id, index);
        if gate.store.events.has_dedupe_key(&dedupe_key)? {
            continue;
        }
        let input: NewLead = match serde_json::from_value(entry.clone()) {
            Ok(input) => input,
            Err(e) => {
                rejected.push(format!("#{}: {}", index, e));
                continue;
            }
        };
        match ingest_lead(&gate.store, &gate.queue, input) {
            Ok(lead) => {
                let event = Event::new(lead.id, EventType::LeadImported, Timestamp::now())
                    .with_metadata("approval_id", approval.id.to_string())
                    .with_metadata("index", index as u64)
                    .with_dedupe_key(dedupe_key);
                gate.store.events.append(&event)?;
                imported += 1;
            }
            Err(e) => rejected.push(format!("#{}: {}", index, e)),
        }
    }

    info!(approval_id = %approval.id, imported, rejected = rejected.len(), "Import executed");
    if rejected.is_empty() {
        Ok(())
    } else {
        Err(ExecutionError::InvalidMetadata(format!(
            "{} of {} leads rejected: {}",
            rejected.len(),
            entries.len(),
            rejected.join("; ")
        )))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn close_lead(gate: &ApprovalGate, approval: &Approval, lead_id: Uuid) -> Result<(), ExecutionError> {
    gate.store
        .modify_lead(lead_id, |l| l.status = LeadStatus::Closed)?;
    gate.conversation
        .close(lead_id, Authority::ApprovedGate(approval.id))?;
    Ok(())
}

fn require_lead(gate: &ApprovalGate, approval: &Approval) -> Result<Lead, ExecutionError> {
    let lead_id = approval
        .lead_id
        .ok_or_else(|| ExecutionError::InvalidMetadata("approval has no lead".to_string()))?;
    gate.store
        .leads
        .get(lead_id)?
        .ok_or(ExecutionError::LeadNotFound(lead_id))
}

fn subject_of(approval: &Approval) -> Result<Uuid, ExecutionError> {
    approval
        .lead_id
        .or(approval.client_id)
        .ok_or_else(|| ExecutionError::InvalidMetadata("approval has no lead or client".to_string()))
}

fn engine_event(approval: &Approval, subject: Uuid) -> Event {
    let event_type = recorded_event(approval.gate_type);
    Event::new(subject, event_type, Timestamp::now())
        .with_metadata("approval_id", approval.id.to_string())
        .with_dedupe_key(format!("{}:{}", approval.id, event_type))
}

fn already_recorded(gate: &ApprovalGate, approval: &Approval) -> Result<bool, ExecutionError> {
    let key = format!("{}:{}", approval.id, recorded_event(approval.gate_type));
    let recorded = gate.store.events.has_dedupe_key(&key)?;
    if recorded {
        debug!(approval_id = %approval.id, "Approval effect already recorded");
    }
    Ok(recorded)
}

fn missing_metadata(key: &str) -> ExecutionError {
    ExecutionError::InvalidMetadata(format!("{} is required", key))
}

fn metadata_i64(approval: &Approval, key: &str) -> Result<i64, ExecutionError> {
    let value = approval
        .metadata
        .get(key)
        .ok_or_else(|| missing_metadata(key))?;
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| ExecutionError::InvalidMetadata(format!("{} must be an integer", key)))
}

fn metadata_uuids(approval: &Approval, key: &str) -> Result<Vec<Uuid>, ExecutionError> {
    let values = approval
        .metadata
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| missing_metadata(key))?;
    let ids = values
        .iter()
        .map(|v| {
            v.as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| ExecutionError::InvalidMetadata(format!("{}: invalid id {}", key, v)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if ids.is_empty() {
        return Err(ExecutionError::InvalidMetadata(format!("{} is empty", key)));
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::collaborator::mock::{MockDispatch, MockPayments};
    use crate::collaborator::RecordedDispatch;
    use crate::conversation::ConversationStageMachine;
    use crate::gate::ApprovalRequest;
    use crate::pipeline::StageQueue;
    use crate::store::Store;
    use leadflow_core::types::{Decision, StageRunStatus};
    use leadflow_storage::Database;
    use serde_json::json;

    struct Harness {
        gate: ApprovalGate,
        store: Store,
        dispatch: Arc<MockDispatch>,
        payments: Arc<MockPayments>,
    }

    fn harness() -> Harness {
        let store = Store::new(Arc::new(Database::in_memory().unwrap()));
        let dispatch = Arc::new(MockDispatch::new());
        let payments = Arc::new(MockPayments::new());
        let conversation = Arc::new(ConversationStageMachine::new(Arc::clone(&store.leads)));
        let queue = Arc::new(StageQueue::new(
            Arc::clone(&store.leads),
            Arc::clone(&store.runs),
            Duration::ZERO,
        ));
        let gate = ApprovalGate::new(
            store.clone(),
            conversation,
            queue,
            payments.clone(),
            RecordedDispatch::new(
                dispatch.clone(),
                Arc::clone(&store.events),
                Duration::from_secs(1),
            ),
            Duration::from_secs(1),
        );
        Harness {
            gate,
            store,
            dispatch,
            payments,
        }
    }

    fn insert_lead(store: &Store, name: &str, stage: ConversationStage) -> Lead {
        let mut lead = Lead::from_new(
            NewLead {
                name: name.to_string(),
                company: format!("{} Co", name),
                email: Some(format!("{}@example.test", name.to_lowercase().replace(' ', "."))),
                ..NewLead::default()
            },
            Timestamp::now(),
        );
        lead.conversation_stage = stage;
        store.leads.insert(&lead).unwrap();
        lead
    }

    async fn approve(h: &Harness, request: ApprovalRequest) -> Approval {
        let id = h.gate.request_approval(request).await.unwrap();
        h.gate
            .resolve(id, Decision::Approve, "sam", None, None)
            .await
            .unwrap()
    }

    #[test]
    fn test_recorded_event_table_is_total() {
        for gate in GateType::ALL {
            assert!(!recorded_event(gate).is_inbound(), "{}", gate);
        }
        assert_eq!(recorded_event(GateType::LeadDeletion), EventType::StatusChanged);
    }

    #[test]
    fn test_render_template() {
        let lead = Lead::from_new(
            NewLead {
                name: "Dana Ruiz".to_string(),
                company: "Ruiz Plumbing".to_string(),
                ..NewLead::default()
            },
            Timestamp(0),
        );
        assert_eq!(
            render_template("Hi {{first_name}} ({{ name }}) at {{company}}, {{other}}", &lead),
            "Hi Dana (Dana Ruiz) at Ruiz Plumbing, {{other}}"
        );
    }

    #[tokio::test]
    async fn test_payment_link_uses_overridden_url() {
        let h = harness();
        let lead = insert_lead(&h.store, "Dana", ConversationStage::PreviewSent);
        let id = h
            .gate
            .request_approval(
                ApprovalRequest::new(GateType::PaymentLink, "Send link")
                    .for_lead(lead.id)
                    .with_metadata("payment_url", "https://pay.test/original"),
            )
            .await
            .unwrap();
        assert_eq!(h.payments.links_created(), 0);

        let mut overrides = leadflow_core::types::Metadata::new();
        overrides.insert("payment_url".to_string(), json!("https://pay.test/discounted"));
        let approval = h
            .gate
            .resolve(id, Decision::Approve, "sam", None, Some(overrides))
            .await
            .unwrap();

        assert_eq!(
            approval.metadata_str("payment_url"),
            Some("https://pay.test/discounted")
        );
        let sent = h.dispatch.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].content.contains("https://pay.test/discounted"));
        assert_eq!(
            h.store.leads.require(lead.id).unwrap().conversation_stage,
            ConversationStage::PaymentSent
        );
    }

    #[tokio::test]
    async fn test_site_publish_goes_live_once() {
        let h = harness();
        let lead = insert_lead(&h.store, "Dana", ConversationStage::Client);
        let approval = approve(
            &h,
            ApprovalRequest::new(GateType::SitePublish, "Publish").for_lead(lead.id),
        )
        .await;
        h.gate.redeliver(approval.id).await.unwrap();

        let stored = h.store.leads.require(lead.id).unwrap();
        assert!(stored.site_live);
        assert_eq!(stored.conversation_stage, ConversationStage::Live);
        assert_eq!(
            h.store
                .events
                .count_for_subject(lead.id, EventType::SitePublished)
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_refund_requires_amount_and_is_not_repeated() {
        let h = harness();
        let client = Uuid::new_v4();
        let failed = approve(
            &h,
            ApprovalRequest::new(GateType::Refund, "Refund").for_client(client),
        )
        .await;
        assert!(failed.execution_error.unwrap().contains("amount_cents"));
        assert!(h.payments.refunds().is_empty());

        let approval = approve(
            &h,
            ApprovalRequest::new(GateType::Refund, "Refund")
                .for_client(client)
                .with_metadata("amount_cents", 4_900)
                .with_metadata("payment_ref", "pi_123"),
        )
        .await;
        assert!(approval.execution_error.is_none());
        h.gate.redeliver(approval.id).await.unwrap();

        let refunds = h.payments.refunds();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount_cents, 4_900);
        assert_eq!(refunds[0].payment_ref.as_deref(), Some("pi_123"));
        assert_eq!(
            h.store
                .events
                .count_for_subject(client, EventType::RefundIssued)
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_subscription_cancel_closes_lead() {
        let h = harness();
        let lead = insert_lead(&h.store, "Dana", ConversationStage::Live);
        approve(
            &h,
            ApprovalRequest::new(GateType::SubscriptionCancel, "Cancel").for_lead(lead.id),
        )
        .await;

        let stored = h.store.leads.require(lead.id).unwrap();
        assert_eq!(stored.status, LeadStatus::Closed);
        assert_eq!(stored.conversation_stage, ConversationStage::ClosedLost);
        assert_eq!(h.payments.cancellations(), vec![lead.id]);
    }

    #[tokio::test]
    async fn test_bulk_send_renders_per_lead_and_reports_failures() {
        let h = harness();
        let a = insert_lead(&h.store, "Dana Ruiz", ConversationStage::PreviewSent);
        let b = insert_lead(&h.store, "Lee Park", ConversationStage::PreviewSent);
        let missing = Uuid::new_v4();

        let approval = approve(
            &h,
            ApprovalRequest::new(GateType::BulkSend, "Spring promo")
                .with_draft("Hi {{first_name}}, spring deals for {{company}}")
                .with_metadata(
                    "lead_ids",
                    json!([a.id.to_string(), b.id.to_string(), missing.to_string()]),
                ),
        )
        .await;

        let sent = h.dispatch.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].content, "Hi Dana, spring deals for Dana Ruiz Co");
        assert_eq!(sent[1].content, "Hi Lee, spring deals for Lee Park Co");
        assert!(approval
            .execution_error
            .unwrap()
            .starts_with("Delivery failed: 1 of 3 sends failed"));

        h.gate.redeliver(approval.id).await.unwrap();
        assert_eq!(h.dispatch.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_outbound_message_resumes_pipeline() {
        let h = harness();
        let lead = insert_lead(&h.store, "Dana", ConversationStage::PreviewPendingApproval);
        approve(
            &h,
            ApprovalRequest::new(GateType::OutboundMessage, "Send preview")
                .for_lead(lead.id)
                .with_draft("Hi Dana")
                .with_metadata("resume_stage", "distribution"),
        )
        .await;

        let run = h
            .store
            .runs
            .get(lead.id, PipelineStage::Distribution)
            .unwrap()
            .unwrap();
        assert_eq!(run.status, StageRunStatus::Scheduled);
        assert_eq!(
            h.store.leads.require(lead.id).unwrap().conversation_stage,
            ConversationStage::PreviewSent
        );
    }

    #[tokio::test]
    async fn test_status_change_to_closed_and_client() {
        let h = harness();
        let closing = insert_lead(&h.store, "Dana", ConversationStage::PreviewSent);
        approve(
            &h,
            ApprovalRequest::new(GateType::StatusChange, "Close")
                .for_lead(closing.id)
                .with_metadata("status", "closed"),
        )
        .await;
        assert_eq!(
            h.store.leads.require(closing.id).unwrap().conversation_stage,
            ConversationStage::ClosedLost
        );

        let paying = insert_lead(&h.store, "Lee", ConversationStage::PaymentSent);
        approve(
            &h,
            ApprovalRequest::new(GateType::StatusChange, "Won")
                .for_lead(paying.id)
                .with_metadata("status", "client"),
        )
        .await;
        let stored = h.store.leads.require(paying.id).unwrap();
        assert_eq!(stored.status, LeadStatus::Client);
        assert_eq!(stored.conversation_stage, ConversationStage::Client);

        let events = h.store.events.list_for_subject(paying.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::StatusChanged);
        assert_eq!(events[0].metadata["to"], "client");
    }

    #[tokio::test]
    async fn test_status_change_rejects_unknown_status() {
        let h = harness();
        let lead = insert_lead(&h.store, "Dana", ConversationStage::New);
        let approval = approve(
            &h,
            ApprovalRequest::new(GateType::StatusChange, "Bad")
                .for_lead(lead.id)
                .with_metadata("status", "archived"),
        )
        .await;
        assert!(approval.execution_error.is_some());
        assert_eq!(
            h.store.leads.require(lead.id).unwrap().status,
            LeadStatus::Created
        );
    }

    #[tokio::test]
    async fn test_lead_deletion_closes_without_removing() {
        let h = harness();
        let lead = insert_lead(&h.store, "Dana", ConversationStage::Qualified);
        approve(
            &h,
            ApprovalRequest::new(GateType::LeadDeletion, "Delete").for_lead(lead.id),
        )
        .await;

        let stored = h.store.leads.require(lead.id).unwrap();
        assert_eq!(stored.status, LeadStatus::Closed);
        assert_eq!(stored.conversation_stage, ConversationStage::ClosedLost);
        let events = h.store.events.list_for_subject(lead.id).unwrap();
        assert_eq!(events[0].metadata["reason"], "deleted");
    }

    #[tokio::test]
    async fn test_pricing_override() {
        let h = harness();
        let lead = insert_lead(&h.store, "Dana", ConversationStage::PreviewSent);
        approve(
            &h,
            ApprovalRequest::new(GateType::PricingOverride, "Discount")
                .for_lead(lead.id)
                .with_metadata("price_cents", 2_500),
        )
        .await;
        assert_eq!(
            h.store.leads.require(lead.id).unwrap().pricing_override_cents,
            Some(2_500)
        );
        assert_eq!(
            h.store
                .events
                .count_for_subject(lead.id, EventType::PricingOverridden)
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_external_import_ingests_and_retries_only_rejects() {
        let h = harness();
        let approval = approve(
            &h,
            ApprovalRequest::new(GateType::ExternalImport, "Import").with_metadata(
                "leads",
                json!([
                    {"name": "Dana", "company": "Ruiz Plumbing", "phone": "555-010-2030"},
                    {"name": "Lee", "company": ""},
                ]),
            ),
        )
        .await;
        assert!(approval
            .execution_error
            .unwrap()
            .contains("1 of 2 leads rejected"));
        assert_eq!(h.store.leads.count().unwrap(), 1);

        h.gate.redeliver(approval.id).await.unwrap();
        assert_eq!(h.store.leads.count().unwrap(), 1);
        assert_eq!(h.store.runs.count_by_status(StageRunStatus::Scheduled).unwrap(), 1);
    }
}
