//! Compensating conversation transitions applied when an approval is denied.

use leadflow_core::types::{ConversationStage, GateType};

/// The `(from, to)` backward move a denial of `gate_type` applies, if any.
/// Applied only when the lead is still at `from`.
pub fn compensation(gate_type: GateType) -> Option<(ConversationStage, ConversationStage)> {
    match gate_type {
        GateType::OutboundMessage => Some((
            ConversationStage::PreviewPendingApproval,
            ConversationStage::PreviewEditing,
        )),
        GateType::PaymentLink => Some((
            ConversationStage::PaymentPendingApproval,
            ConversationStage::PreviewSent,
        )),
        GateType::SitePublish
        | GateType::Refund
        | GateType::SubscriptionCancel
        | GateType::BulkSend
        | GateType::StatusChange
        | GateType::ExternalImport
        | GateType::LeadDeletion
        | GateType::PricingOverride => None,
    }
}
