//! Interaction events recorded on a lead's or client's timeline.
//!
//! Events are immutable facts. The timeline is append-only and is the single
//! source of truth for engagement scoring.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Metadata, Timestamp};

/// Closed set of timeline event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Outbound touches. Written by the dispatch layer only.
    MessageSent,
    MessageDeliveryFailed,
    CallPlaced,

    // Inbound engagement.
    MessageOpened,
    MessageReplied,
    PositiveReply,
    CallConnected,
    PreviewViewed,
    PreviewCtaClicked,
    PricingViewed,
    PaymentLinkOpened,
    PaymentCompleted,

    // Gate outcomes. Written by the approval gate engine only.
    ApprovalDenied,
    SitePublished,
    RefundIssued,
    SubscriptionCancelled,
    StatusChanged,
    LeadImported,
    PricingOverridden,
}

impl EventType {
    pub const ALL: [EventType; 19] = [
        EventType::MessageSent,
        EventType::MessageDeliveryFailed,
        EventType::CallPlaced,
        EventType::MessageOpened,
        EventType::MessageReplied,
        EventType::PositiveReply,
        EventType::CallConnected,
        EventType::PreviewViewed,
        EventType::PreviewCtaClicked,
        EventType::PricingViewed,
        EventType::PaymentLinkOpened,
        EventType::PaymentCompleted,
        EventType::ApprovalDenied,
        EventType::SitePublished,
        EventType::RefundIssued,
        EventType::SubscriptionCancelled,
        EventType::StatusChanged,
        EventType::LeadImported,
        EventType::PricingOverridden,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MessageSent => "message_sent",
            EventType::MessageDeliveryFailed => "message_delivery_failed",
            EventType::CallPlaced => "call_placed",
            EventType::MessageOpened => "message_opened",
            EventType::MessageReplied => "message_replied",
            EventType::PositiveReply => "positive_reply",
            EventType::CallConnected => "call_connected",
            EventType::PreviewViewed => "preview_viewed",
            EventType::PreviewCtaClicked => "preview_cta_clicked",
            EventType::PricingViewed => "pricing_viewed",
            EventType::PaymentLinkOpened => "payment_link_opened",
            EventType::PaymentCompleted => "payment_completed",
            EventType::ApprovalDenied => "approval_denied",
            EventType::SitePublished => "site_published",
            EventType::RefundIssued => "refund_issued",
            EventType::SubscriptionCancelled => "subscription_cancelled",
            EventType::StatusChanged => "status_changed",
            EventType::LeadImported => "lead_imported",
            EventType::PricingOverridden => "pricing_overridden",
        }
    }

    /// Outbound touches feed the recency component of the engagement score.
    pub fn is_outbound_touch(&self) -> bool {
        matches!(self, EventType::MessageSent | EventType::CallPlaced)
    }

    /// Events that external channels (webhooks, trackers, the voice dialer)
    /// report. Everything else has a single internal writer: message sends
    /// belong to the dispatch layer, gate outcomes to the approval engine.
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            EventType::CallPlaced
                | EventType::MessageOpened
                | EventType::MessageReplied
                | EventType::PositiveReply
                | EventType::CallConnected
                | EventType::PreviewViewed
                | EventType::PreviewCtaClicked
                | EventType::PricingViewed
                | EventType::PaymentLinkOpened
                | EventType::PaymentCompleted
        )
    }

    /// Events an operator should be notified about.
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            EventType::ApprovalDenied
                | EventType::MessageDeliveryFailed
                | EventType::PositiveReply
                | EventType::PaymentCompleted
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown event type: {}", s))
    }
}

/// An immutable timeline entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Lead or client the event belongs to.
    pub subject_id: Uuid,
    pub event_type: EventType,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub metadata: Metadata,
    /// When set, at most one event with this key is ever stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

impl Event {
    pub fn new(subject_id: Uuid, event_type: EventType, timestamp: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id,
            event_type,
            timestamp,
            metadata: Metadata::new(),
            dedupe_key: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}
