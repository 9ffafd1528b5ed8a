use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LeadflowError, Result};

/// Free-form JSON object attached to approvals and events.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Enums
// =============================================================================

/// Commercial status of a lead. `Closed` is terminal; leads are never removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Created,
    Enriched,
    Distributed,
    Client,
    Closed,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Created => "created",
            LeadStatus::Enriched => "enriched",
            LeadStatus::Distributed => "distributed",
            LeadStatus::Client => "client",
            LeadStatus::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStatus::Closed)
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LeadStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(LeadStatus::Created),
            "enriched" => Ok(LeadStatus::Enriched),
            "distributed" => Ok(LeadStatus::Distributed),
            "client" => Ok(LeadStatus::Client),
            "closed" => Ok(LeadStatus::Closed),
            _ => Err(format!("Unknown lead status: {}", s)),
        }
    }
}

/// Work priority tier. Ordered so that `Urgent` sorts highest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl PriorityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::Low => "low",
            PriorityTier::Normal => "normal",
            PriorityTier::High => "high",
            PriorityTier::Urgent => "urgent",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PriorityTier {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(PriorityTier::Low),
            "normal" => Ok(PriorityTier::Normal),
            "high" => Ok(PriorityTier::High),
            "urgent" => Ok(PriorityTier::Urgent),
            _ => Err(format!("Unknown priority tier: {}", s)),
        }
    }
}

/// Human-facing milestone of the outreach conversation with a lead.
///
/// Distinct from [`PipelineStage`]: the pipeline stage says which unit of
/// production work runs next, the conversation stage says what the lead has
/// actually been shown or sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStage {
    New,
    Qualified,
    /// Preview was rejected by an operator and is being reworked.
    PreviewEditing,
    PreviewPendingApproval,
    PreviewSent,
    PaymentPendingApproval,
    PaymentSent,
    Client,
    Live,
    ClosedLost,
}

impl ConversationStage {
    pub const ALL: [ConversationStage; 10] = [
        ConversationStage::New,
        ConversationStage::Qualified,
        ConversationStage::PreviewEditing,
        ConversationStage::PreviewPendingApproval,
        ConversationStage::PreviewSent,
        ConversationStage::PaymentPendingApproval,
        ConversationStage::PaymentSent,
        ConversationStage::Client,
        ConversationStage::Live,
        ConversationStage::ClosedLost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStage::New => "new",
            ConversationStage::Qualified => "qualified",
            ConversationStage::PreviewEditing => "preview_editing",
            ConversationStage::PreviewPendingApproval => "preview_pending_approval",
            ConversationStage::PreviewSent => "preview_sent",
            ConversationStage::PaymentPendingApproval => "payment_pending_approval",
            ConversationStage::PaymentSent => "payment_sent",
            ConversationStage::Client => "client",
            ConversationStage::Live => "live",
            ConversationStage::ClosedLost => "closed_lost",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConversationStage::ClosedLost)
    }
}

impl fmt::Display for ConversationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConversationStage {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ConversationStage::ALL
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown conversation stage: {}", s))
    }
}

/// The fixed, ordered conversion pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Enrichment,
    ArtifactGeneration,
    Personalization,
    MessageDrafting,
    Distribution,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 5] = [
        PipelineStage::Enrichment,
        PipelineStage::ArtifactGeneration,
        PipelineStage::Personalization,
        PipelineStage::MessageDrafting,
        PipelineStage::Distribution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Enrichment => "enrichment",
            PipelineStage::ArtifactGeneration => "artifact_generation",
            PipelineStage::Personalization => "personalization",
            PipelineStage::MessageDrafting => "message_drafting",
            PipelineStage::Distribution => "distribution",
        }
    }

    /// Offset from lead creation, in pipeline time units.
    pub fn offset_units(&self) -> u64 {
        match self {
            PipelineStage::Enrichment => 0,
            PipelineStage::ArtifactGeneration => 5,
            PipelineStage::Personalization => 10,
            PipelineStage::MessageDrafting => 15,
            PipelineStage::Distribution => 20,
        }
    }

    /// The stage that follows this one, or `None` after distribution.
    pub fn next(&self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Enrichment => Some(PipelineStage::ArtifactGeneration),
            PipelineStage::ArtifactGeneration => Some(PipelineStage::Personalization),
            PipelineStage::Personalization => Some(PipelineStage::MessageDrafting),
            PipelineStage::MessageDrafting => Some(PipelineStage::Distribution),
            PipelineStage::Distribution => None,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineStage {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        PipelineStage::ALL
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown pipeline stage: {}", s))
    }
}

/// Scheduler state of one (lead, stage) run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRunStatus {
    Scheduled,
    Running,
    Succeeded,
    Failed,
    AwaitingApproval,
}

impl StageRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageRunStatus::Scheduled => "scheduled",
            StageRunStatus::Running => "running",
            StageRunStatus::Succeeded => "succeeded",
            StageRunStatus::Failed => "failed",
            StageRunStatus::AwaitingApproval => "awaiting_approval",
        }
    }
}

impl fmt::Display for StageRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageRunStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(StageRunStatus::Scheduled),
            "running" => Ok(StageRunStatus::Running),
            "succeeded" => Ok(StageRunStatus::Succeeded),
            "failed" => Ok(StageRunStatus::Failed),
            "awaiting_approval" => Ok(StageRunStatus::AwaitingApproval),
            _ => Err(format!("Unknown stage run status: {}", s)),
        }
    }
}

/// Closed set of actions that must wait for a human decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    PaymentLink,
    SitePublish,
    Refund,
    SubscriptionCancel,
    BulkSend,
    OutboundMessage,
    StatusChange,
    ExternalImport,
    LeadDeletion,
    PricingOverride,
}

impl GateType {
    pub const ALL: [GateType; 10] = [
        GateType::PaymentLink,
        GateType::SitePublish,
        GateType::Refund,
        GateType::SubscriptionCancel,
        GateType::BulkSend,
        GateType::OutboundMessage,
        GateType::StatusChange,
        GateType::ExternalImport,
        GateType::LeadDeletion,
        GateType::PricingOverride,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GateType::PaymentLink => "payment_link",
            GateType::SitePublish => "site_publish",
            GateType::Refund => "refund",
            GateType::SubscriptionCancel => "subscription_cancel",
            GateType::BulkSend => "bulk_send",
            GateType::OutboundMessage => "outbound_message",
            GateType::StatusChange => "status_change",
            GateType::ExternalImport => "external_import",
            GateType::LeadDeletion => "lead_deletion",
            GateType::PricingOverride => "pricing_override",
        }
    }
}

impl fmt::Display for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GateType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        GateType::ALL
            .iter()
            .find(|gate| gate.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown gate type: {}", s))
    }
}

/// Approval lifecycle. `Approved` and `Denied` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            _ => Err(format!("Unknown approval status: {}", s)),
        }
    }
}

/// An operator's decision on a pending approval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Deny,
}

impl Decision {
    pub fn resulting_status(&self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Deny => ApprovalStatus::Denied,
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Decision::Approve),
            "deny" => Ok(Decision::Deny),
            _ => Err(format!("Unknown decision: {}", s)),
        }
    }
}

/// Coarse engagement classification used to order follow-up work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Temperature {
    Cold,
    Warm,
    Hot,
}

impl Temperature {
    /// COLD <= 30, WARM 31..=70, HOT >= 71.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=30 => Temperature::Cold,
            31..=70 => Temperature::Warm,
            _ => Temperature::Hot,
        }
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Temperature::Cold => write!(f, "cold"),
            Temperature::Warm => write!(f, "warm"),
            Temperature::Hot => write!(f, "hot"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    Flat,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Up => write!(f, "up"),
            Trend::Down => write!(f, "down"),
            Trend::Flat => write!(f, "flat"),
        }
    }
}

// =============================================================================
// Newtype Wrappers - Time
// =============================================================================

/// Unix timestamp in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }

    pub fn plus_secs(&self, secs: i64) -> Self {
        Self(self.0.saturating_add(secs))
    }

    /// Whole days elapsed from `self` until `later`. Negative spans clamp to 0.
    pub fn days_until(&self, later: Timestamp) -> u32 {
        let elapsed = (later.0 - self.0).max(0);
        (elapsed / 86400) as u32
    }
}

// =============================================================================
// Domain Structs
// =============================================================================

/// Where an outbound message for a lead should go.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "address", rename_all = "snake_case")]
pub enum Destination {
    Sms(String),
    Email(String),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Sms(phone) => write!(f, "sms:{}", phone),
            Destination::Email(email) => write!(f, "email:{}", email),
        }
    }
}

/// Structured business metadata from enrichment. Every field is optional and
/// independently present or absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photos: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<String>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        *self == Enrichment::default()
    }

    /// Overlay the fields present in `other`; absent fields keep their value.
    pub fn merge(&mut self, other: Enrichment) {
        if other.category.is_some() {
            self.category = other.category;
        }
        if other.website.is_some() {
            self.website = other.website;
        }
        if other.address.is_some() {
            self.address = other.address;
        }
        if other.rating.is_some() {
            self.rating = other.rating;
        }
        if other.review_count.is_some() {
            self.review_count = other.review_count;
        }
        if other.photos.is_some() {
            self.photos = other.photos;
        }
        if other.hours.is_some() {
            self.hours = other.hours;
        }
    }
}

/// Reference to a generated preview site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub preview_id: String,
    pub url: String,
    pub expires_at: Timestamp,
}

impl ArtifactRef {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Personalization {
    pub opener: String,
    pub highlights: Vec<String>,
}

/// Cached output of the engagement scorer. Never authoritative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementScore {
    pub score: u8,
    pub temperature: Temperature,
    pub trend: Trend,
    pub computed_at: Timestamp,
}

/// Input for lead ingestion (scrape or inbound form).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewLead {
    pub name: String,
    pub company: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub priority: PriorityTier,
    #[serde(default)]
    pub owner: Option<String>,
}

impl NewLead {
    /// Validate and canonicalise identity fields.
    ///
    /// Name and company are required. Phone is reduced to digits with an
    /// optional leading `+`; email is lowercased and checked for shape.
    pub fn normalized(self) -> Result<NewLead> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(LeadflowError::validation("name", "must not be empty"));
        }
        let company = self.company.trim().to_string();
        if company.is_empty() {
            return Err(LeadflowError::validation("company", "must not be empty"));
        }
        let phone = match self.phone.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(normalize_phone(raw)?),
        };
        let email = match self.email.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(normalize_email(raw)?),
        };
        Ok(NewLead {
            name,
            company,
            phone,
            email,
            priority: self.priority,
            owner: self.owner,
        })
    }
}

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is valid")
    })
}

/// Reduce a phone number to `+?digits`. Fewer than 7 digits is malformed.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 || digits.len() > 15 {
        return Err(LeadflowError::validation(
            "phone",
            format!("expected 7-15 digits, got {}", digits.len()),
        ));
    }
    if trimmed.starts_with('+') {
        Ok(format!("+{}", digits))
    } else {
        Ok(digits)
    }
}

pub fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    if email_pattern().is_match(&email) {
        Ok(email)
    } else {
        Err(LeadflowError::validation("email", format!("malformed address: {}", raw)))
    }
}

/// A prospective business contact moving through the conversion pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub name: String,
    pub company: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub status: LeadStatus,
    pub priority: PriorityTier,
    pub owner: Option<String>,
    pub enrichment: Enrichment,
    pub artifact: Option<ArtifactRef>,
    pub personalization: Option<Personalization>,
    pub draft_message: Option<String>,
    pub engagement: Option<EngagementScore>,
    /// Stages whose last run failed; the operator-facing failure indicator.
    pub failed_stages: Vec<PipelineStage>,
    pub pricing_override_cents: Option<i64>,
    pub site_live: bool,
    pub conversation_stage: ConversationStage,
    pub version: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Lead {
    /// Build a fresh lead from already-normalised input.
    pub fn from_new(input: NewLead, now: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: input.name,
            company: input.company,
            phone: input.phone,
            email: input.email,
            status: LeadStatus::Created,
            priority: input.priority,
            owner: input.owner,
            enrichment: Enrichment::default(),
            artifact: None,
            personalization: None,
            draft_message: None,
            engagement: None,
            failed_stages: Vec::new(),
            pricing_override_cents: None,
            site_live: false,
            conversation_stage: ConversationStage::New,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Primary outbound destination: phone first, then email.
    pub fn contact_destination(&self) -> Option<Destination> {
        self.phone
            .clone()
            .map(Destination::Sms)
            .or_else(|| self.email.clone().map(Destination::Email))
    }

    pub fn flag_stage(&mut self, stage: PipelineStage) {
        if !self.failed_stages.contains(&stage) {
            self.failed_stages.push(stage);
        }
    }

    pub fn clear_stage_flag(&mut self, stage: PipelineStage) {
        self.failed_stages.retain(|s| *s != stage);
    }
}

/// A request to perform a gated action, pending or resolved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub gate_type: GateType,
    pub lead_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub priority: PriorityTier,
    pub description: String,
    pub draft_content: Option<String>,
    pub metadata: Metadata,
    pub status: ApprovalStatus,
    pub resolver: Option<String>,
    pub resolved_at: Option<Timestamp>,
    pub denial_reason: Option<String>,
    /// Last executor failure. Does not affect `status`.
    pub execution_error: Option<String>,
    pub created_at: Timestamp,
}

impl Approval {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Durable scheduler row for one (lead, stage) pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageRun {
    pub lead_id: Uuid,
    pub stage: PipelineStage,
    pub status: StageRunStatus,
    pub attempts: u32,
    /// Earliest execution time, Unix milliseconds.
    pub due_at_ms: i64,
    pub last_error: Option<String>,
    pub updated_at: Timestamp,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_boundaries() {
        assert_eq!(Temperature::from_score(0), Temperature::Cold);
        assert_eq!(Temperature::from_score(30), Temperature::Cold);
        assert_eq!(Temperature::from_score(31), Temperature::Warm);
        assert_eq!(Temperature::from_score(70), Temperature::Warm);
        assert_eq!(Temperature::from_score(71), Temperature::Hot);
        assert_eq!(Temperature::from_score(100), Temperature::Hot);
    }

    #[test]
    fn test_pipeline_offsets_strictly_increase() {
        let offsets: Vec<u64> = PipelineStage::ALL.iter().map(|s| s.offset_units()).collect();
        assert_eq!(offsets[0], 0);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_pipeline_next_walks_all_stages() {
        let mut stage = Some(PipelineStage::Enrichment);
        let mut seen = Vec::new();
        while let Some(s) = stage {
            seen.push(s);
            stage = s.next();
        }
        assert_eq!(seen, PipelineStage::ALL.to_vec());
    }

    #[test]
    fn test_gate_type_display_from_str_round_trip() {
        for gate in GateType::ALL {
            let parsed: GateType = gate.to_string().parse().unwrap();
            assert_eq!(gate, parsed);
        }
        assert!("wire_transfer".parse::<GateType>().is_err());
    }

    #[test]
    fn test_conversation_stage_display_from_str_round_trip() {
        for stage in ConversationStage::ALL {
            let parsed: ConversationStage = stage.to_string().parse().unwrap();
            assert_eq!(stage, parsed);
        }
    }

    #[test]
    fn test_conversation_stage_serde_json_format() {
        assert_eq!(
            serde_json::to_string(&ConversationStage::PreviewPendingApproval).unwrap(),
            "\"preview_pending_approval\""
        );
        assert_eq!(
            serde_json::to_string(&ConversationStage::ClosedLost).unwrap(),
            "\"closed_lost\""
        );
    }

    #[test]
    fn test_from_str_case_sensitive() {
        assert!("Created".parse::<LeadStatus>().is_err());
        assert!("PENDING".parse::<ApprovalStatus>().is_err());
        assert!("Enrichment".parse::<PipelineStage>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(PriorityTier::Urgent > PriorityTier::High);
        assert!(PriorityTier::High > PriorityTier::Normal);
        assert!(PriorityTier::Normal > PriorityTier::Low);
        assert_eq!(PriorityTier::default(), PriorityTier::Normal);
    }

    #[test]
    fn test_decision_resulting_status() {
        assert_eq!(Decision::Approve.resulting_status(), ApprovalStatus::Approved);
        assert_eq!(Decision::Deny.resulting_status(), ApprovalStatus::Denied);
        assert_eq!("deny".parse::<Decision>().unwrap(), Decision::Deny);
    }

    #[test]
    fn test_enrichment_merge_keeps_absent_fields() {
        let mut base = Enrichment {
            category: Some("bakery".to_string()),
            rating: Some(4.5),
            ..Enrichment::default()
        };
        base.merge(Enrichment {
            website: Some("https://crumbs.example".to_string()),
            rating: Some(4.8),
            ..Enrichment::default()
        });
        assert_eq!(base.category.as_deref(), Some("bakery"));
        assert_eq!(base.website.as_deref(), Some("https://crumbs.example"));
        assert_eq!(base.rating, Some(4.8));
        assert!(base.photos.is_none());
        assert!(!base.is_empty());
        assert!(Enrichment::default().is_empty());
    }

    #[test]
    fn test_enrichment_serde_skips_absent() {
        let e = Enrichment {
            hours: Some("9-5".to_string()),
            ..Enrichment::default()
        };
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(json, r#"{"hours":"9-5"}"#);
        let rt: Enrichment = serde_json::from_str("{}").unwrap();
        assert!(rt.is_empty());
    }

    #[test]
    fn test_new_lead_normalized() {
        let lead = NewLead {
            name: "  Dana Ruiz ".to_string(),
            company: "Ruiz Plumbing".to_string(),
            phone: Some("+1 (555) 010-2030".to_string()),
            email: Some("Dana@Ruiz.Example".to_string()),
            ..NewLead::default()
        }
        .normalized()
        .unwrap();
        assert_eq!(lead.name, "Dana Ruiz");
        assert_eq!(lead.phone.as_deref(), Some("+15550102030"));
        assert_eq!(lead.email.as_deref(), Some("dana@ruiz.example"));
    }

    #[test]
    fn test_new_lead_requires_company() {
        let err = NewLead {
            name: "Dana".to_string(),
            company: "   ".to_string(),
            ..NewLead::default()
        }
        .normalized()
        .unwrap_err();
        assert!(matches!(err, LeadflowError::Validation { ref field, .. } if field == "company"));
    }

    #[test]
    fn test_new_lead_rejects_malformed_identity() {
        let bad_email = NewLead {
            name: "Dana".to_string(),
            company: "Ruiz".to_string(),
            email: Some("not-an-email".to_string()),
            ..NewLead::default()
        };
        assert!(bad_email.normalized().is_err());

        let bad_phone = NewLead {
            name: "Dana".to_string(),
            company: "Ruiz".to_string(),
            phone: Some("12-34".to_string()),
            ..NewLead::default()
        };
        assert!(bad_phone.normalized().is_err());
    }

    #[test]
    fn test_blank_optional_identity_becomes_none() {
        let lead = NewLead {
            name: "Dana".to_string(),
            company: "Ruiz".to_string(),
            phone: Some("".to_string()),
            email: Some("  ".to_string()),
            ..NewLead::default()
        }
        .normalized()
        .unwrap();
        assert!(lead.phone.is_none());
        assert!(lead.email.is_none());
    }

    #[test]
    fn test_lead_contact_destination_prefers_phone() {
        let input = NewLead {
            name: "Dana".to_string(),
            company: "Ruiz".to_string(),
            phone: Some("5550102030".to_string()),
            email: Some("dana@ruiz.example".to_string()),
            ..NewLead::default()
        };
        let mut lead = Lead::from_new(input, Timestamp(1_700_000_000));
        assert_eq!(
            lead.contact_destination(),
            Some(Destination::Sms("5550102030".to_string()))
        );
        lead.phone = None;
        assert_eq!(
            lead.contact_destination(),
            Some(Destination::Email("dana@ruiz.example".to_string()))
        );
        lead.email = None;
        assert!(lead.contact_destination().is_none());
    }

    #[test]
    fn test_new_lead_starts_created_and_new() {
        let lead = Lead::from_new(
            NewLead {
                name: "Dana".to_string(),
                company: "Ruiz".to_string(),
                ..NewLead::default()
            },
            Timestamp(1_700_000_000),
        );
        assert_eq!(lead.status, LeadStatus::Created);
        assert_eq!(lead.conversation_stage, ConversationStage::New);
        assert_eq!(lead.version, 0);
    }

    #[test]
    fn test_flag_stage_is_idempotent() {
        let mut lead = Lead::from_new(
            NewLead {
                name: "Dana".to_string(),
                company: "Ruiz".to_string(),
                ..NewLead::default()
            },
            Timestamp::now(),
        );
        lead.flag_stage(PipelineStage::Enrichment);
        lead.flag_stage(PipelineStage::Enrichment);
        assert_eq!(lead.failed_stages, vec![PipelineStage::Enrichment]);
        lead.clear_stage_flag(PipelineStage::Enrichment);
        assert!(lead.failed_stages.is_empty());
    }

    #[test]
    fn test_timestamp_days_until() {
        let t = Timestamp(1_700_000_000);
        assert_eq!(t.days_until(t), 0);
        assert_eq!(t.days_until(t.plus_secs(86_399)), 0);
        assert_eq!(t.days_until(t.plus_secs(86_400)), 1);
        assert_eq!(t.days_until(t.plus_secs(-86_400)), 0);
    }

    #[test]
    fn test_artifact_expiry() {
        let artifact = ArtifactRef {
            preview_id: "pv_1".to_string(),
            url: "https://preview.example/pv_1".to_string(),
            expires_at: Timestamp(1000),
        };
        assert!(!artifact.is_expired(Timestamp(999)));
        assert!(artifact.is_expired(Timestamp(1000)));
    }

    #[test]
    fn test_destination_serde_format() {
        let json = serde_json::to_string(&Destination::Sms("555".to_string())).unwrap();
        assert_eq!(json, r#"{"kind":"sms","address":"555"}"#);
    }
}
