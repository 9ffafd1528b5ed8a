//! Scriptable in-memory collaborators for tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use leadflow_core::types::{ArtifactRef, Destination, Enrichment, Lead, Timestamp};

use crate::error::CollaboratorError;

use super::{
    ArtifactGenerator, BusinessIdentity, DeliveryStatus, DispatchChannel, DispatchReceipt,
    Distributor, EnrichmentProvider, LeadContext, PaymentProvider, PaymentRequest,
};

// =============================================================================
// Dispatch
// =============================================================================

#[derive(Debug, Clone)]
enum DispatchMode {
    Deliver,
    FixedMessageId(String),
    FailDelivery(String),
    Error(CollaboratorError),
}

/// A message the mock channel accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub destination: Destination,
    pub content: String,
    pub correlation_ref: String,
}

pub struct MockDispatch {
    mode: Mutex<DispatchMode>,
    sent: Mutex<Vec<SentMessage>>,
    calls: AtomicU32,
    delay: Duration,
}

impl MockDispatch {
    /// Delivers everything with ids `msg-1`, `msg-2`, ...
    pub fn new() -> Self {
        Self::with_mode(DispatchMode::Deliver)
    }

    /// Delivers everything, always reporting the same provider message id.
    pub fn with_fixed_message_id(id: &str) -> Self {
        Self::with_mode(DispatchMode::FixedMessageId(id.to_string()))
    }

    /// Accepts every send but reports it as undelivered.
    pub fn failing_delivery(provider_status: &str) -> Self {
        Self::with_mode(DispatchMode::FailDelivery(provider_status.to_string()))
    }

    pub fn erroring(err: CollaboratorError) -> Self {
        Self::with_mode(DispatchMode::Error(err))
    }

    fn with_mode(mode: DispatchMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            sent: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Takes `delay` to answer every send, like a slow gateway.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Switch to failing every call with `err`.
    pub fn fail_with(&self, err: CollaboratorError) {
        *self.mode.lock().unwrap() = DispatchMode::Error(err);
    }

    /// Switch back to delivering.
    pub fn recover(&self) {
        *self.mode.lock().unwrap() = DispatchMode::Deliver;
    }

    /// Messages reported as delivered.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockDispatch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatchChannel for MockDispatch {
    async fn send(
        &self,
        destination: &Destination,
        content: &str,
        correlation_ref: &str,
    ) -> Result<DispatchReceipt, CollaboratorError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mode = self.mode.lock().unwrap().clone();
        let (status, provider_status, provider_message_id) = match mode {
            DispatchMode::Deliver => (DeliveryStatus::Delivered, "delivered".to_string(), format!("msg-{}", n)),
            DispatchMode::FixedMessageId(id) => (DeliveryStatus::Delivered, "delivered".to_string(), id),
            DispatchMode::FailDelivery(status) => (DeliveryStatus::Failed, status, format!("msg-{}", n)),
            DispatchMode::Error(err) => return Err(err),
        };
        if status == DeliveryStatus::Delivered {
            self.sent.lock().unwrap().push(SentMessage {
                destination: destination.clone(),
                content: content.to_string(),
                correlation_ref: correlation_ref.to_string(),
            });
        }
        Ok(DispatchReceipt {
            status,
            provider_status,
            provider_message_id,
        })
    }
}

// =============================================================================
// Enrichment
// =============================================================================

#[derive(Debug, Clone)]
enum EnrichmentMode {
    Return(Enrichment),
    Fail(CollaboratorError),
    Hang,
}

pub struct MockEnrichment {
    mode: EnrichmentMode,
    calls: AtomicU32,
}

impl MockEnrichment {
    pub fn returning(enrichment: Enrichment) -> Self {
        Self::with_mode(EnrichmentMode::Return(enrichment))
    }

    pub fn failing(err: CollaboratorError) -> Self {
        Self::with_mode(EnrichmentMode::Fail(err))
    }

    /// Never answers; every call runs into the stage timeout.
    pub fn hanging() -> Self {
        Self::with_mode(EnrichmentMode::Hang)
    }

    fn with_mode(mode: EnrichmentMode) -> Self {
        Self {
            mode,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentProvider for MockEnrichment {
    async fn enrich(&self, _identity: &BusinessIdentity) -> Result<Enrichment, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            EnrichmentMode::Return(enrichment) => Ok(enrichment.clone()),
            EnrichmentMode::Fail(err) => Err(err.clone()),
            EnrichmentMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Enrichment::default())
            }
        }
    }
}

// =============================================================================
// Artifacts
// =============================================================================

pub struct MockArtifacts {
    ttl_secs: i64,
    failure: Option<CollaboratorError>,
    previews: AtomicU32,
    drafts: AtomicU32,
}

impl MockArtifacts {
    /// Previews valid for 14 days.
    pub fn new() -> Self {
        Self {
            ttl_secs: 14 * 86_400,
            failure: None,
            previews: AtomicU32::new(0),
            drafts: AtomicU32::new(0),
        }
    }

    /// Previews that are already expired when generated.
    pub fn expired() -> Self {
        Self {
            ttl_secs: -1,
            ..Self::new()
        }
    }

    pub fn failing(err: CollaboratorError) -> Self {
        Self {
            failure: Some(err),
            ..Self::new()
        }
    }

    pub fn previews_generated(&self) -> u32 {
        self.previews.load(Ordering::SeqCst)
    }

    pub fn drafts_written(&self) -> u32 {
        self.drafts.load(Ordering::SeqCst)
    }
}

impl Default for MockArtifacts {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactGenerator for MockArtifacts {
    async fn generate_preview(&self, ctx: &LeadContext) -> Result<ArtifactRef, CollaboratorError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let n = self.previews.fetch_add(1, Ordering::SeqCst) + 1;
        let preview_id = format!("pv-{}", n);
        Ok(ArtifactRef {
            url: format!("https://preview.test/{}/{}", ctx.lead_id, preview_id),
            preview_id,
            expires_at: Timestamp::now().plus_secs(self.ttl_secs),
        })
    }

    async fn draft_message(&self, ctx: &LeadContext) -> Result<String, CollaboratorError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        self.drafts.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "Hi {}, we built a preview site for {}: {}",
            ctx.name,
            ctx.company,
            ctx.preview_url.as_deref().unwrap_or("")
        ))
    }
}

// =============================================================================
// Payments
// =============================================================================

/// A refund the mock provider issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundCall {
    pub subject_id: Uuid,
    pub amount_cents: i64,
    pub payment_ref: Option<String>,
}

pub struct MockPayments {
    failure: Option<CollaboratorError>,
    links: AtomicU32,
    refunds: Mutex<Vec<RefundCall>>,
    cancellations: Mutex<Vec<Uuid>>,
}

impl MockPayments {
    pub fn new() -> Self {
        Self {
            failure: None,
            links: AtomicU32::new(0),
            refunds: Mutex::new(Vec::new()),
            cancellations: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(err: CollaboratorError) -> Self {
        Self {
            failure: Some(err),
            ..Self::new()
        }
    }

    pub fn links_created(&self) -> u32 {
        self.links.load(Ordering::SeqCst)
    }

    pub fn refunds(&self) -> Vec<RefundCall> {
        self.refunds.lock().unwrap().clone()
    }

    pub fn cancellations(&self) -> Vec<Uuid> {
        self.cancellations.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), CollaboratorError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl Default for MockPayments {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentProvider for MockPayments {
    async fn create_link(&self, request: &PaymentRequest) -> Result<String, CollaboratorError> {
        self.check()?;
        self.links.fetch_add(1, Ordering::SeqCst);
        Ok(format!("https://pay.test/{}", request.lead_id))
    }

    async fn refund(
        &self,
        subject_id: Uuid,
        amount_cents: i64,
        payment_ref: Option<&str>,
    ) -> Result<String, CollaboratorError> {
        self.check()?;
        let mut refunds = self.refunds.lock().unwrap();
        refunds.push(RefundCall {
            subject_id,
            amount_cents,
            payment_ref: payment_ref.map(str::to_string),
        });
        Ok(format!("re-{}", refunds.len()))
    }

    async fn cancel_subscription(
        &self,
        subject_id: Uuid,
        _subscription_ref: Option<&str>,
    ) -> Result<(), CollaboratorError> {
        self.check()?;
        self.cancellations.lock().unwrap().push(subject_id);
        Ok(())
    }
}

// =============================================================================
// Distribution
// =============================================================================

pub struct MockDistributor {
    distributed: Mutex<Vec<Uuid>>,
}

impl MockDistributor {
    pub fn new() -> Self {
        Self {
            distributed: Mutex::new(Vec::new()),
        }
    }

    pub fn distributed(&self) -> Vec<Uuid> {
        self.distributed.lock().unwrap().clone()
    }
}

impl Default for MockDistributor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Distributor for MockDistributor {
    async fn distribute(&self, lead: &Lead) -> Result<(), CollaboratorError> {
        self.distributed.lock().unwrap().push(lead.id);
        Ok(())
    }
}
