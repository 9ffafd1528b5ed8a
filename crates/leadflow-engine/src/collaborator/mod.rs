//! Contracts for external collaborators.
//!
//! Concrete providers (SMS/email gateways, enrichment APIs, content
//! generation, payments) live outside this crate. The engine only sees these
//! traits, always calls them under a timeout, and classifies their failures
//! through [`CollaboratorError::is_transient`].

pub mod dispatch;
pub mod dry_run;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use leadflow_core::types::{ArtifactRef, Destination, Enrichment, Lead, Personalization};

use crate::error::CollaboratorError;

pub use dispatch::{Delivery, RecordedDispatch};

/// Identity fields handed to enrichment lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessIdentity {
    pub name: String,
    pub company: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl From<&Lead> for BusinessIdentity {
    fn from(lead: &Lead) -> Self {
        Self {
            name: lead.name.clone(),
            company: lead.company.clone(),
            phone: lead.phone.clone(),
            email: lead.email.clone(),
        }
    }
}

/// Everything content generation may use about a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadContext {
    pub lead_id: Uuid,
    pub name: String,
    pub company: String,
    pub enrichment: Enrichment,
    pub personalization: Option<Personalization>,
    pub preview_url: Option<String>,
}

impl From<&Lead> for LeadContext {
    fn from(lead: &Lead) -> Self {
        Self {
            lead_id: lead.id,
            name: lead.name.clone(),
            company: lead.company.clone(),
            enrichment: lead.enrichment.clone(),
            personalization: lead.personalization.clone(),
            preview_url: lead.artifact.as_ref().map(|a| a.url.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub lead_id: Uuid,
    pub company: String,
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

/// What an outbound channel reports for one physical send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub status: DeliveryStatus,
    pub provider_status: String,
    pub provider_message_id: String,
}

/// SMS / email / voice delivery.
#[async_trait]
pub trait DispatchChannel: Send + Sync {
    async fn send(
        &self,
        destination: &Destination,
        content: &str,
        correlation_ref: &str,
    ) -> Result<DispatchReceipt, CollaboratorError>;
}

/// Business metadata lookup. Partial results are normal.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    async fn enrich(&self, identity: &BusinessIdentity) -> Result<Enrichment, CollaboratorError>;
}

/// Preview sites and outreach copy.
#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    async fn generate_preview(&self, ctx: &LeadContext) -> Result<ArtifactRef, CollaboratorError>;

    async fn draft_message(&self, ctx: &LeadContext) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Returns a payment URL for the lead.
    async fn create_link(&self, request: &PaymentRequest) -> Result<String, CollaboratorError>;

    /// Returns the provider's refund reference.
    async fn refund(
        &self,
        subject_id: Uuid,
        amount_cents: i64,
        payment_ref: Option<&str>,
    ) -> Result<String, CollaboratorError>;

    async fn cancel_subscription(
        &self,
        subject_id: Uuid,
        subscription_ref: Option<&str>,
    ) -> Result<(), CollaboratorError>;
}

/// Final pipeline target: fans a prepared lead out to outbound channels.
#[async_trait]
pub trait Distributor: Send + Sync {
    async fn distribute(&self, lead: &Lead) -> Result<(), CollaboratorError>;
}

/// The full set of collaborators the engine is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub dispatch: Arc<dyn DispatchChannel>,
    pub enrichment: Arc<dyn EnrichmentProvider>,
    pub artifacts: Arc<dyn ArtifactGenerator>,
    pub payments: Arc<dyn PaymentProvider>,
    pub distributor: Arc<dyn Distributor>,
}

impl Collaborators {
    /// Collaborators that only log what they would do.
    pub fn dry_run(preview_ttl_days: u32) -> Self {
        Self {
            dispatch: Arc::new(dry_run::DryRunDispatch),
            enrichment: Arc::new(dry_run::DryRunEnrichment),
            artifacts: Arc::new(dry_run::DryRunArtifacts::new(preview_ttl_days)),
            payments: Arc::new(dry_run::DryRunPayments),
            distributor: Arc::new(dry_run::DryRunDistributor),
        }
    }
}

/// Bound a collaborator call. An elapsed timer becomes
/// [`CollaboratorError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::Timeout(limit.as_millis() as u64)),
    }
}
