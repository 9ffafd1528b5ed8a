//! Collaborators that only log. Used by the binary when no real providers
//! are wired in.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use leadflow_core::types::{ArtifactRef, Destination, Enrichment, Lead, Timestamp};

use crate::error::CollaboratorError;

use super::{
    ArtifactGenerator, BusinessIdentity, DeliveryStatus, DispatchChannel, DispatchReceipt,
    Distributor, EnrichmentProvider, LeadContext, PaymentProvider, PaymentRequest,
};

pub struct DryRunDispatch;

#[async_trait]
impl DispatchChannel for DryRunDispatch {
    async fn send(
        &self,
        destination: &Destination,
        content: &str,
        correlation_ref: &str,
    ) -> Result<DispatchReceipt, CollaboratorError> {
        info!(
            destination = %destination,
            correlation_ref,
            chars = content.chars().count(),
            "[dry-run] Would send message"
        );
        Ok(DispatchReceipt {
            status: DeliveryStatus::Delivered,
            provider_status: "dry_run".to_string(),
            provider_message_id: format!("dry-{}", Uuid::new_v4()),
        })
    }
}

/// Finds nothing; the pipeline carries on with identity fields only.
pub struct DryRunEnrichment;

#[async_trait]
impl EnrichmentProvider for DryRunEnrichment {
    async fn enrich(&self, identity: &BusinessIdentity) -> Result<Enrichment, CollaboratorError> {
        info!(company = %identity.company, "[dry-run] Would enrich business");
        Ok(Enrichment::default())
    }
}

pub struct DryRunArtifacts {
    ttl_days: u32,
}

impl DryRunArtifacts {
    pub fn new(ttl_days: u32) -> Self {
        Self { ttl_days }
    }
}

#[async_trait]
impl ArtifactGenerator for DryRunArtifacts {
    async fn generate_preview(&self, ctx: &LeadContext) -> Result<ArtifactRef, CollaboratorError> {
        let preview_id = Uuid::new_v4().to_string();
        info!(lead_id = %ctx.lead_id, preview_id = %preview_id, "[dry-run] Would generate preview");
        Ok(ArtifactRef {
            url: format!("https://preview.invalid/{}", preview_id),
            preview_id,
            expires_at: Timestamp::now().plus_secs(i64::from(self.ttl_days) * 86_400),
        })
    }

    async fn draft_message(&self, ctx: &LeadContext) -> Result<String, CollaboratorError> {
        info!(lead_id = %ctx.lead_id, "[dry-run] Would draft message");
        let opener = ctx
            .personalization
            .as_ref()
            .map(|p| p.opener.clone())
            .unwrap_or_else(|| format!("Hi {}", ctx.name));
        Ok(match &ctx.preview_url {
            Some(url) => format!("{}\n\n{}", opener, url),
            None => opener,
        })
    }
}

pub struct DryRunPayments;

#[async_trait]
impl PaymentProvider for DryRunPayments {
    async fn create_link(&self, request: &PaymentRequest) -> Result<String, CollaboratorError> {
        info!(lead_id = %request.lead_id, amount_cents = ?request.amount_cents, "[dry-run] Would create payment link");
        Ok(format!("https://pay.invalid/{}", request.lead_id))
    }

    async fn refund(
        &self,
        subject_id: Uuid,
        amount_cents: i64,
        payment_ref: Option<&str>,
    ) -> Result<String, CollaboratorError> {
        info!(subject_id = %subject_id, amount_cents, payment_ref = ?payment_ref, "[dry-run] Would refund");
        Ok(format!("dry-refund-{}", Uuid::new_v4()))
    }

    async fn cancel_subscription(
        &self,
        subject_id: Uuid,
        subscription_ref: Option<&str>,
    ) -> Result<(), CollaboratorError> {
        info!(subject_id = %subject_id, subscription_ref = ?subscription_ref, "[dry-run] Would cancel subscription");
        Ok(())
    }
}

pub struct DryRunDistributor;

#[async_trait]
impl Distributor for DryRunDistributor {
    async fn distribute(&self, lead: &Lead) -> Result<(), CollaboratorError> {
        info!(lead_id = %lead.id, company = %lead.company, "[dry-run] Would distribute lead");
        Ok(())
    }
}
