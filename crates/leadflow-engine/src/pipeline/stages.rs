//! Units of work for each pipeline stage.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use leadflow_core::types::{
    ConversationStage, GateType, Lead, LeadStatus, Personalization, PipelineStage, Timestamp,
};

use crate::collaborator::{with_timeout, BusinessIdentity, Collaborators, LeadContext};
use crate::conversation::{Authority, ConversationStageMachine};
use crate::error::{CollaboratorError, PipelineError};
use crate::gate::{ApprovalGate, ApprovalRequest};
use crate::store::Store;

/// How a stage's work ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageResult {
    Completed,
    /// Forward progress now waits on this approval.
    Gated(Uuid),
}

pub(crate) struct StageWork {
    pub(crate) store: Store,
    pub(crate) collaborators: Collaborators,
    pub(crate) conversation: Arc<ConversationStageMachine>,
    pub(crate) gate: Arc<ApprovalGate>,
    pub(crate) timeout: Duration,
}

impl StageWork {
    pub(crate) async fn run(
        &self,
        lead: &Lead,
        stage: PipelineStage,
    ) -> Result<StageResult, PipelineError> {
        match stage {
            PipelineStage::Enrichment => self.enrich(lead).await,
            PipelineStage::ArtifactGeneration => self.generate_artifact(lead).await,
            PipelineStage::Personalization => self.personalize(lead),
            PipelineStage::MessageDrafting => self.draft_message(lead).await,
            PipelineStage::Distribution => self.distribute(lead).await,
        }
    }

    async fn call<T, F>(&self, stage: PipelineStage, call: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
    {
        with_timeout(self.timeout, call)
            .await
            .map_err(|source| PipelineError::Collaborator { stage, source })
    }

    fn modify<F>(&self, lead_id: Uuid, apply: F) -> Result<Lead, PipelineError>
    where
        F: FnMut(&mut Lead),
    {
        self.store
            .modify_lead(lead_id, apply)
            .map_err(PipelineError::from_lead_error)
    }

    async fn enrich(&self, lead: &Lead) -> Result<StageResult, PipelineError> {
        let identity = BusinessIdentity::from(lead);
        let found = self
            .call(
                PipelineStage::Enrichment,
                self.collaborators.enrichment.enrich(&identity),
            )
            .await?;
        let found_any = !found.is_empty();
        self.modify(lead.id, |l| {
            l.enrichment.merge(found.clone());
            if found_any && l.status == LeadStatus::Created {
                l.status = LeadStatus::Enriched;
            }
        })?;
        debug!(lead_id = %lead.id, found_any, "Enrichment merged");
        Ok(StageResult::Completed)
    }

    async fn generate_artifact(&self, lead: &Lead) -> Result<StageResult, PipelineError> {
        let ctx = LeadContext::from(lead);
        let artifact = self
            .call(
                PipelineStage::ArtifactGeneration,
                self.collaborators.artifacts.generate_preview(&ctx),
            )
            .await?;
        info!(lead_id = %lead.id, preview_id = %artifact.preview_id, "Preview generated");
        self.modify(lead.id, |l| l.artifact = Some(artifact.clone()))?;
        self.conversation.transition_if_at(
            lead.id,
            ConversationStage::New,
            ConversationStage::Qualified,
            Authority::PipelineStage(PipelineStage::ArtifactGeneration),
        )?;
        Ok(StageResult::Completed)
    }

    fn personalize(&self, lead: &Lead) -> Result<StageResult, PipelineError> {
        let personalization = personalize(lead);
        self.modify(lead.id, |l| l.personalization = Some(personalization.clone()))?;
        Ok(StageResult::Completed)
    }

    async fn draft_message(&self, lead: &Lead) -> Result<StageResult, PipelineError> {
        let stage = PipelineStage::MessageDrafting;
        let artifact = lead
            .artifact
            .as_ref()
            .ok_or_else(|| missing(stage, "no preview artifact"))?;
        if artifact.is_expired(Timestamp::now()) {
            return Err(missing(stage, "preview artifact expired"));
        }
        let destination = lead
            .contact_destination()
            .ok_or_else(|| missing(stage, "no contact destination"))?;

        let draft = self
            .call(
                stage,
                self.collaborators
                    .artifacts
                    .draft_message(&LeadContext::from(lead)),
            )
            .await?;
        self.modify(lead.id, |l| l.draft_message = Some(draft.clone()))?;

        let approval_id = match self.gate.pending_for(lead.id, GateType::OutboundMessage)? {
            Some(existing) => {
                debug!(lead_id = %lead.id, approval_id = %existing.id, "Outbound approval already pending");
                existing.id
            }
            None => {
                let request = ApprovalRequest::new(
                    GateType::OutboundMessage,
                    format!("Send preview to {} at {}", lead.name, lead.company),
                )
                .for_lead(lead.id)
                .with_priority(lead.priority)
                .with_draft(draft)
                .with_metadata("resume_stage", PipelineStage::Distribution.as_str())
                .with_metadata("preview_url", artifact.url.clone())
                .with_metadata("destination", destination.to_string());
                self.gate.request_approval(request).await?
            }
        };

        // The stage only moves once the approval it waits on exists.
        let authority = Authority::PipelineStage(stage);
        for from in [ConversationStage::Qualified, ConversationStage::PreviewEditing] {
            if self
                .conversation
                .transition_if_at(lead.id, from, ConversationStage::PreviewPendingApproval, authority)?
                .is_some()
            {
                break;
            }
        }
        Ok(StageResult::Gated(approval_id))
    }

    async fn distribute(&self, lead: &Lead) -> Result<StageResult, PipelineError> {
        let stage = PipelineStage::Distribution;
        if lead.contact_destination().is_none() {
            return Err(missing(stage, "no contact destination"));
        }
        self.call(stage, self.collaborators.distributor.distribute(lead))
            .await?;
        self.modify(lead.id, |l| {
            if !matches!(l.status, LeadStatus::Client | LeadStatus::Closed) {
                l.status = LeadStatus::Distributed;
            }
        })?;
        info!(lead_id = %lead.id, "Lead distributed");
        Ok(StageResult::Completed)
    }
}

fn missing(stage: PipelineStage, reason: &str) -> PipelineError {
    PipelineError::MissingPrerequisite {
        stage,
        reason: reason.to_string(),
    }
}

/// Derive an opener and highlights from whatever enrichment is present.
pub fn personalize(lead: &Lead) -> Personalization {
    let first_name = lead.name.split_whitespace().next().unwrap_or(&lead.name);
    let e = &lead.enrichment;

    let opener = match &e.category {
        Some(category) => format!(
            "Hi {}, we put together a preview site for {}, built for {} customers.",
            first_name,
            lead.company,
            category.to_lowercase()
        ),
        None => format!(
            "Hi {}, we put together a preview site for {}.",
            first_name, lead.company
        ),
    };

    let mut highlights = Vec::new();
    match (e.rating, e.review_count) {
        (Some(rating), Some(count)) => {
            highlights.push(format!("Rated {:.1} from {} reviews", rating, count))
        }
        (Some(rating), None) => highlights.push(format!("Rated {:.1}", rating)),
        (None, Some(count)) => highlights.push(format!("{} customer reviews", count)),
        (None, None) => {}
    }
    if let Some(hours) = &e.hours {
        highlights.push(format!("Open {}", hours));
    }
    if let Some(photos) = e.photos.as_ref().filter(|p| !p.is_empty()) {
        highlights.push(format!("{} photos of your work", photos.len()));
    }
    if let Some(address) = &e.address {
        highlights.push(format!("Located at {}", address));
    }

    Personalization { opener, highlights }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::types::{Enrichment, NewLead};

    fn lead() -> Lead {
        Lead::from_new(
            NewLead {
                name: "Dana Ruiz".to_string(),
                company: "Ruiz Plumbing".to_string(),
                ..NewLead::default()
            },
            Timestamp(0),
        )
    }

    #[test]
    fn test_personalize_without_enrichment() {
        let p = personalize(&lead());
        assert_eq!(p.opener, "Hi Dana, we put together a preview site for Ruiz Plumbing.");
        assert!(p.highlights.is_empty());
    }

    #[test]
    fn test_personalize_uses_present_fields_only() {
        let mut l = lead();
        l.enrichment = Enrichment {
            category: Some("Plumber".to_string()),
            rating: Some(4.8),
            review_count: Some(112),
            hours: Some("Mon-Fri 8-6".to_string()),
            ..Enrichment::default()
        };
        let p = personalize(&l);
        assert!(p.opener.contains("plumber customers"));
        assert_eq!(
            p.highlights,
            vec![
                "Rated 4.8 from 112 reviews".to_string(),
                "Open Mon-Fri 8-6".to_string(),
            ]
        );
    }

    #[test]
    fn test_personalize_skips_empty_photo_list() {
        let mut l = lead();
        l.enrichment.photos = Some(Vec::new());
        l.enrichment.review_count = Some(3);
        let p = personalize(&l);
        assert_eq!(p.highlights, vec!["3 customer reviews".to_string()]);
    }
}
