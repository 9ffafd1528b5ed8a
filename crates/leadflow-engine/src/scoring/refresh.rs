//! Keeps the cached engagement score on each lead in step with its timeline.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use leadflow_core::error::LeadflowError;
use leadflow_core::events::Event;
use leadflow_core::types::{EngagementScore, Lead, Timestamp};

use crate::error::TimelineError;
use crate::store::Store;

use super::EngagementScorer;

pub struct ScoreRefresher {
    store: Store,
    scorer: EngagementScorer,
    // Read-score-write is serialized per lead so a refresh that read an
    // older timeline can never overwrite a newer score.
    refresh_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ScoreRefresher {
    pub fn new(store: Store, scorer: EngagementScorer) -> Self {
        Self {
            store,
            scorer,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Recompute and cache the score for one lead from its full timeline.
    pub fn refresh(&self, lead_id: Uuid, now: Timestamp) -> Result<EngagementScore, LeadflowError> {
        let lock = self.refresh_lock(lead_id);
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            self.refresh_locked(lead_id, now)
        };
        self.release_refresh_lock(lead_id, lock);
        outcome
    }

    fn refresh_locked(
        &self,
        lead_id: Uuid,
        now: Timestamp,
    ) -> Result<EngagementScore, LeadflowError> {
        self.store.leads.require(lead_id)?;
        let events = self.store.events.list_for_subject(lead_id)?;
        let score = self.scorer.score(&events, now);
        self.store.leads.set_engagement(lead_id, &score)?;
        debug!(
            lead_id = %lead_id,
            score = score.score,
            temperature = %score.temperature,
            trend = %score.trend,
            "Engagement score refreshed"
        );
        Ok(score)
    }

    fn refresh_lock(&self, lead_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(lead_id).or_default())
    }

    fn release_refresh_lock(&self, lead_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&lead_id);
        }
    }

    /// Refresh every open lead. Returns how many were refreshed.
    pub fn refresh_all(&self, now: Timestamp) -> Result<usize, LeadflowError> {
        let leads = self.store.leads.list_open()?;
        for lead in &leads {
            self.refresh(lead.id, now)?;
        }
        info!(count = leads.len(), "Refreshed all engagement scores");
        Ok(leads.len())
    }

    /// Open leads ordered for follow-up: highest cached score first, then
    /// priority tier, then oldest.
    pub fn work_queue(&self, limit: usize) -> Result<Vec<Lead>, LeadflowError> {
        let mut leads = self.store.leads.list_open()?;
        leads.sort_by_key(|lead| {
            (
                Reverse(lead.engagement.map(|e| e.score).unwrap_or(0)),
                Reverse(lead.priority),
                lead.created_at,
            )
        });
        leads.truncate(limit);
        Ok(leads)
    }

    /// Record an inbound interaction (open, view, reply, ...) for a lead or
    /// client. Types written by the engine itself are refused.
    ///
    /// Returns `false` if an event with the same dedupe key already exists.
    pub fn record_inbound(&self, event: &Event) -> Result<bool, TimelineError> {
        if !event.event_type.is_inbound() {
            return Err(TimelineError::ReservedEventType(event.event_type));
        }
        let inserted = self.store.events.append(event)?;
        if inserted && self.store.leads.get(event.subject_id)?.is_some() {
            self.refresh(event.subject_id, Timestamp::now())?;
        }
        Ok(inserted)
    }

    /// Refresh on every appended event until `shutdown` is notified. A
    /// lagging subscriber falls back to refreshing everything.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        let mut events = self.store.events.subscribe();
        info!("Score refresher started");
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.refresh_subject(event.subject_id),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Score refresher lagged, refreshing all leads");
                        if let Err(e) = self.refresh_all(Timestamp::now()) {
                            warn!(error = %e, "Failed to refresh engagement scores");
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.notified() => break,
            }
        }
        info!("Score refresher stopped");
    }

    fn refresh_subject(&self, subject_id: Uuid) {
        // Client and approval subjects have no cached score.
        match self.store.leads.get(subject_id) {
            Ok(Some(_)) => {
                if let Err(e) = self.refresh(subject_id, Timestamp::now()) {
                    warn!(lead_id = %subject_id, error = %e, "Failed to refresh engagement score");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(subject_id = %subject_id, error = %e, "Failed to load lead for scoring"),
        }
    }
}
