//! Repositories for leads and the event timeline.
//!
//! Lead writes are guarded by an optimistic `version` column. The
//! conversation stage is never written by [`LeadRepository::update`]; it
//! moves only through [`LeadRepository::compare_and_set_stage`]. Events are
//! insert-only.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use tokio::sync::broadcast;
use uuid::Uuid;

use leadflow_core::error::LeadflowError;
use leadflow_core::events::{Event, EventType};
use leadflow_core::types::{ConversationStage, EngagementScore, Lead, LeadStatus, Timestamp};

use crate::db::{storage_err, Database};

const LEAD_COLUMNS: &str = "id, name, company, phone, email, status, priority, owner, enrichment,
     artifact, personalization, draft_message, engagement, failed_stages,
     pricing_override_cents, site_live, conversation_stage, version, created_at, updated_at";

/// Repository for lead records.
pub struct LeadRepository {
    db: Arc<Database>,
}

impl LeadRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn insert(&self, lead: &Lead) -> Result<(), LeadflowError> {
        let enrichment = serde_json::to_string(&lead.enrichment)?;
        let artifact = to_json_opt(&lead.artifact)?;
        let personalization = to_json_opt(&lead.personalization)?;
        let engagement = to_json_opt(&lead.engagement)?;
        let failed_stages = serde_json::to_string(&lead.failed_stages)?;

        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO leads ({}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                    LEAD_COLUMNS
                ),
                rusqlite::params![
                    lead.id.to_string(),
                    lead.name,
                    lead.company,
                    lead.phone,
                    lead.email,
                    lead.status.as_str(),
                    lead.priority.as_str(),
                    lead.owner,
                    enrichment,
                    artifact,
                    personalization,
                    lead.draft_message,
                    engagement,
                    failed_stages,
                    lead.pricing_override_cents,
                    lead.site_live as i32,
                    lead.conversation_stage.as_str(),
                    lead.version,
                    lead.created_at.0,
                    lead.updated_at.0,
                ],
            )
            .map_err(|e| LeadflowError::Storage(format!("Failed to insert lead: {}", e)))?;
            Ok(())
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Lead>, LeadflowError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM leads WHERE id = ?1", LEAD_COLUMNS))
                .map_err(storage_err)?;
            let result = stmt
                .query_row(rusqlite::params![id.to_string()], |row| Ok(row_to_lead(row)))
                .optional()
                .map_err(storage_err)?;
            result.transpose()
        })
    }

    /// Like [`get`](Self::get) but a missing lead is an error.
    pub fn require(&self, id: Uuid) -> Result<Lead, LeadflowError> {
        self.get(id)?.ok_or(LeadflowError::LeadNotFound(id))
    }

    /// Persist every mutable field except the conversation stage and the
    /// cached engagement score.
    ///
    /// Succeeds only if the stored version still equals `lead.version`;
    /// returns the lead with its bumped version.
    pub fn update(&self, lead: &Lead) -> Result<Lead, LeadflowError> {
        let enrichment = serde_json::to_string(&lead.enrichment)?;
        let artifact = to_json_opt(&lead.artifact)?;
        let personalization = to_json_opt(&lead.personalization)?;
        let failed_stages = serde_json::to_string(&lead.failed_stages)?;
        let updated_at = Timestamp::now().max(lead.updated_at);

        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE leads SET
                    name = ?1, company = ?2, phone = ?3, email = ?4, status = ?5,
                    priority = ?6, owner = ?7, enrichment = ?8, artifact = ?9,
                    personalization = ?10, draft_message = ?11, failed_stages = ?12,
                    pricing_override_cents = ?13, site_live = ?14,
                    version = version + 1, updated_at = ?15
                 WHERE id = ?16 AND version = ?17",
                rusqlite::params![
                    lead.name,
                    lead.company,
                    lead.phone,
                    lead.email,
                    lead.status.as_str(),
                    lead.priority.as_str(),
                    lead.owner,
                    enrichment,
                    artifact,
                    personalization,
                    lead.draft_message,
                    failed_stages,
                    lead.pricing_override_cents,
                    lead.site_live as i32,
                    updated_at.0,
                    lead.id.to_string(),
                    lead.version,
                ],
            )
            .map_err(|e| LeadflowError::Storage(format!("Failed to update lead: {}", e)))
        })?;

        if changed == 0 {
            return match self.get(lead.id)? {
                Some(_) => Err(LeadflowError::VersionConflict {
                    entity: "lead",
                    id: lead.id,
                }),
                None => Err(LeadflowError::LeadNotFound(lead.id)),
            };
        }

        let mut updated = lead.clone();
        updated.version += 1;
        updated.updated_at = updated_at;
        Ok(updated)
    }

    /// Atomically move the conversation stage from `expected` to `next`.
    ///
    /// Returns `false` when the stored stage is no longer `expected`.
    pub fn compare_and_set_stage(
        &self,
        id: Uuid,
        expected: ConversationStage,
        next: ConversationStage,
    ) -> Result<bool, LeadflowError> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE leads SET conversation_stage = ?1, updated_at = ?2
                 WHERE id = ?3 AND conversation_stage = ?4",
                rusqlite::params![
                    next.as_str(),
                    Timestamp::now().0,
                    id.to_string(),
                    expected.as_str(),
                ],
            )
            .map_err(|e| LeadflowError::Storage(format!("Failed to set stage: {}", e)))
        })?;
        Ok(changed == 1)
    }

    /// Overwrite the cached engagement score. Derived data, so no version
    /// check.
    pub fn set_engagement(&self, id: Uuid, score: &EngagementScore) -> Result<(), LeadflowError> {
        let json = serde_json::to_string(score)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE leads SET engagement = ?1 WHERE id = ?2",
                rusqlite::params![json, id.to_string()],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }

    /// All leads that are not closed, oldest first.
    pub fn list_open(&self) -> Result<Vec<Lead>, LeadflowError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM leads WHERE status != ?1 ORDER BY created_at ASC",
                    LEAD_COLUMNS
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![LeadStatus::Closed.as_str()], |row| {
                    Ok(row_to_lead(row))
                })
                .map_err(storage_err)?;

            let mut leads = Vec::new();
            for row in rows {
                leads.push(row.map_err(storage_err)??);
            }
            Ok(leads)
        })
    }

    pub fn count(&self) -> Result<u64, LeadflowError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM leads", [], |row| row.get(0))
                .map_err(storage_err)?;
            Ok(count as u64)
        })
    }
}

/// Append-only store of timeline events.
///
/// Every newly stored event is also published on a broadcast channel so
/// score refreshers can react without polling.
pub struct EventRepository {
    db: Arc<Database>,
    notify: broadcast::Sender<Event>,
}

impl EventRepository {
    pub fn new(db: Arc<Database>) -> Self {
        let (notify, _) = broadcast::channel(1024);
        Self { db, notify }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.notify.subscribe()
    }

    /// Append an event to the timeline.
    ///
    /// Returns `false` without writing when an event with the same
    /// `dedupe_key` (or id) is already stored.
    pub fn append(&self, event: &Event) -> Result<bool, LeadflowError> {
        let metadata = serde_json::to_string(&event.metadata)?;
        let inserted = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO events (id, subject_id, event_type, timestamp, metadata, dedupe_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    event.id.to_string(),
                    event.subject_id.to_string(),
                    event.event_type.as_str(),
                    event.timestamp.0,
                    metadata,
                    event.dedupe_key,
                ],
            )
            .map_err(|e| LeadflowError::Storage(format!("Failed to append event: {}", e)))
        })? == 1;

        if inserted {
            // No subscribers is fine.
            let _ = self.notify.send(event.clone());
        }
        Ok(inserted)
    }

    /// The subject's timeline in timestamp order, ties in insertion order.
    pub fn list_for_subject(&self, subject_id: Uuid) -> Result<Vec<Event>, LeadflowError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, subject_id, event_type, timestamp, metadata, dedupe_key
                     FROM events WHERE subject_id = ?1
                     ORDER BY timestamp ASC, seq ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![subject_id.to_string()], |row| {
                    Ok(row_to_event(row))
                })
                .map_err(storage_err)?;

            let mut events = Vec::new();
            for row in rows {
                events.push(row.map_err(storage_err)??);
            }
            Ok(events)
        })
    }

    pub fn has_dedupe_key(&self, key: &str) -> Result<bool, LeadflowError> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM events WHERE dedupe_key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            Ok(found.is_some())
        })
    }

    /// Whether a `message_sent` event exists whose dedupe key was derived
    /// from `correlation_ref` (`<correlation_ref>:<provider message id>`).
    pub fn has_sent(&self, correlation_ref: &str) -> Result<bool, LeadflowError> {
        let prefix = format!("{}:", correlation_ref);
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM events
                     WHERE event_type = ?1 AND substr(dedupe_key, 1, length(?2)) = ?2
                     LIMIT 1",
                    rusqlite::params![EventType::MessageSent.as_str(), prefix],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            Ok(found.is_some())
        })
    }

    pub fn count_for_subject(
        &self,
        subject_id: Uuid,
        event_type: EventType,
    ) -> Result<u64, LeadflowError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM events WHERE subject_id = ?1 AND event_type = ?2",
                    rusqlite::params![subject_id.to_string(), event_type.as_str()],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            Ok(count as u64)
        })
    }

    pub fn count(&self) -> Result<u64, LeadflowError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
                .map_err(storage_err)?;
            Ok(count as u64)
        })
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn to_json_opt<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, LeadflowError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(LeadflowError::from)
}

fn from_json_opt<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
) -> Result<Option<T>, LeadflowError> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(LeadflowError::from)
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, LeadflowError> {
    Uuid::parse_str(raw).map_err(|e| LeadflowError::Storage(format!("Invalid UUID: {}", e)))
}

pub(crate) fn parse_enum<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T, LeadflowError> {
    raw.parse::<T>().map_err(LeadflowError::Storage)
}

fn row_to_lead(row: &rusqlite::Row<'_>) -> Result<Lead, LeadflowError> {
    let id: String = row.get(0).map_err(storage_err)?;
    let status: String = row.get(5).map_err(storage_err)?;
    let priority: String = row.get(6).map_err(storage_err)?;
    let enrichment: String = row.get(8).map_err(storage_err)?;
    let failed_stages: String = row.get(13).map_err(storage_err)?;
    let site_live: i32 = row.get(15).map_err(storage_err)?;
    let stage: String = row.get(16).map_err(storage_err)?;

    Ok(Lead {
        id: parse_uuid(&id)?,
        name: row.get(1).map_err(storage_err)?,
        company: row.get(2).map_err(storage_err)?,
        phone: row.get(3).map_err(storage_err)?,
        email: row.get(4).map_err(storage_err)?,
        status: parse_enum(&status)?,
        priority: parse_enum(&priority)?,
        owner: row.get(7).map_err(storage_err)?,
        enrichment: serde_json::from_str(&enrichment)?,
        artifact: from_json_opt(row.get(9).map_err(storage_err)?)?,
        personalization: from_json_opt(row.get(10).map_err(storage_err)?)?,
        draft_message: row.get(11).map_err(storage_err)?,
        engagement: from_json_opt(row.get(12).map_err(storage_err)?)?,
        failed_stages: serde_json::from_str(&failed_stages)?,
        pricing_override_cents: row.get(14).map_err(storage_err)?,
        site_live: site_live != 0,
        conversation_stage: parse_enum(&stage)?,
        version: row.get(17).map_err(storage_err)?,
        created_at: Timestamp(row.get(18).map_err(storage_err)?),
        updated_at: Timestamp(row.get(19).map_err(storage_err)?),
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<Event, LeadflowError> {
    let id: String = row.get(0).map_err(storage_err)?;
    let subject_id: String = row.get(1).map_err(storage_err)?;
    let event_type: String = row.get(2).map_err(storage_err)?;
    let metadata: String = row.get(4).map_err(storage_err)?;

    Ok(Event {
        id: parse_uuid(&id)?,
        subject_id: parse_uuid(&subject_id)?,
        event_type: parse_enum(&event_type)?,
        timestamp: Timestamp(row.get(3).map_err(storage_err)?),
        metadata: serde_json::from_str(&metadata)?,
        dedupe_key: row.get(5).map_err(storage_err)?,
    })
}
