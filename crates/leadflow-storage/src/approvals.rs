//! Persistence for approvals.
//!
//! Resolution is a single conditional UPDATE (`WHERE status = 'pending'`)
//! executed while the connection lock is held, so exactly one resolver can
//! ever move an approval out of pending.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use uuid::Uuid;

use leadflow_core::error::LeadflowError;
use leadflow_core::types::{Approval, ApprovalStatus, Metadata, Timestamp};

use crate::db::{storage_err, Database};
use crate::repository::{parse_enum, parse_uuid};

const APPROVAL_COLUMNS: &str = "id, gate_type, lead_id, client_id, priority, description,
     draft_content, metadata, status, resolver, resolved_at, denial_reason,
     execution_error, created_at";

/// Result of an attempt to resolve an approval.
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    /// This call performed the resolution.
    Resolved(Approval),
    /// Someone else resolved it first; the stored approval is unchanged.
    AlreadyResolved(Approval),
}

/// Fields written when an approval leaves pending.
#[derive(Debug, Clone)]
pub struct Resolution<'a> {
    pub status: ApprovalStatus,
    pub resolver: &'a str,
    pub resolved_at: Timestamp,
    pub denial_reason: Option<&'a str>,
    pub metadata: &'a Metadata,
}

pub struct ApprovalRepository {
    db: Arc<Database>,
}

impl ApprovalRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn insert(&self, approval: &Approval) -> Result<(), LeadflowError> {
        let metadata = serde_json::to_string(&approval.metadata)?;
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO approvals ({}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    APPROVAL_COLUMNS
                ),
                rusqlite::params![
                    approval.id.to_string(),
                    approval.gate_type.as_str(),
                    approval.lead_id.map(|id| id.to_string()),
                    approval.client_id.map(|id| id.to_string()),
                    approval.priority.as_str(),
                    approval.description,
                    approval.draft_content,
                    metadata,
                    approval.status.as_str(),
                    approval.resolver,
                    approval.resolved_at.map(|t| t.0),
                    approval.denial_reason,
                    approval.execution_error,
                    approval.created_at.0,
                ],
            )
            .map_err(|e| LeadflowError::Storage(format!("Failed to insert approval: {}", e)))?;
            Ok(())
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Approval>, LeadflowError> {
        self.db.with_conn(|conn| fetch(conn, id))
    }

    /// Approvals filtered by status, most urgent first, then oldest first.
    pub fn list(&self, status: Option<ApprovalStatus>) -> Result<Vec<Approval>, LeadflowError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM approvals
                     WHERE ?1 IS NULL OR status = ?1
                     ORDER BY CASE priority
                                WHEN 'urgent' THEN 0
                                WHEN 'high' THEN 1
                                WHEN 'normal' THEN 2
                                ELSE 3
                              END,
                              created_at ASC",
                    APPROVAL_COLUMNS
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![status.map(|s| s.as_str())], |row| {
                    Ok(row_to_approval(row))
                })
                .map_err(storage_err)?;

            let mut approvals = Vec::new();
            for row in rows {
                approvals.push(row.map_err(storage_err)??);
            }
            Ok(approvals)
        })
    }

    /// Move a pending approval to its final status.
    ///
    /// The check and the write happen in one statement; a concurrent second
    /// resolver observes [`ResolveOutcome::AlreadyResolved`] with the first
    /// resolver's decision intact.
    pub fn resolve(
        &self,
        id: Uuid,
        resolution: &Resolution<'_>,
    ) -> Result<ResolveOutcome, LeadflowError> {
        let metadata = serde_json::to_string(resolution.metadata)?;
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE approvals
                     SET status = ?1, resolver = ?2, resolved_at = ?3, denial_reason = ?4, metadata = ?5
                     WHERE id = ?6 AND status = 'pending'",
                    rusqlite::params![
                        resolution.status.as_str(),
                        resolution.resolver,
                        resolution.resolved_at.0,
                        resolution.denial_reason,
                        metadata,
                        id.to_string(),
                    ],
                )
                .map_err(|e| LeadflowError::Storage(format!("Failed to resolve approval: {}", e)))?;

            let stored = fetch(conn, id)?.ok_or(LeadflowError::ApprovalNotFound(id))?;
            if changed == 1 {
                Ok(ResolveOutcome::Resolved(stored))
            } else {
                Ok(ResolveOutcome::AlreadyResolved(stored))
            }
        })
    }

    /// Record (or clear, with `None`) the last executor failure. Status is
    /// never touched.
    pub fn record_execution_error(
        &self,
        id: Uuid,
        error: Option<&str>,
    ) -> Result<(), LeadflowError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE approvals SET execution_error = ?1 WHERE id = ?2",
                    rusqlite::params![error, id.to_string()],
                )
                .map_err(storage_err)?;
            if changed == 0 {
                return Err(LeadflowError::ApprovalNotFound(id));
            }
            Ok(())
        })
    }

    pub fn count_by_status(&self, status: ApprovalStatus) -> Result<u64, LeadflowError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM approvals WHERE status = ?1",
                    rusqlite::params![status.as_str()],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            Ok(count as u64)
        })
    }
}

fn fetch(conn: &rusqlite::Connection, id: Uuid) -> Result<Option<Approval>, LeadflowError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM approvals WHERE id = ?1",
            APPROVAL_COLUMNS
        ))
        .map_err(storage_err)?;
    let result = stmt
        .query_row(rusqlite::params![id.to_string()], |row| {
            Ok(row_to_approval(row))
        })
        .optional()
        .map_err(storage_err)?;
    result.transpose()
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> Result<Approval, LeadflowError> {
    let id: String = row.get(0).map_err(storage_err)?;
    let gate_type: String = row.get(1).map_err(storage_err)?;
    let lead_id: Option<String> = row.get(2).map_err(storage_err)?;
    let client_id: Option<String> = row.get(3).map_err(storage_err)?;
    let priority: String = row.get(4).map_err(storage_err)?;
    let metadata: String = row.get(7).map_err(storage_err)?;
    let status: String = row.get(8).map_err(storage_err)?;
    let resolved_at: Option<i64> = row.get(10).map_err(storage_err)?;

    Ok(Approval {
        id: parse_uuid(&id)?,
        gate_type: parse_enum(&gate_type)?,
        lead_id: lead_id.as_deref().map(parse_uuid).transpose()?,
        client_id: client_id.as_deref().map(parse_uuid).transpose()?,
        priority: parse_enum(&priority)?,
        description: row.get(5).map_err(storage_err)?,
        draft_content: row.get(6).map_err(storage_err)?,
        metadata: serde_json::from_str(&metadata)?,
        status: parse_enum(&status)?,
        resolver: row.get(9).map_err(storage_err)?,
        resolved_at: resolved_at.map(Timestamp),
        denial_reason: row.get(11).map_err(storage_err)?,
        execution_error: row.get(12).map_err(storage_err)?,
        created_at: Timestamp(row.get(13).map_err(storage_err)?),
    })
}
