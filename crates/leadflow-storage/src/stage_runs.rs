//! Durable stage-run queue.
//!
//! One row per (lead, stage). The scheduler claims due `scheduled` rows and
//! flips them to `running`; a lead that already has a `running` row is
//! skipped, so at most one stage per lead executes at a time even across
//! processes sharing the database file.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::OptionalExtension;
use tracing::{debug, info};
use uuid::Uuid;

use leadflow_core::error::LeadflowError;
use leadflow_core::types::{PipelineStage, StageRun, StageRunStatus, Timestamp};

use crate::db::{storage_err, Database};
use crate::repository::{parse_enum, parse_uuid};

const RUN_COLUMNS: &str = "lead_id, stage, status, attempts, due_at_ms, last_error, updated_at";

pub struct StageRunRepository {
    db: Arc<Database>,
}

impl StageRunRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Schedule (or reschedule) a stage for a lead.
    ///
    /// Resets attempts and the last error. A row that is currently `running`
    /// is left alone and `false` is returned.
    pub fn schedule(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
        due_at_ms: i64,
    ) -> Result<bool, LeadflowError> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO stage_runs (lead_id, stage, status, attempts, due_at_ms, last_error, updated_at)
                 VALUES (?1, ?2, 'scheduled', 0, ?3, NULL, ?4)
                 ON CONFLICT (lead_id, stage) DO UPDATE SET
                    status = 'scheduled', attempts = 0, due_at_ms = excluded.due_at_ms,
                    last_error = NULL, updated_at = excluded.updated_at
                 WHERE stage_runs.status != 'running'",
                rusqlite::params![lead_id.to_string(), stage.as_str(), due_at_ms, Timestamp::now().0],
            )
            .map_err(|e| LeadflowError::Storage(format!("Failed to schedule stage: {}", e)))
        })?;
        debug!(lead_id = %lead_id, stage = %stage, due_at_ms, "Stage scheduled");
        Ok(changed == 1)
    }

    /// Claim up to `limit` due runs, at most one per lead, skipping leads
    /// that already have a running stage. Claimed rows become `running` and
    /// their attempt counter is incremented.
    pub fn claim_due(&self, now_ms: i64, limit: usize) -> Result<Vec<StageRun>, LeadflowError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(storage_err)?;

            let candidates = {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT {} FROM stage_runs
                         WHERE status = 'scheduled' AND due_at_ms <= ?1
                           AND lead_id NOT IN (SELECT lead_id FROM stage_runs WHERE status = 'running')
                         ORDER BY due_at_ms ASC",
                        RUN_COLUMNS
                    ))
                    .map_err(storage_err)?;
                let rows = stmt
                    .query_map(rusqlite::params![now_ms], |row| Ok(row_to_run(row)))
                    .map_err(storage_err)?;
                let mut runs = Vec::new();
                for row in rows {
                    runs.push(row.map_err(storage_err)??);
                }
                runs
            };

            let now = Timestamp::now();
            let mut seen = HashSet::new();
            let mut claimed = Vec::new();
            for mut run in candidates {
                if claimed.len() >= limit {
                    break;
                }
                if !seen.insert(run.lead_id) {
                    continue;
                }
                tx.execute(
                    "UPDATE stage_runs SET status = 'running', attempts = attempts + 1, updated_at = ?1
                     WHERE lead_id = ?2 AND stage = ?3 AND status = 'scheduled'",
                    rusqlite::params![now.0, run.lead_id.to_string(), run.stage.as_str()],
                )
                .map_err(storage_err)?;
                run.status = StageRunStatus::Running;
                run.attempts += 1;
                run.updated_at = now;
                claimed.push(run);
            }

            tx.commit().map_err(storage_err)?;
            Ok(claimed)
        })
    }

    /// Earliest due time among scheduled runs.
    pub fn next_due_at_ms(&self) -> Result<Option<i64>, LeadflowError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT MIN(due_at_ms) FROM stage_runs WHERE status = 'scheduled'",
                [],
                |row| row.get(0),
            )
            .map_err(storage_err)
        })
    }

    pub fn mark_succeeded(&self, lead_id: Uuid, stage: PipelineStage) -> Result<(), LeadflowError> {
        self.set_status(lead_id, stage, StageRunStatus::Succeeded, None)
    }

    pub fn mark_failed(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
        error: &str,
    ) -> Result<(), LeadflowError> {
        self.set_status(lead_id, stage, StageRunStatus::Failed, Some(error))
    }

    pub fn mark_awaiting_approval(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
    ) -> Result<(), LeadflowError> {
        self.set_status(lead_id, stage, StageRunStatus::AwaitingApproval, None)
    }

    /// Put a failed attempt back in the queue, keeping its attempt count.
    pub fn retry_at(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
        due_at_ms: i64,
        error: &str,
    ) -> Result<(), LeadflowError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE stage_runs SET status = 'scheduled', due_at_ms = ?1, last_error = ?2, updated_at = ?3
                 WHERE lead_id = ?4 AND stage = ?5",
                rusqlite::params![
                    due_at_ms,
                    error,
                    Timestamp::now().0,
                    lead_id.to_string(),
                    stage.as_str()
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }

    /// Return runs orphaned in `running` by a crashed process to the queue.
    pub fn recover_running(&self) -> Result<usize, LeadflowError> {
        let recovered = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE stage_runs SET status = 'scheduled', updated_at = ?1 WHERE status = 'running'",
                rusqlite::params![Timestamp::now().0],
            )
            .map_err(storage_err)
        })?;
        if recovered > 0 {
            info!(recovered, "Recovered interrupted stage runs");
        }
        Ok(recovered)
    }

    pub fn get(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
    ) -> Result<Option<StageRun>, LeadflowError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM stage_runs WHERE lead_id = ?1 AND stage = ?2",
                    RUN_COLUMNS
                ))
                .map_err(storage_err)?;
            let result = stmt
                .query_row(
                    rusqlite::params![lead_id.to_string(), stage.as_str()],
                    |row| Ok(row_to_run(row)),
                )
                .optional()
                .map_err(storage_err)?;
            result.transpose()
        })
    }

    /// Every run recorded for a lead, in pipeline order.
    pub fn list_for_lead(&self, lead_id: Uuid) -> Result<Vec<StageRun>, LeadflowError> {
        let mut runs = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM stage_runs WHERE lead_id = ?1",
                    RUN_COLUMNS
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![lead_id.to_string()], |row| {
                    Ok(row_to_run(row))
                })
                .map_err(storage_err)?;
            let mut runs = Vec::new();
            for row in rows {
                runs.push(row.map_err(storage_err)??);
            }
            Ok(runs)
        })?;
        runs.sort_by_key(|run| run.stage);
        Ok(runs)
    }

    pub fn failures_for(&self, lead_id: Uuid) -> Result<Vec<StageRun>, LeadflowError> {
        Ok(self
            .list_for_lead(lead_id)?
            .into_iter()
            .filter(|run| run.status == StageRunStatus::Failed)
            .collect())
    }

    pub fn count_by_status(&self, status: StageRunStatus) -> Result<u64, LeadflowError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM stage_runs WHERE status = ?1",
                    rusqlite::params![status.as_str()],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            Ok(count as u64)
        })
    }

    fn set_status(
        &self,
        lead_id: Uuid,
        stage: PipelineStage,
        status: StageRunStatus,
        error: Option<&str>,
    ) -> Result<(), LeadflowError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE stage_runs SET status = ?1, last_error = ?2, updated_at = ?3
                 WHERE lead_id = ?4 AND stage = ?5",
                rusqlite::params![
                    status.as_str(),
                    error,
                    Timestamp::now().0,
                    lead_id.to_string(),
                    stage.as_str()
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<StageRun, LeadflowError> {
    let lead_id: String = row.get(0).map_err(storage_err)?;
    let stage: String = row.get(1).map_err(storage_err)?;
    let status: String = row.get(2).map_err(storage_err)?;
    let attempts: i64 = row.get(3).map_err(storage_err)?;

    Ok(StageRun {
        lead_id: parse_uuid(&lead_id)?,
        stage: parse_enum(&stage)?,
        status: parse_enum(&status)?,
        attempts: attempts as u32,
        due_at_ms: row.get(4).map_err(storage_err)?,
        last_error: row.get(5).map_err(storage_err)?,
        updated_at: Timestamp(row.get(6).map_err(storage_err)?),
    })
}
