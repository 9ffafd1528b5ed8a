//! Database schema migrations.
//!
//! Applies the initial schema: leads, events, approvals, stage_runs and the
//! schema_migrations bookkeeping table.

use rusqlite::Connection;
use tracing::info;

use leadflow_core::error::LeadflowError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), LeadflowError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| LeadflowError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| LeadflowError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), LeadflowError> {
    conn.execute_batch(
        "
        -- Leads are never hard-deleted; closed is terminal.
        CREATE TABLE IF NOT EXISTS leads (
            id                      TEXT PRIMARY KEY NOT NULL,
            name                    TEXT NOT NULL,
            company                 TEXT NOT NULL,
            phone                   TEXT,
            email                   TEXT,
            status                  TEXT NOT NULL DEFAULT 'created'
                                    CHECK (status IN ('created', 'enriched', 'distributed', 'client', 'closed')),
            priority                TEXT NOT NULL DEFAULT 'normal'
                                    CHECK (priority IN ('low', 'normal', 'high', 'urgent')),
            owner                   TEXT,
            enrichment              TEXT NOT NULL DEFAULT '{}',
            artifact                TEXT,
            personalization         TEXT,
            draft_message           TEXT,
            engagement              TEXT,
            failed_stages           TEXT NOT NULL DEFAULT '[]',
            pricing_override_cents  INTEGER,
            site_live               INTEGER NOT NULL DEFAULT 0,
            conversation_stage      TEXT NOT NULL DEFAULT 'new',
            version                 INTEGER NOT NULL DEFAULT 0,
            created_at              INTEGER NOT NULL,
            updated_at              INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_leads_status
            ON leads (status, created_at ASC);

        -- Append-only interaction timeline. seq breaks timestamp ties in
        -- insertion order.
        CREATE TABLE IF NOT EXISTS events (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT NOT NULL UNIQUE,
            subject_id      TEXT NOT NULL,
            event_type      TEXT NOT NULL,
            timestamp       INTEGER NOT NULL,
            metadata        TEXT NOT NULL DEFAULT '{}',
            dedupe_key      TEXT UNIQUE
        );

        CREATE INDEX IF NOT EXISTS idx_events_subject
            ON events (subject_id, timestamp ASC, seq ASC);

        CREATE TRIGGER IF NOT EXISTS events_no_update
            BEFORE UPDATE ON events
            BEGIN SELECT RAISE(ABORT, 'events are append-only'); END;

        CREATE TRIGGER IF NOT EXISTS events_no_delete
            BEFORE DELETE ON events
            BEGIN SELECT RAISE(ABORT, 'events are append-only'); END;

        CREATE TABLE IF NOT EXISTS approvals (
            id              TEXT PRIMARY KEY NOT NULL,
            gate_type       TEXT NOT NULL,
            lead_id         TEXT,
            client_id       TEXT,
            priority        TEXT NOT NULL DEFAULT 'normal',
            description     TEXT NOT NULL,
            draft_content   TEXT,
            metadata        TEXT NOT NULL DEFAULT '{}',
            status          TEXT NOT NULL DEFAULT 'pending'
                            CHECK (status IN ('pending', 'approved', 'denied')),
            resolver        TEXT,
            resolved_at     INTEGER,
            denial_reason   TEXT,
            execution_error TEXT,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_approvals_status
            ON approvals (status, created_at ASC);

        -- Durable scheduler queue, one row per (lead, stage).
        CREATE TABLE IF NOT EXISTS stage_runs (
            lead_id         TEXT NOT NULL,
            stage           TEXT NOT NULL,
            status          TEXT NOT NULL
                            CHECK (status IN ('scheduled', 'running', 'succeeded', 'failed', 'awaiting_approval')),
            attempts        INTEGER NOT NULL DEFAULT 0,
            due_at_ms       INTEGER NOT NULL,
            last_error      TEXT,
            updated_at      INTEGER NOT NULL,
            PRIMARY KEY (lead_id, stage),
            FOREIGN KEY (lead_id) REFERENCES leads(id)
        );

        CREATE INDEX IF NOT EXISTS idx_stage_runs_due
            ON stage_runs (status, due_at_ms ASC);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| LeadflowError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}
