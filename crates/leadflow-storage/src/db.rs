//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and the PRAGMAs the repositories rely on.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use leadflow_core::error::LeadflowError;

use crate::migrations;

/// Thread-safe SQLite database wrapper.
///
/// Every repository goes through [`Database::with_conn`], so a closure body
/// runs with exclusive access to the connection. Conditional updates that
/// must be atomic (approval resolution, stage claims) rely on this.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path and run pending
    /// migrations.
    pub fn new(path: &Path) -> Result<Self, LeadflowError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| LeadflowError::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| LeadflowError::Storage(format!("Failed to set pragmas: {}", e)))?;

        info!("Database opened at {}", path.display());

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, LeadflowError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LeadflowError::Storage(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| LeadflowError::Storage(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LeadflowError>
    where
        F: FnOnce(&Connection) -> Result<T, LeadflowError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LeadflowError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

/// Map any rusqlite error into the storage variant.
pub(crate) fn storage_err(e: rusqlite::Error) -> LeadflowError {
    LeadflowError::Storage(e.to_string())
}
