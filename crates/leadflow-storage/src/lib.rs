//! Leadflow Storage crate - SQLite persistence for leads, the event
//! timeline, approvals and the durable stage-run queue.
//!
//! Provides a WAL-mode SQLite database with migrations and one repository
//! per table. The event timeline has no update or delete path.

pub mod approvals;
pub mod db;
pub mod migrations;
pub mod repository;
pub mod stage_runs;

pub use approvals::{ApprovalRepository, Resolution, ResolveOutcome};
pub use db::Database;
pub use repository::{EventRepository, LeadRepository};
pub use stage_runs::StageRunRepository;
