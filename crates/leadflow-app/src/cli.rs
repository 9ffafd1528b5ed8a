//! CLI argument definitions for the Leadflow application.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use leadflow_core::events::EventType;
use leadflow_core::types::{Decision, GateType, Metadata, PriorityTier};

/// Leadflow - turns scraped leads into paying clients behind human approval.
#[derive(Parser, Debug)]
#[command(name = "leadflow", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory holding the SQLite database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the stage scheduler and score refresher until Ctrl-C.
    Serve,

    /// Add a lead and schedule its pipeline.
    Ingest {
        #[arg(long)]
        name: String,
        #[arg(long)]
        company: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long, default_value = "normal", value_parser = parse_priority)]
        priority: PriorityTier,
        #[arg(long)]
        owner: Option<String>,
    },

    /// List approvals, newest first.
    Approvals {
        /// Only approvals still waiting for a decision.
        #[arg(long)]
        pending: bool,
    },

    /// Open an approval for an operator-initiated action.
    Request {
        #[arg(value_parser = parse_gate_type)]
        gate_type: GateType,
        #[arg(long)]
        description: String,
        #[arg(long)]
        lead: Option<Uuid>,
        #[arg(long)]
        client: Option<Uuid>,
        #[arg(long)]
        draft: Option<String>,
        /// Metadata entry, `key=value`. Repeatable.
        #[arg(long = "set", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },

    /// Approve or deny a pending approval.
    Resolve {
        id: Uuid,
        decision: DecisionArg,
        #[arg(long)]
        resolver: String,
        /// Shown to the lead owner when denying.
        #[arg(long)]
        reason: Option<String>,
        /// Metadata override applied on approval, `key=value`. Repeatable.
        #[arg(long = "set", value_parser = parse_key_value)]
        overrides: Vec<(String, String)>,
    },

    /// Retry the executor of an approved approval.
    Redeliver { id: Uuid },

    /// Recompute and print the engagement score of a lead.
    Score { lead: Uuid },

    /// Open leads in follow-up order.
    Queue {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Failed stage runs for a lead.
    Failures { lead: Uuid },

    /// Record an inbound interaction reported by an external channel.
    Record {
        subject: Uuid,
        #[arg(value_parser = parse_event_type)]
        event_type: EventType,
        /// Provider event id; replays with the same key are ignored.
        #[arg(long)]
        dedupe_key: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionArg {
    Approve,
    Deny,
}

impl From<DecisionArg> for Decision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Approve => Decision::Approve,
            DecisionArg::Deny => Decision::Deny,
        }
    }
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > LEADFLOW_CONFIG env var > ~/.leadflow/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("LEADFLOW_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Priority: --data-dir flag > config file value.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level.clone()
    }
}

/// Collect `key=value` pairs into metadata. Values that parse as JSON keep
/// their type; anything else is stored as a string.
pub fn to_metadata(pairs: &[(String, String)]) -> Metadata {
    pairs
        .iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
            (key.clone(), value)
        })
        .collect()
}

fn default_config_path() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".leadflow").join("config.toml");
    }
    PathBuf::from("config.toml")
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

fn parse_priority(raw: &str) -> Result<PriorityTier, String> {
    raw.parse()
}

fn parse_gate_type(raw: &str) -> Result<GateType, String> {
    raw.parse()
}

fn parse_event_type(raw: &str) -> Result<EventType, String> {
    raw.parse()
}
