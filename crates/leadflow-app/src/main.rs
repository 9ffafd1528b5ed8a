//! Leadflow application binary - composition root.
//!
//! 1. Load configuration from TOML
//! 2. Open the SQLite database
//! 3. Wire the engine (pipeline, approval gates, conversation stages, scoring)
//! 4. Run the requested subcommand
//!
//! Real channel, enrichment, content and payment providers are deployment
//! specific; this binary wires the dry-run collaborators, which log what
//! they would have done.

mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tokio::sync::Notify;

use leadflow_core::config::LeadflowConfig;
use leadflow_core::events::Event;
use leadflow_core::types::{NewLead, Timestamp};
use leadflow_engine::{ApprovalRequest, Collaborators, EngagementScorer, LeadflowEngine};
use leadflow_storage::Database;

use cli::{CliArgs, Command};

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if let Some(rest) = data_dir.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(data_dir)
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = LeadflowConfig::load_or_default(&config_file);
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    if let Some(level) = args.resolve_log_level() {
        config.general.log_level = level;
    }

    // Tracing. RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Leadflow v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(path = %config_file.display(), "Configuration resolved");

    // Storage.
    let data_dir = resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join(&config.storage.db_file);
    let db = Arc::new(Database::new(&db_path)?);

    let engine = LeadflowEngine::new(
        db,
        Collaborators::dry_run(config.pipeline.preview_ttl_days),
        &config,
    );

    match args.command {
        Command::Serve => serve(engine).await?,
        Command::Ingest {
            name,
            company,
            phone,
            email,
            priority,
            owner,
        } => {
            let lead = engine.pipeline.ingest(NewLead {
                name,
                company,
                phone,
                email,
                priority,
                owner,
            })?;
            print_json(&lead)?;
        }
        Command::Approvals { pending } => {
            let approvals = if pending {
                engine.gate.pending()?
            } else {
                engine.gate.list(None)?
            };
            print_json(&approvals)?;
        }
        Command::Request {
            gate_type,
            description,
            lead,
            client,
            draft,
            metadata,
        } => {
            let mut request = ApprovalRequest::new(gate_type, description);
            if let Some(lead_id) = lead {
                request = request.for_lead(lead_id);
            }
            if let Some(client_id) = client {
                request = request.for_client(client_id);
            }
            if let Some(draft) = draft {
                request = request.with_draft(draft);
            }
            for (key, value) in cli::to_metadata(&metadata) {
                request = request.with_metadata(&key, value);
            }
            let id = engine.gate.request_approval(request).await?;
            print_json(&json!({ "approval_id": id }))?;
        }
        Command::Resolve {
            id,
            decision,
            resolver,
            reason,
            overrides,
        } => {
            let overrides = (!overrides.is_empty()).then(|| cli::to_metadata(&overrides));
            let approval = engine
                .gate
                .resolve(id, decision.into(), &resolver, reason.as_deref(), overrides)
                .await?;
            if let Some(error) = &approval.execution_error {
                tracing::warn!(approval_id = %id, error = %error, "Approved, but execution failed; use `redeliver` to retry");
            }
            print_json(&approval)?;
        }
        Command::Redeliver { id } => {
            let approval = engine.gate.redeliver(id).await?;
            print_json(&approval)?;
        }
        Command::Score { lead } => {
            let now = Timestamp::now();
            let score = engine.scores.refresh(lead, now)?;
            let events = engine.store.events.list_for_subject(lead)?;
            let breakdown = EngagementScorer::new(config.scoring.trend_period_days)
                .components(&events, now);
            print_json(&json!({
                "lead_id": lead,
                "score": score,
                "breakdown": breakdown,
                "computed_at": score.computed_at.to_datetime().to_rfc3339(),
            }))?;
        }
        Command::Queue { limit } => {
            engine.scores.refresh_all(Timestamp::now())?;
            print_json(&engine.scores.work_queue(limit)?)?;
        }
        Command::Failures { lead } => {
            print_json(&engine.pipeline.failures(lead)?)?;
        }
        Command::Record {
            subject,
            event_type,
            dedupe_key,
        } => {
            let mut event = Event::new(subject, event_type, Timestamp::now());
            if let Some(key) = dedupe_key {
                event = event.with_dedupe_key(key);
            }
            let inserted = engine.scores.record_inbound(&event)?;
            print_json(&json!({ "event_id": event.id, "recorded": inserted }))?;
        }
    }

    Ok(())
}

/// Run the scheduler and score refresher until Ctrl-C, then let both drain.
async fn serve(engine: LeadflowEngine) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline_shutdown = Arc::new(Notify::new());
    let scores_shutdown = Arc::new(Notify::new());

    let pipeline_task = tokio::spawn(
        Arc::clone(&engine.pipeline).run(Arc::clone(&pipeline_shutdown)),
    );
    let scores_task = {
        let scores = Arc::clone(&engine.scores);
        let shutdown = Arc::clone(&scores_shutdown);
        tokio::spawn(async move { scores.run(shutdown).await })
    };

    tracing::info!(
        pending_approvals = engine.gate.pending()?.len(),
        leads = engine.store.leads.count()?,
        "Leadflow running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    pipeline_shutdown.notify_one();
    scores_shutdown.notify_one();
    pipeline_task.await?;
    scores_task.await?;
    Ok(())
}
