//! Command handlers for CLI operations
//!
//! - run: submit an instruction to an in-process worker and wait for it
//! - status: show the read model for one session
//! - history: show the most recently updated sessions

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;

use crate::conductor::{
    LlmTextGenerator, Orchestrator, OrchestratorSettings, RunOutcome, RunRequest, Worker,
};
use crate::config::Config;
use crate::db::Database;
use crate::llm::openai::OpenAIProvider;
use crate::message_bus::MessageBus;
use crate::registry::SessionRegistry;
use crate::status::{StatusRecord, StatusStore};
use crate::vcs::git::GitFactory;
use crate::vcs::SessionFactory;
use sdk::errors::{ErrorExt, PipelineError};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Wire the production pipeline: OpenAI-compatible generation, git clones
/// under the data directory, and the given status store.
///
/// # Errors
///
/// `MissingCredential` when no API key is configured.
pub fn build_orchestrator(
    config: &Config,
    store: Arc<dyn StatusStore>,
    bus: Arc<MessageBus>,
) -> Result<Orchestrator, PipelineError> {
    let api_key = config.require_api_key()?.clone();
    let provider = OpenAIProvider::new(config.llm.openai.clone(), api_key);
    let generator = Arc::new(LlmTextGenerator::new(Arc::new(provider)));

    let factory: Arc<dyn SessionFactory> = Arc::new(GitFactory::new(config.sessions_dir()));
    let registry = Arc::new(SessionRegistry::with_factory(Arc::clone(&factory)));

    Ok(Orchestrator::new(
        registry,
        factory,
        generator,
        store,
        bus,
        OrchestratorSettings::from(config),
    ))
}

/// Run an instruction and wait for the terminal state
///
/// Ctrl-C cancels the run; teardown and the terminal status write still happen.
pub async fn handle_run(
    instruction: String,
    repo: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let repo_url = repo
        .or_else(|| config.repo.url.clone())
        .ok_or_else(|| anyhow::anyhow!("No repository URL. Pass --repo or set ANVIL_REPO_URL"))?;

    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;
    let store: Arc<dyn StatusStore> = Arc::new(database.results());

    let orchestrator = build_orchestrator(config, store, Arc::new(MessageBus::new()))?;
    let worker = Worker::start(
        Arc::new(orchestrator),
        config.worker.task_queue.clone(),
        config.worker.queue_capacity,
    );

    let request = RunRequest::new(instruction, repo_url).with_credentials(config.git_credentials());
    let session_id = worker.submit(request).await?;

    match format {
        OutputFormat::Text => println!("Session: {}", session_id),
        OutputFormat::Json => {
            let output = json!({ "session_id": session_id, "status": "PENDING" });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    let outcome = tokio::select! {
        outcome = worker.wait(&session_id) => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupt received, cancelling run");
            worker.cancel(&session_id).await;
            worker.wait(&session_id).await
        }
    };

    worker.shutdown().await;
    database.close().await?;

    let outcome = outcome.ok_or_else(|| anyhow::anyhow!("Run {} ended without an outcome", session_id))?;
    print_outcome(&outcome, format)?;

    match outcome.error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn print_outcome(outcome: &RunOutcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => match &outcome.error {
            None => {
                println!();
                println!("✓ Run completed");
                println!("  Branch: {}", outcome.branch.as_deref().unwrap_or("-"));
                println!("  {}", outcome.message);
            }
            Some(e) => {
                println!();
                println!("✗ Run failed: {}", e);
                println!("  Kind: {}", e.kind());
                println!("  Hint: {}", e.user_hint());
                println!("  Steps finished: {}", outcome.steps.len());
            }
        },
        OutputFormat::Json => {
            let output = json!({
                "session_id": outcome.session_id,
                "run_id": outcome.run_id,
                "status": outcome.phase.to_string(),
                "branch": outcome.branch,
                "final_result": (!outcome.message.is_empty()).then_some(&outcome.message),
                "error_kind": outcome.error.as_ref().map(|e| e.kind()),
                "error_detail": outcome.error.as_ref().map(|e| e.to_string()),
                "steps": outcome.steps,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Show the status of one session
pub async fn handle_status(session_id: String, config: &Config, format: OutputFormat) -> Result<()> {
    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;

    let record = database
        .results()
        .get(&session_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Session not found: {}", session_id))?;
    let view = record.view();

    match format {
        OutputFormat::Text => {
            println!("Session: {}", view.session_id);
            println!("  Status: {}", view.status);
            if let Some(result) = &view.final_result {
                println!("  Result: {}", result);
            }
            if let Some(error) = &view.error_detail {
                println!("  Error: {}", error);
            }
            if view.is_running() {
                println!("  (still running)");
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }

    database.close().await?;
    Ok(())
}

/// Show recent runs
pub async fn handle_history(limit: usize, config: &Config, format: OutputFormat) -> Result<()> {
    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;

    let records = database
        .results()
        .recent(limit)
        .await
        .context("Failed to fetch run history")?;

    match format {
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No runs in history");
            } else {
                println!("Run History (last {} runs):", limit);
                println!();
                for record in &records {
                    print_record(record);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "runs": records,
                "count": records.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    database.close().await?;
    Ok(())
}

fn print_record(record: &StatusRecord) {
    println!("Session: {}", record.session_id);
    println!("  Prompt: {}", record.prompt);
    println!("  Status: {}", record.status);
    if !record.error_detail.is_empty() {
        println!("  Error: {}", record.error_detail);
    }

    let updated = chrono::DateTime::from_timestamp_millis(record.updated_at)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    println!("  Updated: {}", updated);
    println!();
}
