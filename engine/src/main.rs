// Anvil code-generation pipeline
// Main entry point for the anvil binary

use anvil_engine::cli::{Cli, Command};
use anvil_engine::config::Config;
use anvil_engine::handlers::{handle_history, handle_run, handle_status, OutputFormat};
use anvil_engine::telemetry::init_telemetry_with_level;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;

    // --log wins over the configured level; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    tracing::info!(
        task_queue = %config.worker.task_queue,
        "Anvil v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    match cli.command {
        Command::Run { instruction, repo } => {
            tracing::info!("Submitting run: {}", instruction);
            handle_run(instruction, repo, &config, format).await
        }

        Command::Status { session_id } => handle_status(session_id, &config, format).await,

        Command::History { limit } => {
            tracing::info!("Showing last {} runs", limit);
            handle_history(limit, &config, format).await
        }
    }
}
