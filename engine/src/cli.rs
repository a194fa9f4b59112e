//! CLI interface for Anvil
//!
//! This module provides the command-line interface using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Anvil code-generation pipeline
///
/// Turns a natural-language instruction into commits on a fresh branch of a
/// git repository.
#[derive(Parser, Debug)]
#[command(name = "anvil")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an instruction against a repository and wait for the result
    Run {
        /// What to change, in plain language
        instruction: String,

        /// Repository URL (overrides ANVIL_REPO_URL)
        #[arg(long, value_name = "URL")]
        repo: Option<String>,
    },

    /// Show the status of a run
    Status {
        /// Session ID printed by `anvil run`
        session_id: String,
    },

    /// Show recent runs
    History {
        /// Number of runs to show (default: 10)
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}
