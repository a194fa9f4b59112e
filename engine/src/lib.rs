//! Anvil Engine Library
//!
//! This library provides the code-generation pipeline behind the `anvil`
//! binary. It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Secret handling module
pub mod secrets;

/// Database persistence module
pub mod db;

/// Run status records and store contract
pub mod status;

/// Message bus for run lifecycle events
pub mod message_bus;

/// LLM provider abstraction layer
pub mod llm;

/// Version-control sessions
pub mod vcs;

/// Session-scoped handle registry
pub mod registry;

/// Conductor orchestration module
pub mod conductor;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
