//! Error types and handling
//!
//! This module provides the run-level error taxonomy used by the Anvil engine.
//! All errors implement the `ErrorExt` trait which provides a stable kind tag,
//! a user-friendly hint, and whether retrying the same task invocation can
//! possibly succeed.
//!
//! # Security
//!
//! Error messages carried by these variants may be persisted and shown to
//! polling callers. The engine scrubs credentials out of the text before it
//! leaves the process; variants never carry raw secrets by construction.

use thiserror::Error;

/// Trait for Anvil error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All pipeline errors implement this trait.
pub trait ErrorExt {
    /// Stable, machine-readable tag for the error kind (e.g. `InvalidPlanFormat`)
    fn kind(&self) -> &'static str;

    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors are transient (network, rate limit, timeout) and may be
    /// retried by the task substrate. Non-recoverable errors are deterministic:
    /// retrying the same invocation reproduces them.
    fn is_recoverable(&self) -> bool;
}

/// Pipeline error type
///
/// Every failure a run can end with is expressed as one of these variants.
///
/// # Error Categories
///
/// - **Planning**: malformed or empty plans
/// - **Configuration**: missing credentials, invalid settings
/// - **Session**: registry misses, branch collisions
/// - **Capability**: text generation and version-control failures
/// - **Persistence**: status store failures
/// - **Substrate**: timeouts and cancellation
///
/// # Examples
///
/// ```
/// use sdk::errors::{ErrorExt, PipelineError};
///
/// let error = PipelineError::EmptyPlan;
/// assert_eq!(error.kind(), "EmptyPlan");
/// assert!(!error.is_recoverable());
///
/// let transient = PipelineError::TextGeneration("rate limit exceeded".into());
/// assert!(transient.is_recoverable());
/// ```
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    // Planning errors
    #[error("invalid plan format: {0}")]
    InvalidPlanFormat(String),

    #[error("generated plan was empty")]
    EmptyPlan,

    // Configuration errors
    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("configuration error: {0}")]
    Config(String),

    // Session errors
    #[error("no version-control session registered for session {0}")]
    SessionNotFound(String),

    #[error("branch '{0}' already exists")]
    BranchExists(String),

    // Capability errors
    #[error("text generation failed: {0}")]
    TextGeneration(String),

    #[error("text generation rejected the request: {0}")]
    TextGenerationRejected(String),

    #[error("version control failed: {0}")]
    VersionControl(String),

    #[error("version control rejected the operation: {0}")]
    VersionControlRejected(String),

    // Persistence errors
    #[error("status persistence failed: {0}")]
    Persistence(String),

    // Substrate errors
    #[error("{task} timed out after {secs}s")]
    Timeout { task: String, secs: u64 },

    #[error("run cancelled")]
    Cancelled,

    // Step wrapper
    #[error("step {step} failed: {source}")]
    Step {
        step: u32,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Wrap an error as the failure of plan step `step`.
    pub fn in_step(self, step: u32) -> Self {
        match self {
            already @ PipelineError::Step { .. } => already,
            other => PipelineError::Step {
                step,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through step wrappers.
    pub fn root(&self) -> &PipelineError {
        match self {
            PipelineError::Step { source, .. } => source.root(),
            other => other,
        }
    }
}

impl ErrorExt for PipelineError {
    fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPlanFormat(_) => "InvalidPlanFormat",
            Self::EmptyPlan => "EmptyPlan",
            Self::MissingCredential(_) => "MissingCredential",
            Self::Config(_) => "Config",
            Self::SessionNotFound(_) => "SessionNotFound",
            Self::BranchExists(_) => "BranchExists",
            Self::TextGeneration(_) => "TextGeneration",
            Self::TextGenerationRejected(_) => "TextGenerationRejected",
            Self::VersionControl(_) => "VersionControl",
            Self::VersionControlRejected(_) => "VersionControlRejected",
            Self::Persistence(_) => "Persistence",
            Self::Timeout { .. } => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Step { source, .. } => source.kind(),
        }
    }

    fn user_hint(&self) -> &str {
        match self {
            // Planning errors
            Self::InvalidPlanFormat(_) => "The model returned a plan that could not be parsed",
            Self::EmptyPlan => "The model returned no steps. Try a more specific instruction",

            // Configuration errors
            Self::MissingCredential(_) => "Set the required credential in the environment",
            Self::Config(_) => "Check your configuration file and environment",

            // Session errors
            Self::SessionNotFound(_) => {
                "The worker serving this run lost its repository handle. Start a new run"
            }
            Self::BranchExists(_) => "A branch with this name already exists in the repository",

            // Capability errors
            Self::TextGeneration(_) => "The text-generation provider is unavailable. Try again",
            Self::TextGenerationRejected(_) => {
                "The text-generation provider rejected the request. Check the API key and model"
            }
            Self::VersionControl(_) => "A repository operation failed. Check network access",
            Self::VersionControlRejected(_) => {
                "The repository rejected the operation. Check the URL and credentials"
            }

            // Persistence errors
            Self::Persistence(_) => "Status could not be saved. Check the database file",

            // Substrate errors
            Self::Timeout { .. } => "The operation took too long. Try again",
            Self::Cancelled => "The run was cancelled",

            Self::Step { source, .. } => source.user_hint(),
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::InvalidPlanFormat(_)
            | Self::EmptyPlan
            | Self::MissingCredential(_)
            | Self::Config(_)
            | Self::SessionNotFound(_)
            | Self::BranchExists(_)
            | Self::TextGenerationRejected(_)
            | Self::VersionControlRejected(_)
            | Self::Cancelled => false,

            Self::Step { source, .. } => source.is_recoverable(),

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
