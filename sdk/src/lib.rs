//! Anvil SDK
//!
//! Shared library providing the error taxonomy used by the engine and by
//! anything that interprets run outcomes (CLI, pollers, retry policies).

/// Error types and handling
pub mod errors;

// Re-export commonly used types
pub use errors::{ErrorExt, PipelineError};
