//! Conductor System
//!
//! Turns one instruction into commits on a fresh branch: planning, per-step
//! relevance and generation, commits, branch and push, with every call
//! dispatched as a retried, cancellable task invocation.

pub mod evaluator;
pub mod generator;
pub mod orchestrator;
pub mod planner;
pub mod retry;
pub mod types;
pub mod worker;

pub use evaluator::Evaluator;
pub use generator::{LlmTextGenerator, TextGenerator};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use planner::Planner;
pub use retry::{RetryPolicy, TaskRunner};
pub use types::{ChangeRequest, CommitOutcome, Plan, PlanStep, RunOutcome, RunRequest, StepRecord};
pub use worker::Worker;
