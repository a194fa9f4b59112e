//! Conductor data types

use crate::status::Phase;
use crate::vcs::Credentials;
use sdk::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One instruction in a plan, numbered from 1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step: u32,
    pub instruction: String,
}

/// Ordered, immutable decomposition of the original instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    steps: Vec<PlanStep>,
}

impl Plan {
    /// Build a plan from instructions in order, numbering them 1..N.
    /// Blank instructions are skipped.
    pub fn from_instructions<I, S>(instructions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let steps = instructions
            .into_iter()
            .map(Into::into)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .enumerate()
            .map(|(i, instruction)| PlanStep {
                step: i as u32 + 1,
                instruction,
            })
            .collect();
        Self { steps }
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// What committing a step produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommitOutcome {
    /// A new commit
    Committed { id: String },
    /// Changes were written but matched the tree; head is unchanged
    Unchanged { head: String },
    /// The step generated no changes at all
    NoOp,
}

impl CommitOutcome {
    pub fn commit_id(&self) -> Option<&str> {
        match self {
            CommitOutcome::Committed { id } => Some(id),
            _ => None,
        }
    }
}

/// Everything one executed step produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u32,
    pub instruction: String,
    pub relevant_files: Vec<String>,
    pub original_content: BTreeMap<String, String>,
    pub new_content: BTreeMap<String, String>,
    pub commit: CommitOutcome,
}

/// Input for generating one step's changes
#[derive(Debug, Clone, Copy)]
pub struct ChangeRequest<'a> {
    /// The user's original instruction
    pub instruction: &'a str,
    pub step: &'a PlanStep,
    /// Relevant file path to current content
    pub files: &'a BTreeMap<String, String>,
}

/// Initiation input for one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub instruction: String,
    pub repo_url: String,
    pub credentials: Option<Credentials>,
}

impl RunRequest {
    pub fn new(instruction: impl Into<String>, repo_url: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            repo_url: repo_url.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Both the instruction and the repository URL must be non-empty
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.instruction.trim().is_empty() {
            return Err(PipelineError::Config("instruction must not be empty".into()));
        }
        if self.repo_url.trim().is_empty() {
            return Err(PipelineError::Config(
                "repository URL must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// How a run ended
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub session_id: String,
    /// Unique per orchestration; suffix of the branch name
    pub run_id: String,
    /// `Completed` or `Failed`
    pub phase: Phase,
    pub branch: Option<String>,
    /// Final result text for completed runs
    pub message: String,
    pub error: Option<PipelineError>,
    pub steps: Vec<StepRecord>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.phase == Phase::Completed
    }
}
