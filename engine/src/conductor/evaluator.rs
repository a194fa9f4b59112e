//! Conductor Evaluator
//!
//! Narrows the repository listing down to the files one plan step needs.
//! Suggestions that are not in the listing are dropped with a warning.

use crate::conductor::types::PlanStep;
use crate::llm::{strip_fences, CompletionRequest, LLMProvider, ModelTier};
use sdk::errors::PipelineError;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You are a file evaluation assistant. Given a task step and the \
list of files in a repository, answer with the paths of the files that must be read or \
modified to complete the step.\n\
Answer with a comma-separated list of paths exactly as they appear in the listing, \
or NONE if no existing file is relevant (for example when the step creates a new file). \
Do not explain.";

pub struct Evaluator {
    llm: Arc<dyn LLMProvider>,
}

impl Evaluator {
    pub fn new(llm: Arc<dyn LLMProvider>) -> Self {
        Self { llm }
    }

    /// Ask which of `files` matter for `step`
    pub async fn relevant_files(
        &self,
        step: &PlanStep,
        files: &[String],
    ) -> Result<Vec<String>, PipelineError> {
        let request = CompletionRequest::new(
            SYSTEM_PROMPT,
            format!(
                "Step: {}\n\nFiles in the repository:\n{}",
                step.instruction,
                files.join("\n")
            ),
        )
        .tier(ModelTier::Fast)
        .max_tokens(200)
        .temperature(0.1);

        let content = self.llm.complete(&request).await?;
        debug!(step = step.step, raw = %content, "evaluator response");

        Ok(filter_relevant(&parse_file_list(&content), files, step.step))
    }
}

/// Split a comma- or newline-separated answer into paths. `NONE` means empty.
pub fn parse_file_list(content: &str) -> Vec<String> {
    let body = strip_fences(content);
    if body.is_empty() || body.eq_ignore_ascii_case("none") {
        return Vec::new();
    }

    body.split([',', '\n'])
        .map(|entry| {
            entry
                .trim()
                .trim_start_matches(['-', '*'])
                .trim()
                .trim_matches(['`', '"', '\''])
                .trim_start_matches("./")
                .to_string()
        })
        .filter(|entry| !entry.is_empty() && !entry.eq_ignore_ascii_case("none"))
        .collect()
}

/// Keep only suggestions present in `listing`, in suggestion order, without duplicates.
pub fn filter_relevant(suggested: &[String], listing: &[String], step: u32) -> Vec<String> {
    let known: HashSet<&str> = listing.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut relevant = Vec::new();

    for path in suggested {
        if !known.contains(path.as_str()) {
            warn!(step, path = %path, "suggested file does not exist, ignoring");
            continue;
        }
        if seen.insert(path.as_str()) {
            relevant.push(path.clone());
        }
    }
    relevant
}
