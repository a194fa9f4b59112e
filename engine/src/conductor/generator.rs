//! Text-generation capability
//!
//! [`TextGenerator`] is the seam the orchestrator calls for its three
//! generation shapes: plan decomposition, relevance filtering and change
//! generation. [`LlmTextGenerator`] implements it over an [`LLMProvider`].

use crate::conductor::evaluator::Evaluator;
use crate::conductor::planner::Planner;
use crate::conductor::types::{ChangeRequest, Plan, PlanStep};
use crate::llm::{extract_balanced, strip_fences, CompletionRequest, LLMProvider};
use async_trait::async_trait;
use sdk::errors::PipelineError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const FILE_MARKER: &str = "--- File: ";

const CHANGES_SYSTEM_PROMPT: &str = "You are an expert code generation assistant. You apply \
one step of a larger task to a repository.\n\
Respond ONLY with a JSON object mapping each file path you create or modify to its COMPLETE \
new content, for example:\n\
{\"LICENSE\": \"MIT License\\n...\", \"src/lib.rs\": \"pub fn add(a: i32, b: i32) -> i32 { a + b }\\n\"}\n\
Paths are relative to the repository root. Respond with {} if the step needs no change.";

/// Text-generation calls the pipeline makes
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Decompose the original instruction into a plan.
    /// Malformed output is `InvalidPlanFormat`; no steps is `EmptyPlan`.
    async fn plan(&self, instruction: &str) -> Result<Plan, PipelineError>;

    /// Pick the files from `files` that `step` needs
    async fn relevant_files(
        &self,
        step: &PlanStep,
        files: &[String],
    ) -> Result<Vec<String>, PipelineError>;

    /// Produce path to new full content for one step. Empty means nothing to change.
    async fn generate_changes(
        &self,
        request: ChangeRequest<'_>,
    ) -> Result<BTreeMap<String, String>, PipelineError>;
}

/// [`TextGenerator`] backed by an LLM provider
pub struct LlmTextGenerator {
    llm: Arc<dyn LLMProvider>,
    planner: Planner,
    evaluator: Evaluator,
}

impl LlmTextGenerator {
    pub fn new(llm: Arc<dyn LLMProvider>) -> Self {
        Self {
            planner: Planner::new(Arc::clone(&llm)),
            evaluator: Evaluator::new(Arc::clone(&llm)),
            llm,
        }
    }
}

#[async_trait]
impl TextGenerator for LlmTextGenerator {
    async fn plan(&self, instruction: &str) -> Result<Plan, PipelineError> {
        self.planner.generate_plan(instruction).await
    }

    async fn relevant_files(
        &self,
        step: &PlanStep,
        files: &[String],
    ) -> Result<Vec<String>, PipelineError> {
        self.evaluator.relevant_files(step, files).await
    }

    async fn generate_changes(
        &self,
        request: ChangeRequest<'_>,
    ) -> Result<BTreeMap<String, String>, PipelineError> {
        let completion = CompletionRequest::new(CHANGES_SYSTEM_PROMPT, change_prompt(&request))
            .max_tokens(3000)
            .temperature(0.3);

        let content = self.llm.complete(&completion).await?;
        debug!(step = request.step.step, bytes = content.len(), "generator response");

        let changes = parse_changes(&content)?;
        info!(step = request.step.step, files = changes.len(), "changes generated");
        Ok(changes)
    }
}

fn change_prompt(request: &ChangeRequest<'_>) -> String {
    let mut context = String::new();
    if request.files.is_empty() {
        context.push_str(
            "No existing files were deemed relevant. You might be creating a new file.\n",
        );
    } else {
        context.push_str("Relevant file contents:\n");
        for (path, content) in request.files {
            context.push_str(&format!("--- File: {} ---\n{}\n\n", path, content));
        }
    }

    format!(
        "Overall task: {}\n\nCurrent step ({}): {}\n\n{}",
        request.instruction, request.step.step, request.step.instruction, context
    )
}

/// Parse generated changes.
///
/// Prefers a JSON object of path to content. Falls back to
/// `--- File: <path> ---` blocks, each running until the next marker.
/// Only `{}` or `NONE` mean no changes; anything else that matches neither
/// format is a `TextGeneration` error.
pub fn parse_changes(content: &str) -> Result<BTreeMap<String, String>, PipelineError> {
    let body = strip_fences(content);
    if body.is_empty() || body.eq_ignore_ascii_case("none") {
        return Ok(BTreeMap::new());
    }

    if !body.starts_with('{') && content.contains(FILE_MARKER) {
        return Ok(parse_file_blocks(content));
    }

    body.find('{')
        .and_then(|start| extract_balanced(&body[start..], '{', '}'))
        .and_then(|json| serde_json::from_str::<BTreeMap<String, String>>(json).ok())
        .ok_or_else(|| {
            warn!(bytes = body.len(), "generator output matched no known change format");
            PipelineError::TextGeneration(format!(
                "generated changes matched no known format ({} bytes)",
                body.len()
            ))
        })
}

fn parse_file_blocks(content: &str) -> BTreeMap<String, String> {
    let mut changes = BTreeMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in content.lines() {
        let header = line
            .trim()
            .strip_prefix(FILE_MARKER)
            .and_then(|rest| rest.strip_suffix("---"))
            .map(str::trim);

        if let Some(path) = header {
            if let Some((path, lines)) = current.take() {
                changes.insert(path, strip_block(&lines));
            }
            current = Some((path.to_string(), Vec::new()));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some((path, lines)) = current {
        changes.insert(path, strip_block(&lines));
    }
    changes
}

/// Join a block's lines, dropping a surrounding code fence and trailing blank lines.
fn strip_block(lines: &[&str]) -> String {
    let mut lines = lines.to_vec();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    if lines.first().is_some_and(|l| l.trim_start().starts_with("```"))
        && lines.last().is_some_and(|l| l.trim() == "```")
        && lines.len() >= 2
    {
        lines.remove(0);
        lines.pop();
    }
    let mut joined = lines.join("\n");
    joined.push('\n');
    joined
}
