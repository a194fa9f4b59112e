//! Conductor Planner
//!
//! Asks the LLM to break the user's instruction into ordered steps and parses
//! the answer into a [`Plan`]. Parsing is strict: anything that is not a JSON
//! array of steps is an `InvalidPlanFormat`, and a plan without steps is an
//! `EmptyPlan`. Neither is retried, since the same prompt reproduces the same
//! output.

use crate::conductor::types::Plan;
use crate::llm::{extract_balanced, strip_fences, CompletionRequest, LLMProvider};
use sdk::errors::PipelineError;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

const SYSTEM_PROMPT: &str = "You are a planning assistant that breaks down code generation \
tasks into simple, ordered steps. Each step must be a single concrete change to the repository.\n\
Output ONLY a JSON array. Each element is an object with:\n\
- \"step\": the 1-based step number\n\
- \"instruction\": what to change in this step\n\n\
Example output:\n\
[{\"step\":1,\"instruction\":\"Create a LICENSE file containing the MIT license text\"},\
{\"step\":2,\"instruction\":\"Mention the license in README.md\"}]\n\n\
Output ONLY the JSON array, no explanation.";

pub struct Planner {
    llm: Arc<dyn LLMProvider>,
}

/// Intermediate deserialization type for LLM JSON output
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPlanStep {
    Text(String),
    Object {
        step: Option<u32>,
        #[serde(alias = "description")]
        instruction: String,
    },
}

impl Planner {
    pub fn new(llm: Arc<dyn LLMProvider>) -> Self {
        Self { llm }
    }

    /// Generate the plan for `instruction`
    pub async fn generate_plan(&self, instruction: &str) -> Result<Plan, PipelineError> {
        let request = CompletionRequest::new(
            SYSTEM_PROMPT,
            format!("Break down this task into steps:\n\n{}", instruction),
        )
        .max_tokens(500)
        .temperature(0.2);

        let content = self.llm.complete(&request).await?;
        debug!(raw = %content, "planner response");

        let plan = parse_plan(&content)?;
        info!(steps = plan.len(), "plan generated");
        Ok(plan)
    }
}

/// Parse LLM output into a plan.
///
/// Accepts a JSON array of `{"step", "instruction"}` objects or of plain
/// strings, optionally wrapped in a markdown fence or surrounded by prose.
/// Objects carrying step numbers are ordered by them; steps are then
/// renumbered 1..N.
pub fn parse_plan(content: &str) -> Result<Plan, PipelineError> {
    let body = strip_fences(content);

    let start = body
        .find('[')
        .ok_or_else(|| PipelineError::InvalidPlanFormat("expected a JSON array of steps".into()))?;
    let array = extract_balanced(&body[start..], '[', ']')
        .ok_or_else(|| PipelineError::InvalidPlanFormat("unterminated JSON array".into()))?;

    let raw: Vec<RawPlanStep> = serde_json::from_str(array)
        .map_err(|e| PipelineError::InvalidPlanFormat(e.to_string()))?;

    let mut numbered: Vec<(Option<u32>, String)> = raw
        .into_iter()
        .map(|step| match step {
            RawPlanStep::Text(text) => (None, text),
            RawPlanStep::Object { step, instruction } => (step, instruction),
        })
        .collect();

    if numbered.iter().all(|(n, _)| n.is_some()) {
        numbered.sort_by_key(|(n, _)| *n);
    }

    let plan = Plan::from_instructions(numbered.into_iter().map(|(_, text)| text));
    if plan.is_empty() {
        return Err(PipelineError::EmptyPlan);
    }
    Ok(plan)
}
