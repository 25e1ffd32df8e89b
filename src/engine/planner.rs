//! Task planning: decompose a task description into ordered steps.
//!
//! The planner asks the reasoning provider for a JSON array of steps and
//! maps it onto the step model. Output that is not valid JSON degrades
//! to a single reasoning step carrying the raw text; an **empty** plan
//! is a hard planning error — a task with zero steps never starts
//! running.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::models::{Step, StepKind, Task};
use crate::provider::{BreakerClient, ReasoningRequest};
use crate::{ConductorError, Result};

/// One entry in the provider's plan output
#[derive(Debug, Deserialize)]
struct PlanEntry {
    #[serde(default)]
    description: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    tool_input: Option<Value>,
    #[serde(default)]
    options: Vec<String>,
}

/// Provider-backed task planner
pub struct Planner {
    client: Arc<BreakerClient>,
}

impl Planner {
    pub fn new(client: Arc<BreakerClient>) -> Self {
        Self { client }
    }

    /// Decompose the task description into an ordered, non-empty plan
    pub async fn plan(&self, task: &Task) -> Result<Vec<Step>> {
        let prompt = format!(
            "Analyze the following task and create a step-by-step execution plan. \
             Return a JSON array of steps, where each step has: \
             \"description\" (what to do), \
             \"type\" (one of: reasoning, tool_call, response, decision), \
             and optionally \"tool_name\" and \"tool_input\" for tool_call steps \
             and \"options\" for decision steps.\n\n\
             Task: {}\n\n\
             Respond with ONLY a JSON array of steps, no other text.",
            task.description
        );

        let response = self
            .client
            .call(&ReasoningRequest::from_prompt(&prompt))
            .await
            .map_err(|error| ConductorError::Planning(format!("provider call failed: {error}")))?;

        let entries = Self::parse_plan(&response.content);
        if entries.is_empty() {
            return Err(ConductorError::Planning(format!(
                "task '{}' decomposed to zero steps",
                task.id
            )));
        }

        Ok(entries
            .into_iter()
            .enumerate()
            .map(|(ordinal, entry)| Self::entry_to_step(task, ordinal, entry))
            .collect())
    }

    fn entry_to_step(task: &Task, ordinal: usize, entry: PlanEntry) -> Step {
        let kind = entry
            .kind
            .as_deref()
            .map(StepKind::parse_lenient)
            .unwrap_or(StepKind::Reasoning);

        match kind {
            StepKind::ToolCall => Step::tool_call(
                task.id.clone(),
                ordinal,
                &entry.description,
                entry.tool_name.as_deref().unwrap_or(""),
                entry.tool_input.unwrap_or_else(|| Value::Object(Default::default())),
            ),
            StepKind::Decision => {
                Step::decision(task.id.clone(), ordinal, &entry.description, entry.options)
            }
            kind => Step::new(task.id.clone(), ordinal, kind, &entry.description),
        }
    }

    /// Parse the plan response, stripping markdown fences. Unparseable
    /// output becomes a single reasoning step over the raw text.
    fn parse_plan(response: &str) -> Vec<PlanEntry> {
        let cleaned = strip_fences(response);
        match serde_json::from_str::<Vec<PlanEntry>>(cleaned) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(%error, "could not parse plan response as JSON, falling back");
                vec![PlanEntry {
                    description: response.trim().to_string(),
                    kind: Some("reasoning".to_string()),
                    tool_name: None,
                    tool_input: None,
                    options: Vec::new(),
                }]
            }
        }
    }
}

/// Strip surrounding ```json fences the provider may add
fn strip_fences(text: &str) -> &str {
    let mut text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    if let Some(stripped) = text.strip_suffix("```") {
        text = stripped;
    }
    text.trim()
}
