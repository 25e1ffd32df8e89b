use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::TaskId;

/// What a step does when executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Reasoning,
    ToolCall,
    Response,
    Decision,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Reasoning => "reasoning",
            StepKind::ToolCall => "tool_call",
            StepKind::Response => "response",
            StepKind::Decision => "decision",
        }
    }

    /// Parse a kind from the planner's plan output. Unknown kinds fall
    /// back to reasoning, matching how loosely-typed plans are treated.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw {
            "tool_call" => StepKind::ToolCall,
            "response" => StepKind::Response,
            "decision" => StepKind::Decision,
            _ => StepKind::Reasoning,
        }
    }
}

/// Execution status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// One atomic action within a task plan.
///
/// Steps are owned by their task (the task holds the ordered list; steps
/// carry the parent ID and ordinal, never a back-pointer). A step that has
/// reached `Completed` never regresses to `Pending`, and `attempts` only
/// increases when the same step is retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub task_id: TaskId,
    pub ordinal: usize,
    pub kind: StepKind,
    pub description: String,
    /// Input payload: prompt context for reasoning/response steps,
    /// tool parameters for tool calls.
    pub input: Value,
    /// Tool to invoke, for `ToolCall` steps
    pub tool_name: Option<String>,
    /// Enumerated options, for `Decision` steps
    pub options: Vec<String>,
    /// Output payload, set once the step completes
    pub output: Option<Value>,
    pub status: StepStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(task_id: TaskId, ordinal: usize, kind: StepKind, description: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            ordinal,
            kind,
            description: description.to_string(),
            input: Value::Null,
            tool_name: None,
            options: Vec::new(),
            output: None,
            status: StepStatus::Pending,
            attempts: 0,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Create a tool-call step with its tool name and input parameters
    pub fn tool_call(
        task_id: TaskId,
        ordinal: usize,
        description: &str,
        tool_name: &str,
        tool_input: Value,
    ) -> Self {
        let mut step = Self::new(task_id, ordinal, StepKind::ToolCall, description);
        step.tool_name = Some(tool_name.to_string());
        step.input = tool_input;
        step
    }

    /// Create a decision step constrained to the given options
    pub fn decision(
        task_id: TaskId,
        ordinal: usize,
        description: &str,
        options: Vec<String>,
    ) -> Self {
        let mut step = Self::new(task_id, ordinal, StepKind::Decision, description);
        step.options = options;
        step
    }

    /// Mark the step running and count the attempt
    pub fn begin_attempt(&mut self) {
        self.status = StepStatus::Running;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn complete(&mut self, output: Value) {
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: String) {
        self.status = StepStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self) {
        self.status = StepStatus::Skipped;
        self.completed_at = Some(Utc::now());
    }
}
