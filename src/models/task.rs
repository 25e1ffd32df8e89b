use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{AgentId, Step, StepStatus};

/// Unique identifier for a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle status.
///
/// Transitions run one way: `Pending -> Planning -> Running -> terminal`.
/// The only repetition allowed is retrying the current step while
/// `Running`; terminal states are immutable apart from audit appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Planning,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Structured error attached to a failed task: what kind of failure, the
/// step it happened on, and when. Exposed unchanged through status reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorRecord {
    pub kind: String,
    pub message: String,
    pub step_ordinal: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

impl TaskErrorRecord {
    pub fn new(kind: &str, message: String, step_ordinal: Option<usize>) -> Self {
        Self {
            kind: kind.to_string(),
            message,
            step_ordinal,
            timestamp: Utc::now(),
        }
    }
}

/// A unit of work decomposed into ordered steps and tracked to a terminal
/// state. Mutated exclusively by its owning task state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub agent_id: AgentId,
    pub user_id: Option<String>,
    pub description: String,
    pub status: TaskStatus,
    pub steps: Vec<Step>,
    /// Index of the step currently being executed. Monotonically
    /// non-decreasing while the task is `Running`.
    pub current_step: usize,
    pub result: Option<Value>,
    pub error: Option<TaskErrorRecord>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(agent_id: AgentId, description: &str) -> Self {
        Self {
            id: TaskId::generate(),
            agent_id,
            user_id: None,
            description: description.to_string(),
            status: TaskStatus::Pending,
            steps: Vec::new(),
            current_step: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn begin_planning(&mut self) {
        self.status = TaskStatus::Planning;
    }

    /// Attach the planned steps and move to `Running`
    pub fn begin_running(&mut self, steps: Vec<Step>) {
        self.steps = steps;
        self.current_step = 0;
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Advance the current-step cursor. The cursor never moves backwards
    /// while running; retries stay on the same index.
    pub fn advance_to(&mut self, ordinal: usize) {
        debug_assert!(ordinal >= self.current_step);
        self.current_step = ordinal;
    }

    pub fn complete(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: TaskErrorRecord) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Ordinal of the first step that has not completed, used when
    /// resuming from a checkpoint. `None` when every step completed.
    pub fn first_incomplete_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.status != StepStatus::Completed)
    }

    /// Percentage of steps entered so far, published with progress events
    pub fn progress_pct(&self) -> u8 {
        if self.steps.is_empty() {
            return 0;
        }
        ((self.current_step * 100) / self.steps.len().max(1)).min(100) as u8
    }

    /// Outputs of completed steps, readable even after a later failure
    pub fn partial_outputs(&self) -> Vec<Value> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| s.output.clone())
            .collect()
    }
}
