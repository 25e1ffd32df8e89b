//! # Domain Events
//!
//! Every lifecycle change in the engine is announced as an [`Event`]:
//! an immutable envelope of source, detail-type, and an opaque JSON
//! detail payload. Events are produced by any component but consumed
//! only through the event router, which matches them against
//! [`EventPattern`] subscriptions.
//!
//! The typed constructors validate their required detail fields so a
//! malformed event is rejected at the call site instead of surfacing as
//! a delivery failure later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::{AgentId, AgentStatus, TaskId, TaskStatus};
use crate::{ConductorError, Result};

/// Event sources emitted by the engine
pub mod sources {
    pub const TASKS: &str = "conductor.tasks";
    pub const AGENTS: &str = "conductor.agents";
    pub const STATUS: &str = "conductor.status";
    pub const ERRORS: &str = "conductor.errors";
    pub const SCHEDULER: &str = "conductor.scheduler";
}

/// Detail types emitted by the engine
pub mod detail_types {
    pub const TASK_CREATED: &str = "TaskCreated";
    pub const TASK_COMPLETED: &str = "TaskCompleted";
    pub const TASK_PROGRESS: &str = "TaskProgress";
    pub const AGENT_STATUS_CHANGED: &str = "AgentStatusChanged";
    pub const ERROR_OCCURRED: &str = "ErrorOccurred";
    pub const SCHEDULED_TASK: &str = "ScheduledTask";
}

/// An immutable domain event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub source: String,
    pub detail_type: String,
    pub detail: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(source: &str, detail_type: &str, detail: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            detail_type: detail_type.to_string(),
            detail,
            timestamp: Utc::now(),
        }
    }

    /// Build a `TaskCreated` event
    pub fn task_created(task_id: &TaskId, agent_id: &AgentId, description: &str) -> Result<Self> {
        require("task_id", task_id.as_str())?;
        require("agent_id", agent_id.as_str())?;
        require("description", description)?;
        Ok(Self::new(
            sources::TASKS,
            detail_types::TASK_CREATED,
            json!({
                "taskId": task_id.as_str(),
                "agentId": agent_id.as_str(),
                "description": description,
            }),
        ))
    }

    /// Build a `TaskCompleted` event, covering every terminal status
    pub fn task_completed(
        task_id: &TaskId,
        agent_id: &AgentId,
        status: TaskStatus,
        result: Option<Value>,
    ) -> Result<Self> {
        require("task_id", task_id.as_str())?;
        require("agent_id", agent_id.as_str())?;
        if !status.is_terminal() {
            return Err(ConductorError::InvalidInput(format!(
                "TaskCompleted requires a terminal status, got '{}'",
                status.as_str()
            )));
        }
        let mut detail = json!({
            "taskId": task_id.as_str(),
            "agentId": agent_id.as_str(),
            "status": status.as_str(),
        });
        if let Some(result) = result {
            detail["result"] = result;
        }
        Ok(Self::new(sources::TASKS, detail_types::TASK_COMPLETED, detail))
    }

    /// Build a `TaskProgress` event; `progress_pct` must be 0..=100
    pub fn task_progress(
        task_id: &TaskId,
        agent_id: &AgentId,
        progress_pct: u8,
        message: Option<&str>,
    ) -> Result<Self> {
        require("task_id", task_id.as_str())?;
        require("agent_id", agent_id.as_str())?;
        if progress_pct > 100 {
            return Err(ConductorError::InvalidInput(format!(
                "progress_pct must be 0-100, got {progress_pct}"
            )));
        }
        let mut detail = json!({
            "taskId": task_id.as_str(),
            "agentId": agent_id.as_str(),
            "progressPct": progress_pct,
        });
        if let Some(message) = message {
            detail["message"] = Value::String(message.to_string());
        }
        Ok(Self::new(sources::TASKS, detail_types::TASK_PROGRESS, detail))
    }

    /// Build an `AgentStatusChanged` event
    pub fn agent_status_changed(
        agent_id: &AgentId,
        previous: AgentStatus,
        new: AgentStatus,
    ) -> Result<Self> {
        require("agent_id", agent_id.as_str())?;
        Ok(Self::new(
            sources::STATUS,
            detail_types::AGENT_STATUS_CHANGED,
            json!({
                "agentId": agent_id.as_str(),
                "previousStatus": previous.as_str(),
                "newStatus": new.as_str(),
            }),
        ))
    }

    /// Build an `ErrorOccurred` event
    pub fn error_occurred(
        error_code: &str,
        error_message: &str,
        agent_id: Option<&AgentId>,
        task_id: Option<&TaskId>,
    ) -> Result<Self> {
        require("error_code", error_code)?;
        require("error_message", error_message)?;
        let mut detail = json!({
            "errorCode": error_code,
            "errorMessage": error_message,
        });
        if let Some(agent_id) = agent_id {
            detail["agentId"] = Value::String(agent_id.as_str().to_string());
        }
        if let Some(task_id) = task_id {
            detail["taskId"] = Value::String(task_id.as_str().to_string());
        }
        Ok(Self::new(sources::ERRORS, detail_types::ERROR_OCCURRED, detail))
    }

    /// Build a `ScheduledTask` event
    pub fn scheduled_task(
        task_id: &TaskId,
        agent_id: &AgentId,
        schedule_expression: &str,
    ) -> Result<Self> {
        require("task_id", task_id.as_str())?;
        require("agent_id", agent_id.as_str())?;
        require("schedule_expression", schedule_expression)?;
        Ok(Self::new(
            sources::SCHEDULER,
            detail_types::SCHEDULED_TASK,
            json!({
                "taskId": task_id.as_str(),
                "agentId": agent_id.as_str(),
                "scheduleExpression": schedule_expression,
            }),
        ))
    }
}

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ConductorError::InvalidInput(format!(
            "'{name}' must be a non-empty string"
        )));
    }
    Ok(())
}

/// Structural pattern over event source and detail-type.
///
/// `None` on either field is a wildcard. Matching is exact otherwise;
/// an event may match any number of registered patterns (fan-out).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPattern {
    pub source: Option<String>,
    pub detail_type: Option<String>,
}

impl EventPattern {
    pub fn new(source: &str, detail_type: &str) -> Self {
        Self {
            source: Some(source.to_string()),
            detail_type: Some(detail_type.to_string()),
        }
    }

    /// Match any event from one source
    pub fn for_source(source: &str) -> Self {
        Self {
            source: Some(source.to_string()),
            detail_type: None,
        }
    }

    /// Match one detail-type from any source
    pub fn for_detail_type(detail_type: &str) -> Self {
        Self {
            source: None,
            detail_type: Some(detail_type.to_string()),
        }
    }

    /// Match every event
    pub fn any() -> Self {
        Self {
            source: None,
            detail_type: None,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        let source_ok = self
            .source
            .as_deref()
            .map_or(true, |source| source == event.source);
        let type_ok = self
            .detail_type
            .as_deref()
            .map_or(true, |detail_type| detail_type == event.detail_type);
        source_ok && type_ok
    }
}
