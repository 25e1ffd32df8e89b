// Step executor: runs one step of a task plan

//! # Step Executor
//!
//! Executes a single step against the breaker-guarded reasoning client
//! or the tool registry:
//!
//! - `reasoning` / `response` steps prompt the provider, injecting the
//!   outputs of previously completed steps as context.
//! - `tool_call` steps validate parameters against the tool's declared
//!   schema before invocation; validation failures never run the tool.
//! - `decision` steps ask the provider to choose among enumerated
//!   options and must resolve to exactly one of them.
//!
//! Every invocation is appended to the audit trail (component, step,
//! duration, outcome) before control returns — on the failure path too.
//! Cancellation is observed at the provider/tool await, the executor's
//! only suspension points.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::engine::tools::{ToolError, ToolRegistry};
use crate::models::{Step, StepKind, TaskId};
use crate::provider::{BreakerClient, CallError, ReasoningRequest};

/// Failure of a single step attempt.
///
/// All variants except `CircuitOpen` and `Cancelled` are retriable up to
/// the step's retry budget. `CircuitOpen` fails the step immediately
/// without consuming the budget; `Cancelled` ends the task.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("tool validation failed: {0}")]
    ToolValidation(String),

    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("ambiguous decision: {0}")]
    AmbiguousDecision(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("circuit open: {0}")]
    CircuitOpen(String),

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether the step may be retried after this error
    pub fn is_retriable(&self) -> bool {
        !matches!(self, StepError::CircuitOpen(_) | StepError::Cancelled)
    }

    /// Stable error kind recorded on the task's error record
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::ToolValidation(_) => "tool_validation",
            StepError::ToolExecution(_) => "tool_execution",
            StepError::ToolNotFound(_) => "tool_not_found",
            StepError::AmbiguousDecision(_) => "ambiguous_decision",
            StepError::Provider(_) => "provider",
            StepError::CircuitOpen(_) => "circuit_open",
            StepError::Cancelled => "cancelled",
        }
    }
}

impl From<ToolError> for StepError {
    fn from(error: ToolError) -> Self {
        match error {
            ToolError::NotFound(msg) => StepError::ToolNotFound(msg),
            ToolError::Validation(msg) => StepError::ToolValidation(msg),
            ToolError::Execution(msg) => StepError::ToolExecution(msg),
        }
    }
}

impl From<CallError> for StepError {
    fn from(error: CallError) -> Self {
        match error {
            CallError::CircuitOpen { endpoint } => StepError::CircuitOpen(endpoint),
            CallError::Operation(provider_error) => StepError::Provider(provider_error.to_string()),
        }
    }
}

/// One audit-trail entry
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub component: &'static str,
    pub task_id: TaskId,
    pub step_id: Uuid,
    pub step_ordinal: usize,
    pub outcome: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Append-only audit trail of step invocations
#[derive(Default)]
pub struct AuditLog {
    records: RwLock<Vec<AuditRecord>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, record: AuditRecord) {
        info!(
            component = record.component,
            task_id = %record.task_id,
            step = record.step_ordinal,
            outcome = %record.outcome,
            duration_ms = record.duration_ms,
            "step audited"
        );
        self.records.write().await.push(record);
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    pub async fn records_for_task(&self, task_id: &TaskId) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|record| &record.task_id == task_id)
            .cloned()
            .collect()
    }
}

/// Outputs of previously completed steps, keyed `step_<ordinal>`,
/// injected into provider prompts for later steps
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    outputs: Map<String, Value>,
}

impl StepContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_output(&mut self, ordinal: usize, output: Value) {
        self.outputs.insert(format!("step_{ordinal}"), output);
    }

    /// Attach the agent's prior conversation under the `conversation`
    /// key, so reasoning steps see their memory
    pub fn record_history(&mut self, turns: Value) {
        self.outputs.insert("conversation".to_string(), turns);
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    fn as_json(&self) -> Value {
        Value::Object(self.outputs.clone())
    }
}

/// Executes single steps against the provider client and tool registry
pub struct StepExecutor {
    client: Arc<BreakerClient>,
    tools: Arc<ToolRegistry>,
    audit: Arc<AuditLog>,
    tool_deadline: Duration,
}

impl StepExecutor {
    pub fn new(
        client: Arc<BreakerClient>,
        tools: Arc<ToolRegistry>,
        audit: Arc<AuditLog>,
        tool_deadline: Duration,
    ) -> Self {
        Self {
            client,
            tools,
            audit,
            tool_deadline,
        }
    }

    pub fn audit_log(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    /// Execute one attempt of a step. The audit record is written before
    /// control returns, whatever the outcome.
    pub async fn execute(
        &self,
        step: &Step,
        context: &StepContext,
        cancel: &CancellationToken,
    ) -> Result<Value, StepError> {
        let started = Instant::now();
        let result = self.run(step, context, cancel).await;

        let outcome = match &result {
            Ok(_) => "completed".to_string(),
            Err(error) => format!("failed: {error}"),
        };
        self.audit
            .append(AuditRecord {
                component: "step_executor",
                task_id: step.task_id.clone(),
                step_id: step.id,
                step_ordinal: step.ordinal,
                outcome,
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            })
            .await;

        result
    }

    async fn run(
        &self,
        step: &Step,
        context: &StepContext,
        cancel: &CancellationToken,
    ) -> Result<Value, StepError> {
        match step.kind {
            StepKind::Reasoning => {
                let prompt = self.prompt_with_context(
                    &format!("Think through and execute: {}", step.description),
                    context,
                );
                let content = self.call_provider(&prompt, cancel).await?;
                Ok(Value::String(content))
            }
            StepKind::Response => {
                let prompt = self.prompt_with_context(
                    &format!("Generate a response for: {}", step.description),
                    context,
                );
                let content = self.call_provider(&prompt, cancel).await?;
                Ok(Value::String(content))
            }
            StepKind::ToolCall => self.run_tool(step, cancel).await,
            StepKind::Decision => self.run_decision(step, context, cancel).await,
        }
    }

    async fn run_tool(&self, step: &Step, cancel: &CancellationToken) -> Result<Value, StepError> {
        let tool_name = step
            .tool_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                StepError::ToolValidation(format!(
                    "tool_call step {} declares no tool name",
                    step.ordinal
                ))
            })?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            invoked = timeout(self.tool_deadline, self.tools.invoke(tool_name, &step.input)) => {
                match invoked {
                    Ok(result) => result.map_err(StepError::from),
                    Err(_) => Err(StepError::ToolExecution(format!(
                        "{tool_name}: exceeded deadline of {:?}",
                        self.tool_deadline
                    ))),
                }
            }
        }
    }

    async fn run_decision(
        &self,
        step: &Step,
        context: &StepContext,
        cancel: &CancellationToken,
    ) -> Result<Value, StepError> {
        if step.options.is_empty() {
            return Err(StepError::AmbiguousDecision(format!(
                "decision step {} declares no options",
                step.ordinal
            )));
        }

        let prompt = self.prompt_with_context(
            &format!(
                "Decide: {}\nChoose exactly one of the following options and \
                 respond with only that option: {}",
                step.description,
                step.options.join(", ")
            ),
            context,
        );
        let content = self.call_provider(&prompt, cancel).await?;

        let chosen = Self::resolve_decision(&content, &step.options)?;
        Ok(json!({ "decision": chosen }))
    }

    /// Resolve the provider's answer to exactly one declared option.
    ///
    /// An exact (trimmed, case-insensitive) match wins; otherwise the
    /// answer must contain exactly one of the options.
    fn resolve_decision(content: &str, options: &[String]) -> Result<String, StepError> {
        let answer = content.trim();

        if let Some(exact) = options
            .iter()
            .find(|option| option.eq_ignore_ascii_case(answer))
        {
            return Ok(exact.clone());
        }

        let lowered = answer.to_lowercase();
        let contained: Vec<&String> = options
            .iter()
            .filter(|option| lowered.contains(&option.to_lowercase()))
            .collect();
        match contained.as_slice() {
            [single] => Ok((*single).clone()),
            [] => Err(StepError::AmbiguousDecision(format!(
                "response '{answer}' matches none of the options"
            ))),
            _ => Err(StepError::AmbiguousDecision(format!(
                "response '{answer}' matches multiple options"
            ))),
        }
    }

    fn prompt_with_context(&self, prompt: &str, context: &StepContext) -> String {
        if context.is_empty() {
            prompt.to_string()
        } else {
            format!(
                "{prompt}\n\nContext from previous steps: {}",
                context.as_json()
            )
        }
    }

    async fn call_provider(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, StepError> {
        let request = ReasoningRequest::from_prompt(prompt);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            result = self.client.call(&request) => {
                result.map(|response| response.content).map_err(StepError::from)
            }
        }
    }
}
