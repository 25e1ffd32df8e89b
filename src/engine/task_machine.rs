// Task state machine: owns the task lifecycle from creation to terminal state

//! # Task State Machine
//!
//! Drives a task through `pending -> planning -> running` to a terminal
//! state. Planning decomposes the description into an ordered, non-empty
//! plan (zero steps is a hard planning failure — the task never starts
//! running). Running executes steps strictly in plan order, applying the
//! per-step retry budget with exponential backoff, and persists a
//! checkpoint after every completed step **before** advancing, so that
//! resuming after a crash re-enters at the first non-completed step.
//!
//! ## Cancellation
//!
//! Cancellation is cooperative. Between steps the task transitions to
//! `cancelled` immediately; mid-step the token is observed at the
//! executor's next suspension point, the in-flight step is marked failed
//! with reason `cancelled`, and no further steps run. In-flight provider
//! calls are never forcefully terminated; their results are discarded.
//!
//! ## Failure
//!
//! A step that exhausts its retry budget fails the task: the structured
//! error is recorded on the task, the registered error branch (a
//! recovery step or event) is triggered, and `ErrorOccurred` plus
//! `TaskCompleted` events are published. Errors never propagate past the
//! task boundary; completed step outputs stay readable after failure.

use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RetryPolicy;
use crate::context::ContextStore;
use crate::engine::executor::{StepContext, StepError, StepExecutor};
use crate::engine::planner::Planner;
use crate::engine::router::EventRouter;
use crate::models::{
    AgentId, AgentStatus, Event, StepKind, StepStatus, Task, TaskErrorRecord, TaskId, TaskStatus,
    Turn,
};
use crate::storage::TaskStore;
use crate::{ConductorError, Result};

/// Registered error branch, triggered when a step exhausts its budget
#[derive(Debug, Clone)]
pub enum RecoveryBranch {
    /// Execute a designated recovery step (its outcome is recorded but
    /// cannot resurrect the failed task)
    Step {
        kind: StepKind,
        description: String,
    },
    /// Publish a designated event
    Event { source: String, detail_type: String },
}

/// Owns task lifecycles. One instance can drive many tasks; each task is
/// mutated exclusively by the machine that is driving it.
pub struct TaskStateMachine {
    tasks: TaskStore,
    context: Arc<ContextStore>,
    planner: Arc<Planner>,
    executor: Arc<StepExecutor>,
    router: Arc<EventRouter>,
    step_retry: RetryPolicy,
    recovery: Option<RecoveryBranch>,
    running: DashMap<TaskId, CancellationToken>,
}

impl TaskStateMachine {
    pub fn new(
        tasks: TaskStore,
        context: Arc<ContextStore>,
        planner: Arc<Planner>,
        executor: Arc<StepExecutor>,
        router: Arc<EventRouter>,
        step_retry: RetryPolicy,
    ) -> Self {
        Self {
            tasks,
            context,
            planner,
            executor,
            router,
            step_retry,
            recovery: None,
            running: DashMap::new(),
        }
    }

    /// Register the error branch triggered on task failure
    pub fn with_recovery(mut self, recovery: RecoveryBranch) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Persist and announce a new task, then drive it to a terminal
    /// state. Returns the finished task.
    pub async fn start(&self, task: Task) -> Result<Task> {
        self.tasks.create(&task).await?;
        self.router
            .publish(Event::task_created(&task.id, &task.agent_id, &task.description)?)
            .await?;
        self.run(task).await
    }

    /// Resume a checkpointed task after a crash. Completed steps are
    /// never re-executed; execution re-enters at the first non-completed
    /// step. A task already in a terminal state is returned as-is.
    pub async fn resume_from_checkpoint(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
    ) -> Result<Task> {
        let task = self
            .tasks
            .load(agent_id, task_id)
            .await?
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        info!(task_id = %task_id, status = task.status.as_str(), "resuming task from checkpoint");
        self.run(task).await
    }

    /// Request cooperative cancellation.
    ///
    /// A live task observes the token at its next suspension point. A
    /// checkpointed task that is not currently being driven is marked
    /// cancelled directly; terminal tasks are left untouched.
    pub async fn cancel(&self, agent_id: &AgentId, task_id: &TaskId) -> Result<()> {
        if let Some(token) = self.running.get(task_id) {
            token.cancel();
            return Ok(());
        }

        let mut task = self
            .tasks
            .load(agent_id, task_id)
            .await?
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        task.cancel();
        self.tasks.checkpoint(&task).await?;
        self.router
            .publish(Event::task_completed(
                &task.id,
                &task.agent_id,
                TaskStatus::Cancelled,
                None,
            )?)
            .await?;
        Ok(())
    }

    /// Status read for the caller-facing control surface. Failed tasks
    /// expose their structured error and any completed step outputs.
    pub async fn get_task(&self, agent_id: &AgentId, task_id: &TaskId) -> Result<Task> {
        self.tasks
            .load(agent_id, task_id)
            .await?
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))
    }

    async fn run(&self, mut task: Task) -> Result<Task> {
        let cancel = CancellationToken::new();
        self.running.insert(task.id.clone(), cancel.clone());
        let outcome = self.drive(&mut task, &cancel).await;
        self.running.remove(&task.id);
        outcome.map(|()| task)
    }

    async fn drive(&self, task: &mut Task, cancel: &CancellationToken) -> Result<()> {
        self.router
            .publish(Event::agent_status_changed(
                &task.agent_id,
                AgentStatus::Idle,
                AgentStatus::Processing,
            )?)
            .await?;

        if !matches!(task.status, TaskStatus::Running) {
            task.begin_planning();
            self.tasks.checkpoint(task).await?;

            match self.planner.plan(task).await {
                Ok(steps) => {
                    task.begin_running(steps);
                    self.tasks.checkpoint(task).await?;
                }
                Err(error) => {
                    return self
                        .fail_task(
                            task,
                            TaskErrorRecord::new("planning", error.to_string(), None),
                        )
                        .await;
                }
            }
        }

        // Rebuild accumulated step outputs when resuming
        let mut context = StepContext::new();
        for step in task.steps.iter().filter(|s| s.status == StepStatus::Completed) {
            if let Some(output) = &step.output {
                context.record_output(step.ordinal, output.clone());
            }
        }

        // Prior conversation from the context store (cache-aside read);
        // a load failure degrades to running without memory
        match self.context.load(&task.agent_id).await {
            Ok(agent_context) if agent_context.size_metric() > 0 => {
                if let Ok(history) = serde_json::to_value(&agent_context.turns) {
                    context.record_history(history);
                }
            }
            Ok(_) => {}
            Err(error) => {
                warn!(task_id = %task.id, %error, "failed to load agent context");
            }
        }

        let total_steps = task.steps.len();
        while let Some(ordinal) = task.first_incomplete_step() {
            // Between-steps cancellation point
            if cancel.is_cancelled() {
                return self.cancel_task(task).await;
            }

            task.advance_to(ordinal);
            self.router
                .publish(Event::task_progress(
                    &task.id,
                    &task.agent_id,
                    task.progress_pct(),
                    Some(&format!("Executing step {}/{total_steps}", ordinal + 1)),
                )?)
                .await?;

            match self.execute_with_retries(task, ordinal, &context, cancel).await {
                Ok(output) => {
                    task.steps[ordinal].complete(output.clone());
                    context.record_output(ordinal, output);
                    // Checkpoint before advancing: a crash after this
                    // point resumes at the next step
                    self.tasks.checkpoint(task).await?;
                }
                Err(StepError::Cancelled) => {
                    task.steps[ordinal].fail(StepError::Cancelled.to_string());
                    return self.cancel_task(task).await;
                }
                Err(error) => {
                    let record =
                        TaskErrorRecord::new(error.kind(), error.to_string(), Some(ordinal));
                    task.steps[ordinal].fail(error.to_string());
                    return self.fail_task(task, record).await;
                }
            }
        }

        let result = json!({ "steps": task.partial_outputs() });
        task.complete(result.clone());
        self.tasks.checkpoint(task).await?;
        self.record_conversation(task).await;

        self.router
            .publish(Event::task_progress(
                &task.id,
                &task.agent_id,
                100,
                Some("Task completed"),
            )?)
            .await?;
        self.router
            .publish(Event::task_completed(
                &task.id,
                &task.agent_id,
                TaskStatus::Completed,
                Some(result),
            )?)
            .await?;
        self.publish_idle(&task.agent_id).await?;

        info!(task_id = %task.id, steps = total_steps, "task completed");
        Ok(())
    }

    /// Execute one step until success, exhausted retry budget, or a
    /// non-retriable failure. The step's attempt counter only ever
    /// increases for retries of this same step.
    async fn execute_with_retries(
        &self,
        task: &mut Task,
        ordinal: usize,
        context: &StepContext,
        cancel: &CancellationToken,
    ) -> std::result::Result<serde_json::Value, StepError> {
        loop {
            task.steps[ordinal].begin_attempt();
            let step = task.steps[ordinal].clone();

            match self.executor.execute(&step, context, cancel).await {
                Ok(output) => return Ok(output),
                Err(error) => {
                    let attempts = task.steps[ordinal].attempts;
                    if error.is_retriable() && attempts < self.step_retry.max_attempts {
                        let delay = self.step_retry.delay_for(attempts);
                        warn!(
                            task_id = %task.id,
                            step = ordinal,
                            attempts,
                            ?delay,
                            %error,
                            "step failed, retrying"
                        );
                        sleep(delay).await;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    async fn fail_task(&self, task: &mut Task, record: TaskErrorRecord) -> Result<()> {
        warn!(
            task_id = %task.id,
            kind = %record.kind,
            step = ?record.step_ordinal,
            "task failed: {}",
            record.message
        );
        let error_code = record.kind.clone();
        let error_message = record.message.clone();
        task.fail(record);
        self.tasks.checkpoint(task).await?;
        self.record_conversation(task).await;

        self.run_recovery(task).await;

        self.router
            .publish(Event::error_occurred(
                &error_code,
                &error_message,
                Some(&task.agent_id),
                Some(&task.id),
            )?)
            .await?;
        self.router
            .publish(Event::task_completed(
                &task.id,
                &task.agent_id,
                TaskStatus::Failed,
                Some(json!({ "error": error_message })),
            )?)
            .await?;
        self.publish_idle(&task.agent_id).await?;
        Ok(())
    }

    async fn cancel_task(&self, task: &mut Task) -> Result<()> {
        info!(task_id = %task.id, "task cancelled");
        task.cancel();
        self.tasks.checkpoint(task).await?;
        self.router
            .publish(Event::task_completed(
                &task.id,
                &task.agent_id,
                TaskStatus::Cancelled,
                None,
            )?)
            .await?;
        self.publish_idle(&task.agent_id).await?;
        Ok(())
    }

    /// Trigger the registered error branch. Recovery failures are logged
    /// and never override the task's recorded error.
    async fn run_recovery(&self, task: &Task) {
        match &self.recovery {
            None => {}
            Some(RecoveryBranch::Event {
                source,
                detail_type,
            }) => {
                let event = Event::new(
                    source,
                    detail_type,
                    json!({
                        "taskId": task.id.as_str(),
                        "agentId": task.agent_id.as_str(),
                    }),
                );
                if let Err(error) = self.router.publish(event).await {
                    warn!(task_id = %task.id, %error, "failed to publish recovery event");
                }
            }
            Some(RecoveryBranch::Step { kind, description }) => {
                let recovery_step = crate::models::Step::new(
                    task.id.clone(),
                    task.steps.len(),
                    *kind,
                    description,
                );
                let context = StepContext::new();
                match self
                    .executor
                    .execute(&recovery_step, &context, &CancellationToken::new())
                    .await
                {
                    Ok(_) => info!(task_id = %task.id, "recovery step completed"),
                    Err(error) => {
                        warn!(task_id = %task.id, %error, "recovery step failed")
                    }
                }
            }
        }
    }

    /// Append the task exchange to the agent's durable conversation.
    /// Context write failures degrade to a warning; the task outcome is
    /// already durable.
    async fn record_conversation(&self, task: &Task) {
        let outputs = serde_json::to_string(&task.partial_outputs()).unwrap_or_default();
        for turn in [Turn::user(&task.description), Turn::assistant(&outputs)] {
            if let Err(error) = self.context.append_turn(&task.agent_id, turn).await {
                warn!(task_id = %task.id, %error, "failed to record conversation turn");
                return;
            }
        }
    }

    async fn publish_idle(&self, agent_id: &AgentId) -> Result<()> {
        self.router
            .publish(Event::agent_status_changed(
                agent_id,
                AgentStatus::Processing,
                AgentStatus::Idle,
            )?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerSettings, ContextSettings, RetryPolicy};
    use crate::engine::executor::AuditLog;
    use crate::engine::router::EventHandler;
    use crate::engine::tools::{ParameterKind, Tool, ToolParameter};
    use crate::models::{detail_types, sources, EventPattern, Step};
    use crate::provider::{
        BreakerClient, BreakerRegistry, MockProvider, ProviderError, ProviderResult,
        ReasoningProvider, ReasoningRequest, ReasoningResponse,
    };
    use crate::storage::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct FetchTool {
        invocations: AtomicU32,
    }

    impl FetchTool {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                invocations: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Tool for FetchTool {
        fn name(&self) -> &str {
            "fetch"
        }

        fn description(&self) -> &str {
            "Fetch data"
        }

        fn parameters(&self) -> Vec<ToolParameter> {
            vec![ToolParameter::optional("url", ParameterKind::String)]
        }

        async fn invoke(&self, _params: &Value) -> anyhow::Result<Value> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"data": "X"}))
        }
    }

    struct EventCapture {
        seen: Mutex<Vec<Event>>,
    }

    impl EventCapture {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        async fn seen(&self) -> Vec<Event> {
            self.seen.lock().await.clone()
        }
    }

    #[async_trait]
    impl EventHandler for EventCapture {
        async fn handle(&self, event: &Event) -> anyhow::Result<()> {
            self.seen.lock().await.push(event.clone());
            Ok(())
        }
    }

    struct Fixture {
        machine: TaskStateMachine,
        router: Arc<EventRouter>,
        store: Arc<InMemoryStore>,
        tool: Arc<FetchTool>,
        audit: Arc<AuditLog>,
    }

    /// Wire a machine over one shared in-memory store. The breaker
    /// client gets a single in-client attempt so step-level retries are
    /// what the tests observe.
    async fn fixture(provider: Arc<dyn ReasoningProvider>, step_retry: RetryPolicy) -> Fixture {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        fixture_over(store, provider, step_retry).await
    }

    async fn fixture_over(
        store: Arc<InMemoryStore>,
        provider: Arc<dyn ReasoningProvider>,
        step_retry: RetryPolicy,
    ) -> Fixture {
        let registry = Arc::new(BreakerRegistry::new(BreakerSettings {
            failure_threshold: 100,
            ..BreakerSettings::default()
        }));
        let client = Arc::new(BreakerClient::new(
            provider,
            registry,
            RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            Duration::from_secs(5),
        ));
        let audit = Arc::new(AuditLog::new());
        let tool = FetchTool::new();
        let tools = Arc::new(crate::engine::tools::ToolRegistry::new());
        tools.register(tool.clone());

        let router = Arc::new(
            EventRouter::new(store.clone(), RetryPolicy::default())
                .await
                .unwrap(),
        );
        let context = Arc::new(ContextStore::new(store.clone(), ContextSettings::default()));
        let executor = Arc::new(StepExecutor::new(
            client.clone(),
            tools,
            audit.clone(),
            Duration::from_secs(5),
        ));
        let machine = TaskStateMachine::new(
            TaskStore::new(store.clone()),
            context,
            Arc::new(Planner::new(client)),
            executor,
            router.clone(),
            step_retry,
        );

        Fixture {
            machine,
            router,
            store,
            tool,
            audit,
        }
    }

    fn two_step_plan() -> String {
        r#"[
            {"description": "fetch the data", "type": "tool_call",
             "tool_name": "fetch", "tool_input": {"url": "https://example.com"}},
            {"description": "summarize the fetched data", "type": "response"}
        ]"#
        .to_string()
    }

    #[tokio::test]
    async fn test_fetch_then_summarize_end_to_end() {
        // Planning returns the two-step plan; the response step echoes
        // its prompt, which carries the tool output as context
        let provider = Arc::new(MockProvider::scripted(vec![Ok(two_step_plan())]));
        let fixture = fixture(provider, RetryPolicy::default()).await;
        let completed = EventCapture::new();
        fixture
            .router
            .subscribe(
                EventPattern::new(sources::TASKS, detail_types::TASK_COMPLETED),
                completed.clone(),
            )
            .await;

        let task = Task::new(AgentId::from("agent-1"), "fetch-then-summarize");
        let finished = fixture.machine.start(task).await.unwrap();

        assert_eq!(finished.status, TaskStatus::Completed);
        assert_eq!(finished.steps.len(), 2);
        assert_eq!(finished.steps[0].output, Some(json!({"data": "X"})));

        // The final result references the tool output
        let result_text = serde_json::to_string(finished.result.as_ref().unwrap()).unwrap();
        assert!(result_text.contains("X"));

        fixture.router.dispatch_pending().await.unwrap();
        let seen = completed.seen().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].detail["status"], "completed");
    }

    #[tokio::test]
    async fn test_steps_execute_in_ascending_order() {
        let plan = r#"[
            {"description": "first", "type": "reasoning"},
            {"description": "second", "type": "reasoning"},
            {"description": "third", "type": "response"}
        ]"#;
        let provider = Arc::new(MockProvider::scripted(vec![Ok(plan.to_string())]));
        let fixture = fixture(provider, RetryPolicy::default()).await;

        let task = Task::new(AgentId::from("agent-1"), "three things");
        let finished = fixture.machine.start(task).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);

        // The audit trail shows strict plan order; a step only starts
        // after its predecessor reached a terminal state
        let records = fixture.audit.records_for_task(&finished.id).await;
        let ordinals: Vec<usize> = records.iter().map(|r| r.step_ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_zero_step_plan_fails_without_running() {
        let provider = Arc::new(MockProvider::fixed("[]"));
        let fixture = fixture(provider, RetryPolicy::default()).await;

        let task = Task::new(AgentId::from("agent-1"), "impossible");
        let finished = fixture.machine.start(task).await.unwrap();

        assert_eq!(finished.status, TaskStatus::Failed);
        assert!(finished.steps.is_empty());
        let error = finished.error.unwrap();
        assert_eq!(error.kind, "planning");
        // No step was ever attempted
        assert!(fixture.audit.records().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeout_exhausts_step_attempts() {
        // Planning succeeds, then every step attempt times out
        let provider = Arc::new(MockProvider::scripted(vec![
            Ok(r#"[{"description": "think", "type": "reasoning"}]"#.to_string()),
            Err(ProviderError::Timeout("attempt 1".into())),
            Err(ProviderError::Timeout("attempt 2".into())),
            Err(ProviderError::Timeout("attempt 3".into())),
        ]));
        let fixture = fixture(provider.clone(), RetryPolicy::default()).await;
        let errors = EventCapture::new();
        fixture
            .router
            .subscribe(
                EventPattern::new(sources::ERRORS, detail_types::ERROR_OCCURRED),
                errors.clone(),
            )
            .await;

        let task = Task::new(AgentId::from("agent-1"), "slow provider");
        let finished = fixture.machine.start(task).await.unwrap();

        assert_eq!(finished.status, TaskStatus::Failed);
        assert_eq!(finished.steps[0].attempts, 3);
        assert_eq!(finished.steps[0].status, StepStatus::Failed);
        // One planning call plus three step attempts
        assert_eq!(provider.calls(), 4);

        fixture.router.dispatch_pending().await.unwrap();
        let seen = errors.seen().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].detail["taskId"], finished.id.as_str());
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_steps() {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::echo());
        let fixture = fixture_over(store, provider.clone(), RetryPolicy::default()).await;

        // Hand-craft the state a crash would leave behind: step 0
        // completed and checkpointed, step 1 never started
        let mut task = Task::new(AgentId::from("agent-1"), "resumable");
        let steps = vec![
            Step::tool_call(
                task.id.clone(),
                0,
                "fetch the data",
                "fetch",
                json!({"url": "https://example.com"}),
            ),
            Step::new(task.id.clone(), 1, StepKind::Response, "summarize"),
        ];
        task.begin_planning();
        task.begin_running(steps);
        task.steps[0].begin_attempt();
        task.steps[0].complete(json!({"data": "X"}));
        task.advance_to(1);
        let tasks = TaskStore::new(fixture.store.clone());
        tasks.create(&task).await.unwrap();

        let finished = fixture
            .machine
            .resume_from_checkpoint(&task.agent_id, &task.id)
            .await
            .unwrap();

        assert_eq!(finished.status, TaskStatus::Completed);
        // The completed tool step was not re-executed
        assert_eq!(fixture.tool.invocations.load(Ordering::SeqCst), 0);
        // Only the response step contacted the provider; its prompt
        // carried the checkpointed output forward
        assert_eq!(provider.calls(), 1);
        let response_output = finished.steps[1].output.as_ref().unwrap();
        assert!(response_output.as_str().unwrap().contains("X"));
    }

    #[tokio::test]
    async fn test_resume_of_terminal_task_is_a_no_op() {
        let provider = Arc::new(MockProvider::scripted(vec![Ok(two_step_plan())]));
        let fixture = fixture(provider.clone(), RetryPolicy::default()).await;

        let task = Task::new(AgentId::from("agent-1"), "fetch-then-summarize");
        let finished = fixture.machine.start(task).await.unwrap();
        let calls_after_run = provider.calls();

        let resumed = fixture
            .machine
            .resume_from_checkpoint(&finished.agent_id, &finished.id)
            .await
            .unwrap();
        assert_eq!(resumed.status, TaskStatus::Completed);
        assert_eq!(provider.calls(), calls_after_run);
    }

    #[tokio::test]
    async fn test_cancel_mid_step_marks_step_failed() {
        // Planning succeeds quickly; the single step then blocks until
        // cancellation arrives
        struct StallAfterPlan {
            calls: AtomicU32,
        }

        #[async_trait]
        impl ReasoningProvider for StallAfterPlan {
            fn name(&self) -> &str {
                "stall"
            }

            async fn complete(
                &self,
                _request: &ReasoningRequest,
            ) -> ProviderResult<ReasoningResponse> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Ok(ReasoningResponse::text(
                        r#"[{"description": "think", "type": "reasoning"}]"#,
                    ));
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ReasoningResponse::text("too late"))
            }
        }

        let fixture = Arc::new(
            fixture(
                Arc::new(StallAfterPlan {
                    calls: AtomicU32::new(0),
                }),
                RetryPolicy::default(),
            )
            .await,
        );

        let task = Task::new(AgentId::from("agent-1"), "cancellable");
        let agent_id = task.agent_id.clone();
        let task_id = task.id.clone();

        let driving = {
            let fixture = fixture.clone();
            tokio::spawn(async move { fixture.machine.start(task).await })
        };

        // Give the machine time to reach the provider await
        tokio::time::sleep(Duration::from_millis(100)).await;
        fixture.machine.cancel(&agent_id, &task_id).await.unwrap();

        let finished = driving.await.unwrap().unwrap();
        assert_eq!(finished.status, TaskStatus::Cancelled);
        assert_eq!(finished.steps[0].status, StepStatus::Failed);
        assert!(finished.steps[0].error.as_ref().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_checkpointed_task_between_runs() {
        let provider = Arc::new(MockProvider::echo());
        let fixture = fixture(provider, RetryPolicy::default()).await;

        let task = Task::new(AgentId::from("agent-1"), "parked");
        let tasks = TaskStore::new(fixture.store.clone());
        tasks.create(&task).await.unwrap();

        fixture
            .machine
            .cancel(&task.agent_id, &task.id)
            .await
            .unwrap();
        let loaded = fixture
            .machine
            .get_task(&task.agent_id, &task.id)
            .await
            .unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_recovery_event_branch_fires_on_failure() {
        let provider = Arc::new(MockProvider::scripted(vec![
            Ok(r#"[{"description": "think", "type": "reasoning"}]"#.to_string()),
            Err(ProviderError::InvalidRequest("malformed".into())),
        ]));
        // Single-attempt budget: the one scripted failure is fatal
        let fixture = fixture(
            provider,
            RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
        )
        .await;
        let machine = fixture
            .machine
            .with_recovery(RecoveryBranch::Event {
                source: "conductor.recovery".to_string(),
                detail_type: "TaskRecovery".to_string(),
            });

        let recoveries = EventCapture::new();
        fixture
            .router
            .subscribe(
                EventPattern::new("conductor.recovery", "TaskRecovery"),
                recoveries.clone(),
            )
            .await;

        let task = Task::new(AgentId::from("agent-1"), "doomed");
        let finished = machine.start(task).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        assert_eq!(finished.error.as_ref().unwrap().kind, "provider");

        fixture.router.dispatch_pending().await.unwrap();
        let seen = recoveries.seen().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].detail["taskId"], finished.id.as_str());
    }

    #[tokio::test]
    async fn test_second_task_sees_recorded_conversation() {
        let plan = r#"[{"description": "work it out", "type": "reasoning"}]"#;
        let provider = Arc::new(MockProvider::scripted(vec![
            Ok(plan.to_string()),
            Ok("the moon is full".to_string()),
            Ok(plan.to_string()),
            // Second task's step falls through to echo
        ]));
        let fixture = fixture(provider, RetryPolicy::default()).await;

        let first = Task::new(AgentId::from("agent-1"), "observe the sky");
        fixture.machine.start(first).await.unwrap();

        let second = Task::new(AgentId::from("agent-1"), "recall the observation");
        let finished = fixture.machine.start(second).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);

        // The first exchange was appended to the agent's context and
        // injected into the second task's prompt
        let output = finished.steps[0].output.as_ref().unwrap();
        assert!(output.as_str().unwrap().contains("observe the sky"));
        assert!(output.as_str().unwrap().contains("the moon is full"));
    }

    #[tokio::test]
    async fn test_failed_task_keeps_partial_results_readable() {
        // Step 0 (tool) succeeds; step 1 exhausts its budget
        let provider = Arc::new(MockProvider::scripted(vec![
            Ok(two_step_plan()),
            Err(ProviderError::Unavailable("down".into())),
            Err(ProviderError::Unavailable("down".into())),
            Err(ProviderError::Unavailable("down".into())),
        ]));
        let fixture = fixture(provider, RetryPolicy::default()).await;

        let task = Task::new(AgentId::from("agent-1"), "fetch-then-summarize");
        let finished = fixture.machine.start(task).await.unwrap();

        assert_eq!(finished.status, TaskStatus::Failed);
        let status_read = fixture
            .machine
            .get_task(&finished.agent_id, &finished.id)
            .await
            .unwrap();
        assert_eq!(status_read.partial_outputs(), vec![json!({"data": "X"})]);
        let error = status_read.error.unwrap();
        assert_eq!(error.step_ordinal, Some(1));
        assert_eq!(error.kind, "provider");
    }
}
