// Multi-agent coordinator: fan a task set across task-machine instances

//! # Multi-Agent Coordinator
//!
//! Runs a set of sub-tasks through the task state machine in `parallel`
//! (all concurrently, wait for every terminal state) or `sequential`
//! mode (next starts only after the previous completed; a failure
//! aborts the remainder unless continue-on-error is set).
//!
//! Coordination progress — which sub-tasks are in-flight or terminal —
//! is persisted after every sub-task transition, so a crash
//! mid-coordination can be resumed without re-running completed
//! sub-tasks.
//!
//! Aggregation runs a configurable reducer over the sub-task results:
//! ordered concatenation by default, or a key-merge where conflicting
//! keys resolve last-writer-by-completion-time (each conflict logged).

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::task_machine::TaskStateMachine;
use crate::models::{AgentId, Task, TaskId, TaskStatus};
use crate::storage::{keys, KeyValueStore, PutCondition, StoredItem, TaskStore};
use crate::{ConductorError, Result};

/// How sub-tasks are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationMode {
    Parallel,
    Sequential,
}

/// How sub-task results are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    /// Ordered list of sub-task results, in submission order
    Concat,
    /// Merge result objects key-by-key; conflicting keys resolve
    /// last-writer-by-completion-time
    MergeKeys,
}

/// Tracked state of one sub-task within a coordination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskRecord {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub status: TaskStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted coordination progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationRecord {
    pub id: String,
    pub mode: CoordinationMode,
    pub continue_on_error: bool,
    pub sub_tasks: Vec<SubTaskRecord>,
    pub created_at: DateTime<Utc>,
}

impl CoordinationRecord {
    fn is_complete(&self) -> bool {
        self.sub_tasks.iter().all(|sub| sub.status.is_terminal())
    }
}

/// Merged outcome of a coordination
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    pub coordination_id: String,
    pub result: Value,
    pub sub_tasks: Vec<SubTaskRecord>,
}

impl AggregatedResult {
    pub fn all_completed(&self) -> bool {
        self.sub_tasks
            .iter()
            .all(|sub| sub.status == TaskStatus::Completed)
    }
}

/// Supervises multiple task-machine runs and aggregates their results
pub struct MultiAgentCoordinator {
    machine: Arc<TaskStateMachine>,
    tasks: TaskStore,
    store: Arc<dyn KeyValueStore>,
    reducer: Reducer,
    continue_on_error: bool,
}

impl MultiAgentCoordinator {
    pub fn new(machine: Arc<TaskStateMachine>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            machine,
            tasks: TaskStore::new(store.clone()),
            store,
            reducer: Reducer::Concat,
            continue_on_error: false,
        }
    }

    pub fn with_reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = reducer;
        self
    }

    /// In sequential mode, keep running after a failed sub-task
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Run the sub-tasks to terminal states and aggregate their results
    pub async fn coordinate(
        &self,
        tasks: Vec<Task>,
        mode: CoordinationMode,
    ) -> Result<AggregatedResult> {
        if tasks.is_empty() {
            return Err(ConductorError::InvalidInput(
                "coordinate requires at least one sub-task".to_string(),
            ));
        }

        let record = CoordinationRecord {
            id: Uuid::new_v4().to_string(),
            mode,
            continue_on_error: self.continue_on_error,
            sub_tasks: tasks
                .iter()
                .map(|task| SubTaskRecord {
                    task_id: task.id.clone(),
                    agent_id: task.agent_id.clone(),
                    status: TaskStatus::Pending,
                    completed_at: None,
                })
                .collect(),
            created_at: Utc::now(),
        };
        self.save_record(&record).await?;

        // Persist every sub-task before any runs, so resume can find them
        for task in &tasks {
            self.tasks.create(task).await?;
        }

        info!(
            coordination_id = %record.id,
            sub_tasks = tasks.len(),
            mode = ?mode,
            "coordination started"
        );
        self.drive(record).await
    }

    /// Resume a coordination after a crash. Sub-tasks already terminal
    /// are not re-run; the rest resume from their own checkpoints.
    pub async fn resume(&self, coordination_id: &str) -> Result<AggregatedResult> {
        let record = self
            .load_record(coordination_id)
            .await?
            .ok_or_else(|| ConductorError::TaskNotFound(coordination_id.to_string()))?;
        info!(coordination_id, "resuming coordination");
        self.drive(record).await
    }

    async fn drive(&self, record: CoordinationRecord) -> Result<AggregatedResult> {
        let mode = record.mode;
        let shared = Arc::new(Mutex::new(record));

        match mode {
            CoordinationMode::Parallel => self.run_parallel(shared.clone()).await?,
            CoordinationMode::Sequential => self.run_sequential(shared.clone()).await?,
        }

        let record = shared.lock().await.clone();
        self.aggregate(record).await
    }

    async fn run_parallel(&self, shared: Arc<Mutex<CoordinationRecord>>) -> Result<()> {
        let pending: Vec<(usize, SubTaskRecord)> = {
            let record = shared.lock().await;
            record
                .sub_tasks
                .iter()
                .cloned()
                .enumerate()
                .filter(|(_, sub)| !sub.status.is_terminal())
                .collect()
        };

        let runs = pending.into_iter().map(|(index, sub)| {
            let shared = shared.clone();
            async move {
                let finished = self
                    .machine
                    .resume_from_checkpoint(&sub.agent_id, &sub.task_id)
                    .await;
                self.record_outcome(&shared, index, finished).await
            }
        });

        // Barrier: coordinate returns only after every sub-task is terminal
        for outcome in join_all(runs).await {
            outcome?;
        }
        Ok(())
    }

    async fn run_sequential(&self, shared: Arc<Mutex<CoordinationRecord>>) -> Result<()> {
        // The flag was captured when the coordination was created, so a
        // resume behaves exactly like the original run
        let (count, continue_on_error) = {
            let record = shared.lock().await;
            (record.sub_tasks.len(), record.continue_on_error)
        };

        for index in 0..count {
            let sub = shared.lock().await.sub_tasks[index].clone();
            if sub.status.is_terminal() {
                if sub.status != TaskStatus::Completed && !continue_on_error {
                    break;
                }
                continue;
            }

            let finished = self
                .machine
                .resume_from_checkpoint(&sub.agent_id, &sub.task_id)
                .await;
            let status = self.record_outcome(&shared, index, finished).await?;

            if status != TaskStatus::Completed && !continue_on_error {
                warn!(
                    task_id = %sub.task_id,
                    status = status.as_str(),
                    "sequential sub-task did not complete, aborting remainder"
                );
                break;
            }
        }
        Ok(())
    }

    /// Record one sub-task outcome and checkpoint coordination progress
    async fn record_outcome(
        &self,
        shared: &Arc<Mutex<CoordinationRecord>>,
        index: usize,
        finished: Result<Task>,
    ) -> Result<TaskStatus> {
        let task = finished?;
        let status = task.status;
        {
            let mut record = shared.lock().await;
            record.sub_tasks[index].status = status;
            record.sub_tasks[index].completed_at = task.completed_at;
            self.save_record(&record).await?;
        }
        Ok(status)
    }

    async fn aggregate(&self, record: CoordinationRecord) -> Result<AggregatedResult> {
        // Load terminal sub-tasks in submission order
        let mut finished: Vec<Task> = Vec::with_capacity(record.sub_tasks.len());
        for sub in &record.sub_tasks {
            if let Some(task) = self.tasks.load(&sub.agent_id, &sub.task_id).await? {
                finished.push(task);
            }
        }

        let result = match self.reducer {
            Reducer::Concat => Value::Array(
                finished
                    .iter()
                    .filter_map(|task| task.result.clone())
                    .collect(),
            ),
            Reducer::MergeKeys => self.merge_by_completion_time(&finished),
        };

        Ok(AggregatedResult {
            coordination_id: record.id,
            result,
            sub_tasks: record.sub_tasks,
        })
    }

    /// Merge result objects in completion order, so the last writer by
    /// completion time wins conflicting keys
    fn merge_by_completion_time(&self, finished: &[Task]) -> Value {
        let mut ordered: Vec<&Task> = finished
            .iter()
            .filter(|task| task.result.is_some())
            .collect();
        ordered.sort_by_key(|task| task.completed_at);

        let mut merged = Map::new();
        for task in ordered {
            let Some(Value::Object(fields)) = &task.result else {
                warn!(task_id = %task.id, "non-object result skipped by key-merge reducer");
                continue;
            };
            for (key, value) in fields {
                if let Some(previous) = merged.get(key) {
                    if previous != value {
                        warn!(
                            key = %key,
                            task_id = %task.id,
                            "conflicting aggregation key, keeping later completion"
                        );
                    }
                }
                merged.insert(key.clone(), value.clone());
            }
        }
        Value::Object(merged)
    }

    async fn save_record(&self, record: &CoordinationRecord) -> Result<()> {
        let item = StoredItem::encode(
            keys::coordination_pk(&record.id),
            keys::SK_PROGRESS.to_string(),
            record,
        )?;
        self.store.put(item, PutCondition::None).await
    }

    /// Load persisted coordination progress
    pub async fn load_record(&self, coordination_id: &str) -> Result<Option<CoordinationRecord>> {
        let item = self
            .store
            .get(&keys::coordination_pk(coordination_id), keys::SK_PROGRESS)
            .await?;
        item.map(|item| item.decode()).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerSettings, ContextSettings, RetryPolicy};
    use crate::context::ContextStore;
    use crate::engine::executor::{AuditLog, StepExecutor};
    use crate::engine::planner::Planner;
    use crate::engine::router::EventRouter;
    use crate::engine::tools::ToolRegistry;
    use crate::provider::{
        BreakerClient, BreakerRegistry, MockBehavior, MockProvider, ProviderError, ProviderResult,
        ReasoningProvider, ReasoningRequest, ReasoningResponse,
    };
    use crate::storage::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn single_step_plan() -> String {
        r#"[{"description": "produce the answer", "type": "response"}]"#.to_string()
    }

    /// Answers planning prompts with a single response step that names
    /// the task description, and echoes everything else. Safe to share
    /// across concurrently running sub-tasks, unlike a scripted mock.
    struct PlanningEcho;

    #[async_trait]
    impl ReasoningProvider for PlanningEcho {
        fn name(&self) -> &str {
            "planning-echo"
        }

        async fn complete(
            &self,
            request: &ReasoningRequest,
        ) -> ProviderResult<ReasoningResponse> {
            let prompt = request.last_user_content();
            if prompt.contains("step-by-step execution plan") {
                let description = prompt
                    .split("Task: ")
                    .nth(1)
                    .and_then(|rest| rest.lines().next())
                    .unwrap_or("")
                    .trim();
                return Ok(ReasoningResponse::text(&format!(
                    r#"[{{"description": "respond about {description}", "type": "response"}}]"#
                )));
            }
            Ok(ReasoningResponse::text(prompt))
        }
    }

    async fn coordinator_over(
        store: Arc<InMemoryStore>,
        provider: Arc<dyn ReasoningProvider>,
    ) -> MultiAgentCoordinator {
        let client = Arc::new(BreakerClient::new(
            provider,
            Arc::new(BreakerRegistry::new(BreakerSettings {
                failure_threshold: 1000,
                ..BreakerSettings::default()
            })),
            RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            Duration::from_secs(5),
        ));
        let router = Arc::new(
            EventRouter::new(store.clone(), RetryPolicy::default())
                .await
                .unwrap(),
        );
        let machine = Arc::new(TaskStateMachine::new(
            TaskStore::new(store.clone()),
            Arc::new(ContextStore::new(store.clone(), ContextSettings::default())),
            Arc::new(Planner::new(client.clone())),
            Arc::new(StepExecutor::new(
                client,
                Arc::new(ToolRegistry::new()),
                Arc::new(AuditLog::new()),
                Duration::from_secs(5),
            )),
            router,
            RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
        ));
        MultiAgentCoordinator::new(machine, store)
    }

    fn sub_task(agent: &str, description: &str) -> Task {
        Task::new(AgentId::from(agent), description)
    }

    #[tokio::test]
    async fn test_parallel_mode_aggregates_all_results() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = coordinator_over(store, Arc::new(PlanningEcho)).await;

        let aggregated = coordinator
            .coordinate(
                vec![sub_task("agent-a", "alpha"), sub_task("agent-b", "beta")],
                CoordinationMode::Parallel,
            )
            .await
            .unwrap();

        assert!(aggregated.all_completed());
        let results = aggregated.result.as_array().unwrap();
        assert_eq!(results.len(), 2);
        // Both sub-results are present regardless of completion order
        let combined = serde_json::to_string(&aggregated.result).unwrap();
        assert!(combined.contains("alpha"));
        assert!(combined.contains("beta"));
    }

    #[tokio::test]
    async fn test_sequential_failure_aborts_remainder() {
        let store = Arc::new(InMemoryStore::new());
        // First task: plan + failing step. Second task would need a
        // plan call, which must never happen.
        let provider = Arc::new(MockProvider::scripted(vec![
            Ok(single_step_plan()),
            Err(ProviderError::Unavailable("down".into())),
        ]));
        let coordinator = coordinator_over(store, provider.clone()).await;

        let aggregated = coordinator
            .coordinate(
                vec![sub_task("agent-a", "first"), sub_task("agent-b", "second")],
                CoordinationMode::Sequential,
            )
            .await
            .unwrap();

        assert_eq!(aggregated.sub_tasks[0].status, TaskStatus::Failed);
        // The second sub-task never started
        assert_eq!(aggregated.sub_tasks[1].status, TaskStatus::Pending);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_sequential_continue_on_error_runs_remainder() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::scripted(vec![
            Ok(single_step_plan()),
            Err(ProviderError::Unavailable("down".into())),
            Ok(single_step_plan()),
        ]));
        let coordinator = coordinator_over(store, provider)
            .await
            .with_continue_on_error(true);

        let aggregated = coordinator
            .coordinate(
                vec![sub_task("agent-a", "first"), sub_task("agent-b", "second")],
                CoordinationMode::Sequential,
            )
            .await
            .unwrap();

        assert_eq!(aggregated.sub_tasks[0].status, TaskStatus::Failed);
        assert_eq!(aggregated.sub_tasks[1].status, TaskStatus::Completed);
        // Concat skips the failed sub-task's missing result
        assert_eq!(aggregated.result.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_sub_tasks() {
        let store = Arc::new(InMemoryStore::new());
        // First sub-task plans and answers; the second plans but its
        // step exhausts its budget
        let provider = Arc::new(MockProvider::scripted(vec![
            Ok(single_step_plan()),
            Ok("the answer".to_string()),
            Ok(single_step_plan()),
            Err(ProviderError::Unavailable("down".into())),
        ]));
        let coordinator = coordinator_over(store.clone(), provider.clone())
            .await
            .with_continue_on_error(true);

        let first = coordinator
            .coordinate(
                vec![sub_task("agent-a", "solid"), sub_task("agent-b", "flaky")],
                CoordinationMode::Sequential,
            )
            .await
            .unwrap();
        assert_eq!(first.sub_tasks[0].status, TaskStatus::Completed);
        assert_eq!(first.sub_tasks[1].status, TaskStatus::Failed);
        let calls_before_resume = provider.calls();

        // The failed sub-task is terminal; resume re-runs nothing and
        // the completed sub-task is never re-executed
        let resumed = coordinator.resume(&first.coordination_id).await.unwrap();
        assert_eq!(provider.calls(), calls_before_resume);
        assert_eq!(resumed.sub_tasks[0].status, TaskStatus::Completed);

        // Progress survived in the store
        let record = coordinator
            .load_record(&first.coordination_id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.sub_tasks[0].status.is_terminal());
    }

    #[tokio::test]
    async fn test_merge_keys_last_writer_wins() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::with_behavior(MockBehavior::Fixed(
            "unused".to_string(),
        )));
        let coordinator = coordinator_over(store, provider)
            .await
            .with_reducer(Reducer::MergeKeys);

        let mut early = sub_task("agent-a", "early");
        early.begin_planning();
        early.begin_running(vec![]);
        early.complete(json!({"shared": "old", "a": 1}));
        let mut late = sub_task("agent-b", "late");
        late.begin_planning();
        late.begin_running(vec![]);
        // Ensure a strictly later completion timestamp
        tokio::time::sleep(Duration::from_millis(5)).await;
        late.complete(json!({"shared": "new", "b": 2}));

        let merged = coordinator.merge_by_completion_time(&[early, late]);
        assert_eq!(merged["shared"], "new");
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[tokio::test]
    async fn test_empty_task_set_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::echo());
        let coordinator = coordinator_over(store, provider).await;
        let error = coordinator
            .coordinate(vec![], CoordinationMode::Parallel)
            .await
            .unwrap_err();
        assert!(matches!(error, ConductorError::InvalidInput(_)));
    }
}
