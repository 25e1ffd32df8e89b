//! Typed task persistence over the key-value contract.
//!
//! Tasks live under `AGENT#<agentId>` / `TASK#<taskId>`. The stored
//! record carries the full task including step outputs and the
//! current-step cursor, so a saved task doubles as its own checkpoint:
//! resuming loads the record and re-enters at the first non-completed
//! step.

use std::sync::Arc;

use crate::models::{AgentId, Task, TaskId};
use crate::storage::{keys, KeyValueStore, PutCondition, ScanOrder, StoredItem};
use crate::Result;

/// Repository for task records and their checkpoints
#[derive(Clone)]
pub struct TaskStore {
    store: Arc<dyn KeyValueStore>,
}

impl TaskStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Store a brand-new task; fails with `ConditionalCheck` when a task
    /// with the same ID already exists for the agent
    pub async fn create(&self, task: &Task) -> Result<()> {
        let item = StoredItem::encode(
            keys::agent_pk(&task.agent_id),
            keys::task_sk(&task.id),
            task,
        )?;
        self.store.put(item, PutCondition::IfNotExists).await
    }

    /// Persist the task's current state. Called after every step
    /// completion, before the state machine advances.
    pub async fn checkpoint(&self, task: &Task) -> Result<()> {
        let item = StoredItem::encode(
            keys::agent_pk(&task.agent_id),
            keys::task_sk(&task.id),
            task,
        )?;
        self.store.put(item, PutCondition::None).await
    }

    pub async fn load(&self, agent_id: &AgentId, task_id: &TaskId) -> Result<Option<Task>> {
        let item = self
            .store
            .get(&keys::agent_pk(agent_id), &keys::task_sk(task_id))
            .await?;
        item.map(|item| item.decode()).transpose()
    }

    /// List an agent's tasks in task-ID order
    pub async fn list(&self, agent_id: &AgentId) -> Result<Vec<Task>> {
        let items = self
            .store
            .query_prefix(
                &keys::agent_pk(agent_id),
                keys::SK_TASK,
                ScanOrder::Ascending,
                None,
            )
            .await?;
        items.iter().map(|item| item.decode()).collect()
    }

    pub async fn delete(&self, agent_id: &AgentId, task_id: &TaskId) -> Result<()> {
        self.store
            .delete(&keys::agent_pk(agent_id), &keys::task_sk(task_id))
            .await
    }
}
