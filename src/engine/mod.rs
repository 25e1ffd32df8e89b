// Conductor engine
// Execution components that drive tasks against the domain models

//! # Engine Module
//!
//! The execution layer of the orchestration engine. The engine sits
//! between the domain models and the external collaborators (durable
//! store, reasoning provider, event bus subscribers).
//!
//! ## Components
//!
//! - **Planner** (`planner`): decomposes a task description into an
//!   ordered, non-empty plan of steps.
//! - **Step Executor** (`executor`): runs one step against the
//!   breaker-guarded provider client or the tool registry, with a full
//!   audit trail.
//! - **Tool Registry** (`tools`): declared-schema validation in front of
//!   tool handlers.
//! - **Task State Machine** (`task_machine`): owns task lifecycles,
//!   per-step retries, checkpointing, resumption, and cooperative
//!   cancellation.
//! - **Event Router** (`router`): pattern-matched fan-out with a durable
//!   outbox, delivery retries, and dead-lettering.
//! - **Multi-Agent Coordinator** (`coordinator`): parallel/sequential
//!   supervision of many task machines with result aggregation.
//!
//! [`Engine`] wires all of them from an [`EngineConfig`] and the two
//! injected collaborators (store and provider).

pub mod coordinator;
pub mod executor;
pub mod planner;
pub mod router;
pub mod task_machine;
pub mod tools;

pub use coordinator::{
    AggregatedResult, CoordinationMode, CoordinationRecord, MultiAgentCoordinator, Reducer,
};
pub use executor::{AuditLog, AuditRecord, StepContext, StepError, StepExecutor};
pub use planner::Planner;
pub use router::{DeadLetterEntry, EventHandler, EventRouter};
pub use task_machine::{RecoveryBranch, TaskStateMachine};
pub use tools::{ParameterKind, Tool, ToolError, ToolParameter, ToolRegistry};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::context::ContextStore;
use crate::provider::{BreakerClient, BreakerRegistry, ReasoningProvider};
use crate::storage::{KeyValueStore, TaskStore};
use crate::Result;

/// Fully wired orchestration engine.
///
/// Storage and provider are injected, so tests substitute in-memory and
/// mock implementations; likewise the breaker registry is owned here
/// rather than hidden in a process-wide singleton.
pub struct Engine {
    store: Arc<dyn KeyValueStore>,
    breakers: Arc<BreakerRegistry>,
    router: Arc<EventRouter>,
    context: Arc<ContextStore>,
    machine: Arc<TaskStateMachine>,
    coordinator: Arc<MultiAgentCoordinator>,
    audit: Arc<AuditLog>,
}

impl Engine {
    /// Wire every component from configuration plus the injected
    /// collaborators
    pub async fn new(
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        provider: Arc<dyn ReasoningProvider>,
        tools: Arc<ToolRegistry>,
    ) -> Result<Self> {
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let client = Arc::new(BreakerClient::new(
            provider,
            breakers.clone(),
            config.retry.clone(),
            config.provider.deadline(),
        ));

        let router = Arc::new(EventRouter::new(store.clone(), config.router.delivery.clone()).await?);
        let context = Arc::new(
            ContextStore::new(store.clone(), config.context.clone()).with_summarizer(client.clone()),
        );
        let audit = Arc::new(AuditLog::new());
        let executor = Arc::new(StepExecutor::new(
            client.clone(),
            tools,
            audit.clone(),
            config.provider.deadline(),
        ));
        let machine = Arc::new(TaskStateMachine::new(
            TaskStore::new(store.clone()),
            context.clone(),
            Arc::new(Planner::new(client)),
            executor,
            router.clone(),
            config.retry.clone(),
        ));
        let coordinator = Arc::new(MultiAgentCoordinator::new(machine.clone(), store.clone()));

        Ok(Self {
            store,
            breakers,
            router,
            context,
            machine,
            coordinator,
            audit,
        })
    }

    pub fn machine(&self) -> Arc<TaskStateMachine> {
        self.machine.clone()
    }

    pub fn coordinator(&self) -> Arc<MultiAgentCoordinator> {
        self.coordinator.clone()
    }

    pub fn router(&self) -> Arc<EventRouter> {
        self.router.clone()
    }

    pub fn context(&self) -> Arc<ContextStore> {
        self.context.clone()
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.store.clone()
    }

    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        self.breakers.clone()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    /// Start the background outbox dispatcher; stop it via the token
    pub fn start_dispatcher(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.router.clone().start_dispatcher(cancel)
    }
}
