// Conductor
// A durable, event-driven orchestration engine for AI agent tasks

//! # Conductor Library
//!
//! Conductor plans a unit of work (a task) into ordered steps, executes
//! those steps against a pluggable reasoning provider, coordinates
//! multiple concurrent task machines, and survives partial failure
//! without losing progress.
//!
//! ## Core Components
//!
//! - [`TaskStateMachine`]: owns a task's lifecycle
//!   (`pending -> planning -> running -> completed|failed|cancelled`),
//!   sequences step execution with retry/backoff, checkpoints after
//!   every completed step, and resumes after a crash at the first
//!   non-completed step.
//! - [`StepExecutor`]: runs one step (reasoning, tool call, response, or
//!   decision) with a full audit trail.
//! - [`BreakerClient`] / [`BreakerRegistry`]: deadline, bounded retry
//!   with exponential backoff, and per-endpoint circuit breaking in
//!   front of every provider call.
//! - [`ContextStore`]: cache-aside conversation/memory state per agent,
//!   with write-through invalidation and breaker-guarded summarization.
//! - [`EventRouter`]: structural pattern matching with fan-out,
//!   backed by a durable outbox with retry and dead-lettering for
//!   at-least-once delivery.
//! - [`MultiAgentCoordinator`]: parallel/sequential supervision of
//!   sub-tasks with configurable result aggregation.
//!
//! External collaborators — the durable key-value store and the
//! reasoning provider — are injected behind [`KeyValueStore`] and
//! [`ReasoningProvider`]; [`Engine`] wires a complete instance from an
//! [`EngineConfig`].
//!
//! ```rust
//! use std::sync::Arc;
//! use conductor::{
//!     AgentId, Engine, EngineConfig, InMemoryStore, MockProvider, Task, ToolRegistry,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> conductor::Result<()> {
//! let provider = Arc::new(MockProvider::fixed(
//!     r#"[{"description": "reply", "type": "response"}]"#,
//! ));
//! let engine = Engine::new(
//!     EngineConfig::default(),
//!     Arc::new(InMemoryStore::new()),
//!     provider,
//!     Arc::new(ToolRegistry::new()),
//! )
//! .await?;
//!
//! let task = Task::new(AgentId::from("assistant"), "greet the user");
//! let finished = engine.machine().start(task).await?;
//! assert!(finished.status.is_terminal());
//! # Ok(())
//! # }
//! ```

// Core domain models
pub mod models;

// Engine components (planner, executor, state machine, router, coordinator)
pub mod engine;

// Reasoning provider boundary and circuit-breaker client
pub mod provider;

// Durable key-value storage contract and task repository
pub mod storage;

// Per-agent context with cache-aside and summarization
pub mod context;

// Layered configuration
pub mod config;

// Re-export core domain types for easy access
pub use models::{
    AgentId, AgentStatus, Context, Event, EventPattern, Step, StepKind, StepStatus, Task,
    TaskErrorRecord, TaskId, TaskStatus, Turn, TurnRole,
};

// Re-export engine types for convenience
pub use engine::{
    AggregatedResult, AuditLog, AuditRecord, CoordinationMode, Engine, EventHandler, EventRouter,
    MultiAgentCoordinator, Planner, RecoveryBranch, Reducer, StepContext, StepError, StepExecutor,
    TaskStateMachine, Tool, ToolError, ToolParameter, ToolRegistry,
};

// Re-export collaborator contracts and default implementations
pub use context::ContextStore;
pub use provider::{
    BreakerClient, BreakerRegistry, CallError, CircuitState, HttpProvider, MockProvider,
    ProviderError, ReasoningProvider, ReasoningRequest, ReasoningResponse,
};
pub use storage::{InMemoryStore, KeyValueStore, PutCondition, ScanOrder, StoredItem, TaskStore};

pub use config::{
    BreakerSettings, ContextSettings, EngineConfig, ProviderSettings, RetryPolicy, RouterSettings,
};

// Core error types
use thiserror::Error;

/// Errors surfaced across the orchestration engine.
///
/// Component-local taxonomies ([`ProviderError`], [`StepError`],
/// [`ToolError`]) stay inside their components; this enum is what
/// crosses module boundaries and reaches embedders.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// Task decomposition failed or produced zero steps. Fatal to the
    /// task; never retried.
    #[error("planning failed: {0}")]
    Planning(String),

    /// A conditional write found the key already present
    #[error("conditional check failed for {pk}/{sk}")]
    ConditionalCheck { pk: String, sk: String },

    /// Two writers raced on the same context version; reload and retry
    #[error("concurrent modification of context for agent {0}")]
    ConcurrentModification(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Storage backend failure, wrapped from the backend's own error type
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // `::config` disambiguates the crate from our own config module
    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Type alias for Results that use our error type
pub type Result<T> = std::result::Result<T, ConductorError>;
