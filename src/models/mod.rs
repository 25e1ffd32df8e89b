// Core domain models for Conductor
// These are the generic data structures the orchestration engine runs on

//! # Domain Models Module
//!
//! The entities the engine orchestrates: tasks decomposed into ordered
//! steps, per-agent conversation context, and the domain events that
//! announce lifecycle changes. These types carry no execution logic of
//! their own; the `engine` modules own all mutation flows.

// Agent identity and availability status
pub mod agent;

// Task entity and lifecycle status
pub mod task;

// Step entity - one atomic action within a task plan
pub mod step;

// Versioned conversation/memory context for an agent
pub mod context;

// Domain events and structural event patterns
pub mod event;

// Re-export main types for convenience
pub use agent::{AgentId, AgentStatus};
pub use context::{Context, Turn, TurnRole, MEMORY_KEY_SUMMARY, MEMORY_KEY_SUMMARY_AT};
pub use event::{detail_types, sources, Event, EventPattern};
pub use step::{Step, StepKind, StepStatus};
pub use task::{Task, TaskErrorRecord, TaskId, TaskStatus};
