use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::models::AgentId;

/// Role of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

/// One conversation turn in an agent's context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::new(TurnRole::Assistant, content)
    }
}

/// Memory key holding the condensed history after summarization
pub const MEMORY_KEY_SUMMARY: &str = "conversation_summary";
/// Memory key recording when the last summarization happened
pub const MEMORY_KEY_SUMMARY_AT: &str = "summary_timestamp";

/// Durable conversation, memory, and variable state for one agent.
///
/// Contexts are versioned snapshots: every save produces a new version
/// rather than mutating the stored one, and summarization builds a new
/// `Context` value instead of editing turns in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub agent_id: AgentId,
    /// Monotonic snapshot version, assigned by the context store
    pub version: u64,
    pub turns: Vec<Turn>,
    /// Long-lived key-value agent memory
    pub memory: HashMap<String, Value>,
    /// Task-scoped variables, cleared between tasks by the caller
    pub variables: HashMap<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl Context {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            version: 0,
            turns: Vec::new(),
            memory: HashMap::new(),
            variables: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Size metric that drives summarization: the number of stored turns
    pub fn size_metric(&self) -> usize {
        self.turns.len()
    }

    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.updated_at = Utc::now();
    }

    pub fn set_memory(&mut self, key: &str, value: Value) {
        self.memory.insert(key.to_string(), value);
        self.updated_at = Utc::now();
    }

    /// Build the next context version: old turns replaced by `summary`,
    /// keeping the `retain` most recent turns verbatim. The summary is
    /// also recorded in agent memory so later versions keep carrying it.
    pub fn summarized(&self, summary: &str, retain: usize) -> Self {
        let split = self.turns.len().saturating_sub(retain);
        let mut turns = Vec::with_capacity(retain + 1);
        turns.push(Turn::new(TurnRole::System, summary));
        turns.extend(self.turns[split..].iter().cloned());

        let mut memory = self.memory.clone();
        memory.insert(MEMORY_KEY_SUMMARY.to_string(), Value::String(summary.to_string()));
        memory.insert(
            MEMORY_KEY_SUMMARY_AT.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        Self {
            agent_id: self.agent_id.clone(),
            version: self.version,
            turns,
            memory,
            variables: self.variables.clone(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_metric_counts_turns() {
        let mut ctx = Context::new(AgentId::from("agent-1"));
        assert_eq!(ctx.size_metric(), 0);
        ctx.push_turn(Turn::user("hello"));
        ctx.push_turn(Turn::assistant("hi"));
        assert_eq!(ctx.size_metric(), 2);
    }

    #[test]
    fn test_summarized_retains_recent_turns() {
        let mut ctx = Context::new(AgentId::from("agent-1"));
        for i in 0..10 {
            ctx.push_turn(Turn::user(&format!("message {i}")));
        }

        let condensed = ctx.summarized("the user sent ten messages", 3);
        // One summary turn plus the three retained
        assert_eq!(condensed.turns.len(), 4);
        assert_eq!(condensed.turns[0].role, TurnRole::System);
        assert_eq!(condensed.turns[3].content, "message 9");
        assert_eq!(
            condensed.memory.get(MEMORY_KEY_SUMMARY),
            Some(&Value::String("the user sent ten messages".to_string()))
        );
        // Original is untouched: summarization creates a new version
        assert_eq!(ctx.turns.len(), 10);
    }

    #[test]
    fn test_summarized_shorter_than_retain() {
        let mut ctx = Context::new(AgentId::from("agent-1"));
        ctx.push_turn(Turn::user("only one"));
        let condensed = ctx.summarized("summary", 5);
        assert_eq!(condensed.turns.len(), 2);
    }
}
