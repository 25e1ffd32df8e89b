//! Tool registry for agent tool calling.
//!
//! Tools declare a parameter schema; the registry validates the supplied
//! parameters against it **before** the tool runs, so a validation
//! failure never reaches the handler. Handler failures are wrapped as
//! execution errors and carry no handler panic semantics.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Tool invocation failure
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool validation failed: {0}")]
    Validation(String),

    #[error("tool execution failed: {0}")]
    Execution(String),
}

/// Expected JSON type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParameterKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParameterKind::String => value.is_string(),
            ParameterKind::Number => value.is_number(),
            ParameterKind::Boolean => value.is_boolean(),
            ParameterKind::Object => value.is_object(),
            ParameterKind::Array => value.is_array(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ParameterKind::String => "string",
            ParameterKind::Number => "number",
            ParameterKind::Boolean => "boolean",
            ParameterKind::Object => "object",
            ParameterKind::Array => "array",
        }
    }
}

/// One declared parameter in a tool's schema
#[derive(Debug, Clone)]
pub struct ToolParameter {
    pub name: String,
    pub kind: ParameterKind,
    pub required: bool,
}

impl ToolParameter {
    pub fn required(name: &str, kind: ParameterKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: &str, kind: ParameterKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
        }
    }
}

/// A tool an agent can invoke during a `tool_call` step
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Declared parameter schema, validated before every invocation
    fn parameters(&self) -> Vec<ToolParameter>;

    async fn invoke(&self, params: &Value) -> anyhow::Result<Value>;
}

/// Registry of tools available to the step executor
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        debug!(tool = tool.name(), "registering tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Sorted tool names, for prompts and diagnostics
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Validate parameters against the tool's schema, then invoke.
    ///
    /// Validation failures return without running the tool.
    pub async fn invoke(&self, name: &str, params: &Value) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        Self::validate(name, &tool.parameters(), params)?;

        tool.invoke(params)
            .await
            .map_err(|err| ToolError::Execution(format!("{name}: {err}")))
    }

    fn validate(name: &str, schema: &[ToolParameter], params: &Value) -> Result<(), ToolError> {
        let object = params.as_object().ok_or_else(|| {
            ToolError::Validation(format!("{name}: parameters must be a JSON object"))
        })?;

        for parameter in schema {
            match object.get(&parameter.name) {
                Some(value) => {
                    if !parameter.kind.accepts(value) {
                        return Err(ToolError::Validation(format!(
                            "{name}: parameter '{}' must be of type {}",
                            parameter.name,
                            parameter.kind.as_str()
                        )));
                    }
                }
                None if parameter.required => {
                    return Err(ToolError::Validation(format!(
                        "{name}: missing required parameter '{}'",
                        parameter.name
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}
