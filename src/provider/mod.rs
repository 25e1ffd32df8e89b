// Reasoning provider boundary
// The orchestration core only ever sees these types; provider-specific
// request/response shapes are adapted behind the trait.

//! # Reasoning Provider Abstraction
//!
//! A reasoning provider accepts a normalized completion request and
//! returns a response or a typed error. The error taxonomy is the whole
//! contract the engine relies on: `Timeout`, `RateLimited`, and
//! `Unavailable` are retriable; `InvalidRequest` is not and propagates
//! immediately.
//!
//! Concrete adapters:
//! - [`http::HttpProvider`]: OpenAI-style chat-completion endpoint
//! - [`MockProvider`]: scripted responses for tests

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

pub mod breaker;
pub mod http;

pub use breaker::{BreakerClient, BreakerRegistry, CallError, CircuitState};
pub use http::HttpProvider;

/// Typed provider failure. Retriability drives both the retry loop and
/// the circuit breaker; every variant counts toward breaker state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider timeout: {0}")]
    Timeout(String),

    #[error("provider rate limited: {0}")]
    RateLimited(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Whether this error may succeed on retry
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ProviderError::InvalidRequest(_))
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// One message in a completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: String,
    pub content: String,
}

impl ProviderMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }
}

/// Normalized completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub messages: Vec<ProviderMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ReasoningRequest {
    pub fn new(messages: Vec<ProviderMessage>) -> Self {
        Self {
            messages,
            temperature: 0.7,
            max_tokens: 1024,
        }
    }

    /// Single user-prompt request
    pub fn from_prompt(prompt: &str) -> Self {
        Self::new(vec![ProviderMessage::user(prompt)])
    }

    pub fn with_system(mut self, system: &str) -> Self {
        self.messages.insert(0, ProviderMessage::system(system));
        self
    }

    /// Content of the last user message, used by echo-style mocks
    pub fn last_user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Token accounting reported by a provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Normalized completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

impl ReasoningResponse {
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            model: String::new(),
            usage: TokenUsage::default(),
        }
    }
}

/// Contract every reasoning/tool provider adapter must implement
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    /// Provider identifier used in logs and breaker endpoint keys
    fn name(&self) -> &str;

    /// Send a completion request
    async fn complete(&self, request: &ReasoningRequest) -> ProviderResult<ReasoningResponse>;
}

/// What the mock does when its script runs dry
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Respond with the last user message verbatim
    Echo,
    /// Respond with a fixed string
    Fixed(String),
    /// Fail every call with the given error
    Fail(ProviderError),
}

/// Scripted provider for tests.
///
/// Pops scripted results first; once the script is exhausted it falls
/// back to its default behavior. Counts every call so tests can assert
/// that an open circuit never reached the provider.
pub struct MockProvider {
    behavior: MockBehavior,
    script: Mutex<VecDeque<ProviderResult<String>>>,
    calls: AtomicU32,
}

impl MockProvider {
    pub fn echo() -> Self {
        Self::with_behavior(MockBehavior::Echo)
    }

    pub fn fixed(content: &str) -> Self {
        Self::with_behavior(MockBehavior::Fixed(content.to_string()))
    }

    pub fn failing(error: ProviderError) -> Self {
        Self::with_behavior(MockBehavior::Fail(error))
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    /// Queue scripted results consumed before the default behavior
    pub fn scripted(results: Vec<ProviderResult<String>>) -> Self {
        Self {
            behavior: MockBehavior::Echo,
            script: Mutex::new(results.into()),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of calls that actually reached this provider
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &ReasoningRequest) -> ProviderResult<ReasoningResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(result) = self.script.lock().await.pop_front() {
            return result.map(|content| ReasoningResponse::text(&content));
        }

        match &self.behavior {
            MockBehavior::Echo => Ok(ReasoningResponse::text(request.last_user_content())),
            MockBehavior::Fixed(content) => Ok(ReasoningResponse::text(content)),
            MockBehavior::Fail(error) => Err(error.clone()),
        }
    }
}
