// Circuit breaker and retry layer in front of reasoning providers

//! # Circuit-Breaker Client
//!
//! Wraps every provider call with three protections:
//!
//! - **Deadline**: each call carries a timeout; exceeding it surfaces as
//!   a retriable `Timeout` error.
//! - **Bounded retry**: retriable errors are retried with exponential
//!   backoff up to the configured attempt budget; `InvalidRequest`
//!   propagates immediately without consuming the budget.
//! - **Circuit breaker**: per-endpoint failure tracking. When failures
//!   within the sliding window reach the threshold the circuit opens and
//!   calls fail fast with [`CallError::CircuitOpen`] until the cooldown
//!   elapses, after which exactly one half-open trial is admitted.
//!
//! Breaker state is scoped per process per endpoint and lives behind an
//! explicit [`BreakerRegistry`] that callers inject, so tests and
//! embedders can substitute isolated instances. Every failure counts
//! toward breaker state, retriable or not.

use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use dashmap::DashMap;

use crate::config::{BreakerSettings, RetryPolicy};
use crate::provider::{ProviderError, ReasoningProvider, ReasoningRequest, ReasoningResponse};

/// Breaker state for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Failure of a breaker-guarded call
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Circuit is open; the provider was not contacted
    #[error("circuit open for endpoint '{endpoint}'")]
    CircuitOpen { endpoint: String },

    /// The operation itself failed (after exhausting any retry budget)
    #[error(transparent)]
    Operation(#[from] ProviderError),
}

/// Per-endpoint breaker state machine.
///
/// Not synchronized itself; the registry hands it out behind a mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
        }
    }

    /// Current state, promoting `Open` to `HalfOpen` once the cooldown
    /// has elapsed
    pub fn state(&mut self) -> CircuitState {
        if self.state == CircuitState::Open {
            let elapsed = self
                .opened_at
                .map(|at| at.elapsed() >= self.settings.cooldown())
                .unwrap_or(true);
            if elapsed {
                self.state = CircuitState::HalfOpen;
                self.trial_in_flight = false;
            }
        }
        self.state
    }

    /// Ask permission to make a call. In `HalfOpen` only a single trial
    /// call is admitted until it resolves.
    fn try_acquire(&mut self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.failures.clear();
        self.opened_at = None;
        self.trial_in_flight = false;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        let now = Instant::now();
        self.failures.push_back(now);
        self.prune_window(now);

        match self.state {
            // A failed half-open trial reopens and restarts the cooldown
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.trial_in_flight = false;
            }
            CircuitState::Closed => {
                if self.failures.len() as u32 >= self.settings.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                    warn!(
                        failures = self.failures.len(),
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn prune_window(&mut self, now: Instant) {
        let window = self.settings.window();
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Registry of breaker state, one entry per provider endpoint.
///
/// Passed explicitly to every component that makes guarded calls; there
/// is deliberately no process-wide instance.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: DashMap<String, Arc<Mutex<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for one endpoint, created closed on first use
    pub fn breaker_for(&self, endpoint: &str) -> Arc<Mutex<CircuitBreaker>> {
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(self.settings.clone()))))
            .clone()
    }

    /// Current state of an endpoint's breaker, for observability
    pub async fn state_of(&self, endpoint: &str) -> CircuitState {
        self.breaker_for(endpoint).lock().await.state()
    }
}

/// A reasoning provider behind deadline, retry, and breaker policy.
///
/// This is the only path through which the engine talks to a provider.
pub struct BreakerClient {
    provider: Arc<dyn ReasoningProvider>,
    registry: Arc<BreakerRegistry>,
    endpoint: String,
    retry: RetryPolicy,
    deadline: std::time::Duration,
}

impl BreakerClient {
    pub fn new(
        provider: Arc<dyn ReasoningProvider>,
        registry: Arc<BreakerRegistry>,
        retry: RetryPolicy,
        deadline: std::time::Duration,
    ) -> Self {
        let endpoint = provider.name().to_string();
        Self {
            provider,
            registry,
            endpoint,
            retry,
            deadline,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Execute one guarded call.
    ///
    /// Fails fast with `CircuitOpen` when the breaker disallows the
    /// call; otherwise retries retriable errors on the configured
    /// backoff schedule. All failures, retriable or not, are recorded
    /// against the breaker.
    pub async fn call(
        &self,
        request: &ReasoningRequest,
    ) -> std::result::Result<ReasoningResponse, CallError> {
        let breaker = self.registry.breaker_for(&self.endpoint);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if !breaker.lock().await.try_acquire() {
                debug!(endpoint = %self.endpoint, "call rejected: circuit open");
                return Err(CallError::CircuitOpen {
                    endpoint: self.endpoint.clone(),
                });
            }

            let result = match timeout(self.deadline, self.provider.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(format!(
                    "call exceeded deadline of {:?}",
                    self.deadline
                ))),
            };

            match result {
                Ok(response) => {
                    breaker.lock().await.record_success();
                    return Ok(response);
                }
                Err(error) => {
                    breaker.lock().await.record_failure();

                    if !error.is_retriable() || attempt >= self.retry.max_attempts {
                        return Err(CallError::Operation(error));
                    }

                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        endpoint = %self.endpoint,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        ?delay,
                        %error,
                        "provider call failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
