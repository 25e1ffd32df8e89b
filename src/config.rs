// Engine configuration
// Layered loading: optional `conductor.toml` file, then CONDUCTOR__*
// environment variables, with serde defaults underneath.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;

/// Bounded exponential backoff schedule.
///
/// Shared by provider calls, per-step retries in the task machine, and
/// event delivery in the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `completed_attempt` (1-based):
    /// 100ms after the first failure, then 200ms, 400ms, ... capped.
    pub fn delay_for(&self, completed_attempt: u32) -> Duration {
        let exponent = completed_attempt.saturating_sub(1);
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }
}

/// Circuit-breaker thresholds, shared by every endpoint in a registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failures within the sliding window that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before half-open
    pub cooldown_secs: u64,
    /// Sliding window over which failures are counted
    pub window_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
            window_secs: 60,
        }
    }
}

impl BreakerSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Context cache and summarization tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Cache entry time-to-live
    pub cache_ttl_secs: u64,
    /// Turn count above which a loaded context is summarized
    pub summary_threshold: usize,
    /// Most recent turns kept verbatim through summarization
    pub retain_recent: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            summary_threshold: 80,
            retain_recent: 20,
        }
    }
}

/// Reasoning provider endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Per-call deadline
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4".to_string(),
            timeout_secs: 60,
        }
    }
}

impl ProviderSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Event delivery tuning for the router's outbox dispatcher
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub delivery: RetryPolicy,
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub breaker: BreakerSettings,
    pub context: ContextSettings,
    pub provider: ProviderSettings,
    pub router: RouterSettings,
}

impl EngineConfig {
    /// Load configuration from `conductor.toml` (if present) and
    /// `CONDUCTOR__*` environment variables (e.g.
    /// `CONDUCTOR__PROVIDER__API_KEY`).
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::File::with_name("conductor").required(false))
            .add_source(config::Environment::with_prefix("CONDUCTOR").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
