//! HTTP reasoning provider client
//! Adapts an OpenAI-style chat-completion endpoint to the provider trait.
//! All wire-format knowledge stays in this file; the orchestration core
//! only sees `ReasoningRequest`/`ReasoningResponse` and typed errors.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::config::ProviderSettings;
use crate::provider::{
    ProviderError, ProviderMessage, ProviderResult, ReasoningProvider, ReasoningRequest,
    ReasoningResponse, TokenUsage,
};

/// Wire request for `/chat/completions`
#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ProviderMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: String,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

/// Chat-completion HTTP client
pub struct HttpProvider {
    client: Client,
    settings: ProviderSettings,
}

impl HttpProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    fn endpoint_url(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }

    /// Map an HTTP status to the provider error taxonomy
    fn error_for_status(status: StatusCode, body: &str) -> ProviderError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST => {
                ProviderError::InvalidRequest(format!("HTTP {status}: {body}"))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                ProviderError::RateLimited(format!("HTTP {status}: {body}"))
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                ProviderError::Timeout(format!("HTTP {status}"))
            }
            _ => ProviderError::Unavailable(format!("HTTP {status}: {body}")),
        }
    }
}

#[async_trait]
impl ReasoningProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(&self, request: &ReasoningRequest) -> ProviderResult<ReasoningResponse> {
        let payload = WireRequest {
            model: &self.settings.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        debug!(
            model = %self.settings.model,
            messages = request.messages.len(),
            "sending chat completion request"
        );

        let response = self
            .client
            .post(self.endpoint_url())
            .bearer_auth(&self.settings.api_key)
            .timeout(Duration::from_secs(self.settings.timeout_secs))
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProviderError::Timeout(err.to_string())
                } else {
                    ProviderError::Unavailable(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, "chat completion request failed");
            return Err(Self::error_for_status(status, &body));
        }

        let body: WireResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Unavailable(format!("malformed response: {err}")))?;

        let content = body
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| {
                ProviderError::Unavailable("response contained no completion choice".to_string())
            })?;

        Ok(ReasoningResponse {
            content,
            model: body.model,
            usage: TokenUsage {
                prompt_tokens: body.usage.prompt_tokens,
                completion_tokens: body.usage.completion_tokens,
                total_tokens: body.usage.total_tokens,
            },
        })
    }
}
