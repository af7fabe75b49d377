//! Stateless client for the OpenRouter chat-completion endpoint.
//!
//! One request per call, no retries, no streaming. HTTP status codes are
//! normalized into [`CompletionOutcome`] so the orchestrator can pattern-match
//! instead of probing a raw response map.

use log::{error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};

pub const BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "mistralai/mistral-7b-instruct";

/// One entry of the `messages` array sent to the completion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            name: None,
        }
    }

    pub fn user(content: impl Into<String>, name: Option<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            name,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            name: None,
        }
    }
}

/// Result of a completion call.
///
/// Transport-level failures (DNS, refused connection, timeout) carry no
/// detail; whatever the transport reported has already been logged at this
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// 200 response; the JSON body is passed through verbatim.
    Success(Value),
    /// Non-200 response or an unusable body, normalized to a code + message.
    ProviderError { code: u16, message: String },
    /// The request never completed; no further detail is available.
    TransportFailure,
}

fn provider_error(code: u16, message: &str) -> CompletionOutcome {
    CompletionOutcome::ProviderError {
        code,
        message: message.to_string(),
    }
}

/// Map an HTTP status and response body into a [`CompletionOutcome`].
fn outcome_from_status(status: u16, body: &str) -> CompletionOutcome {
    match status {
        200 => match serde_json::from_str::<Value>(body) {
            Ok(parsed) => CompletionOutcome::Success(parsed),
            Err(_) => provider_error(500, "Invalid JSON response"),
        },
        401 => provider_error(401, "Invalid credentials"),
        400 => provider_error(400, "Invalid request"),
        other => provider_error(other, "Unknown error"),
    }
}

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    app_url: String,
    base_url: String,
}

impl OpenRouterClient {
    pub fn new(api_key: String, app_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            app_url,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Same client against a different endpoint, used by tests.
    pub fn with_base_url(api_key: String, app_url: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            app_url,
            base_url,
        }
    }

    /// Send one synchronous completion request.
    ///
    /// An empty `messages` array is rejected without a network call, using the
    /// same error shape the provider returns for missing credentials.
    pub async fn complete(&self, messages: &[ChatMessage], model: &str) -> CompletionOutcome {
        if messages.is_empty() {
            warn!("Completion requested with no messages");
            return provider_error(401, "Invalid credentials");
        }

        let body = json!({
            "model": model,
            "messages": messages,
        });

        let response = match self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.app_url)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("OpenRouter API error: {e}");
                return CompletionOutcome::TransportFailure;
            }
        };

        let status = response.status().as_u16();
        info!("OpenRouter responded with status {status}");

        match response.text().await {
            Ok(text) => outcome_from_status(status, &text),
            Err(e) => {
                error!("Failed to read OpenRouter response body: {e}");
                CompletionOutcome::TransportFailure
            }
        }
    }
}
