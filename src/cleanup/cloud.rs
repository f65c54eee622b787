//! Cloud cleanup backend
//!
//! Talks to a chat-completion API with a bearer credential. A missing
//! credential is an unrecoverable (non-retryable) failure; 429 responses may
//! carry a Retry-After hint which the router honors over its own backoff.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{Error, Result};

use super::{CleanupBackend, RewriteJob};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Token cap for a rewrite; cleaned text is never longer than speech
const MAX_COMPLETION_TOKENS: u32 = 1024;

/// Low temperature for consistent formatting
const TEMPERATURE: f32 = 0.2;

/// Cleanup backend for a cloud chat-completion API
pub struct CloudCleanupBackend {
    client: Client,
    base_url: String,
}

impl CloudCleanupBackend {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for CloudCleanupBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Parse a Retry-After header value (delta-seconds form)
fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Pull the human-readable message out of a JSON error body, falling back
/// to the raw body text
fn error_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorBody>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}

#[async_trait]
impl CleanupBackend for CloudCleanupBackend {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn rewrite(&self, job: &RewriteJob) -> Result<String> {
        let api_key = job
            .api_key
            .as_deref()
            .ok_or_else(|| Error::ProviderNotConfigured("cloud cleanup API key not set".to_string()))?;

        let request = ChatRequest {
            model: &job.model,
            messages: vec![
                ChatMessage { role: "system", content: &job.system },
                ChatMessage { role: "user", content: &job.text },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_COMPLETION_TOKENS,
        };

        debug!("Sending rewrite to cloud backend (model {})", job.model);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok()),
            );
            return Err(Error::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(&body);
            error!("Cloud backend error: {} - {}", status, message);
            return Err(Error::Backend { status: status.as_u16(), message });
        }

        let chat: ChatResponse = response.json().await?;
        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Cleanup("no completion returned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_shape() {
        let request = ChatRequest {
            model: "gpt-4o-mini",
            messages: vec![
                ChatMessage { role: "system", content: "clean" },
                ChatMessage { role: "user", content: "um hi" },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_COMPLETION_TOKENS,
        };
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "um hi");
        assert_eq!(value["max_tokens"], 1024);
    }

    #[test]
    fn test_missing_credential_is_not_retryable() {
        let job = RewriteJob {
            system: "clean".to_string(),
            text: "hello".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
        };
        let backend = CloudCleanupBackend::new();

        let err = tokio_test(async { backend.rewrite(&job).await }).unwrap_err();
        assert!(matches!(err, Error::ProviderNotConfigured(_)));
        assert!(!err.is_retryable());
    }

    fn tokio_test<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn test_retry_after_header_parses_delta_seconds() {
        assert_eq!(parse_retry_after(Some("2")), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(Some(" 10 ")), Some(Duration::from_secs(10)));
        assert_eq!(parse_retry_after(Some("soon")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn test_error_body_message_extraction() {
        let body = r#"{"error":{"message":"Invalid API key","type":"auth"}}"#;
        assert_eq!(error_message(body), "Invalid API key");

        assert_eq!(error_message("gateway timeout"), "gateway timeout");
    }

    #[test]
    fn test_chat_response_takes_first_choice() {
        let chat: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Hello."}}],"model":"gpt-4o-mini"}"#,
        )
        .unwrap();
        let text = chat.choices.into_iter().next().unwrap().message.content;
        assert_eq!(text, "Hello.");
    }
}
