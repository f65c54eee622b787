//! Local network cleanup backend
//!
//! Talks to a locally hosted model server's generate endpoint. No credential
//! is required; readiness is probed via the models-list endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{Error, Result};

use super::{CleanupBackend, RewriteJob};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Cleanup backend for a local generate-endpoint model server
pub struct LocalCleanupBackend {
    client: Client,
    base_url: String,
}

impl LocalCleanupBackend {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Probe the models-list endpoint; `false` when the service is down or
    /// has no models pulled.
    pub async fn is_ready(&self) -> bool {
        match self.list_models().await {
            Ok(models) => !models.is_empty(),
            Err(e) => {
                debug!("Local cleanup backend not ready: {}", e);
                false
            }
        }
    }

    /// Names of the models the local service has available
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Backend {
                status: response.status().as_u16(),
                message: "models list unavailable".to_string(),
            });
        }

        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

impl Default for LocalCleanupBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    total_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

#[async_trait]
impl CleanupBackend for LocalCleanupBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn rewrite(&self, job: &RewriteJob) -> Result<String> {
        let request = GenerateRequest {
            model: &job.model,
            prompt: &job.text,
            system: &job.system,
            stream: false,
        };

        debug!("Sending rewrite to local backend (model {})", job.model);

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            error!("Local backend error: {} - {}", status, message);
            if status.as_u16() == 429 {
                return Err(Error::RateLimited { retry_after: None });
            }
            return Err(Error::Backend { status: status.as_u16(), message });
        }

        let generated: GenerateResponse = response.json().await?;
        if let Some(ns) = generated.total_duration {
            debug!("Local rewrite took {}ms", ns / 1_000_000);
        }
        Ok(generated.response)
    }
}
