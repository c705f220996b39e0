//! Ollama backend implementation.
//!
//! Ollama keeps models resident on its own, so loading is a warm-up request
//! pinned with `keep_alive: -1` and releasing sets `keep_alive: 0`.

use super::{body_lines, RemoteModel, TokenSink};
use crate::config::GenerationConfig;
use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Upper bound on pulling a model into memory.
const LOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Ollama backend for local inference.
pub struct OllamaBackend {
    host: String,
    client: Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend.
    pub fn new(host: String) -> Result<Self> {
        // No overall timeout: generation streams for as long as it takes
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Verify the model exists and pull it into memory.
    pub async fn load(&self, name: &str) -> Result<RemoteModel> {
        let url = format!("{}/api/show", self.host);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "model": name }))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("Failed to connect to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Ollama does not have model '{}' ({}): {}", name, status, body));
        }

        // An empty prompt loads the model without generating anything
        let url = format!("{}/api/generate", self.host);
        let response = self
            .client
            .post(&url)
            .json(&KeepAliveRequest {
                model: name,
                keep_alive: -1,
            })
            .timeout(LOAD_TIMEOUT)
            .send()
            .await
            .context("Failed to connect to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Ollama failed to load '{}' ({}): {}", name, status, body));
        }

        debug!(model = name, "Ollama model resident");
        Ok(RemoteModel {
            name: name.to_string(),
        })
    }

    /// Stream a completion into `sink`.
    pub async fn generate(
        &self,
        model: &RemoteModel,
        prompt: &str,
        config: &GenerationConfig,
        sink: TokenSink,
    ) -> Result<()> {
        let url = format!("{}/api/generate", self.host);
        let request = OllamaRequest {
            model: &model.name,
            prompt,
            stream: true,
            keep_alive: -1,
            options: OllamaOptions::from(config),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to connect to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Ollama request failed with status {}: {}",
                status,
                body
            ));
        }

        let mut lines = body_lines(response.bytes_stream());
        while let Some(line) = lines.next_line().await.context("Ollama stream interrupted")? {
            if forward_chunk(&line, &sink).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Let Ollama evict the model.
    pub async fn release(&self, model: &RemoteModel) -> Result<()> {
        let url = format!("{}/api/generate", self.host);
        let response = self
            .client
            .post(&url)
            .json(&KeepAliveRequest {
                model: &model.name,
                keep_alive: 0,
            })
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("Failed to connect to Ollama")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Ollama failed to unload '{}': {}",
                model.name,
                response.status()
            ));
        }
        Ok(())
    }

    /// Check if the backend is available/reachable.
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.host);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .context("Failed to connect to Ollama - is it running?")?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(anyhow!("Ollama health check failed: {}", response.status()))
        }
    }
}

/// Forward one NDJSON line. Returns true once generation is over.
async fn forward_chunk(line: &str, sink: &TokenSink) -> Result<bool> {
    if line.trim().is_empty() {
        return Ok(false);
    }
    let chunk: OllamaChunk =
        serde_json::from_str(line).with_context(|| format!("Unexpected Ollama chunk: {}", line))?;
    if let Some(error) = chunk.error {
        return Err(anyhow!("Ollama error: {}", error));
    }
    if !chunk.response.is_empty() && sink.push(chunk.response).await.is_err() {
        // Session is gone; stop reading
        return Ok(true);
    }
    Ok(chunk.done)
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    keep_alive: i64,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct KeepAliveRequest<'a> {
    model: &'a str,
    keep_alive: i64,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_ctx: u32,
    /// -1 lets generation run until the context is full.
    num_predict: i64,
    temperature: f32,
    top_k: u32,
    top_p: f32,
    repeat_penalty: f32,
}

impl From<&GenerationConfig> for OllamaOptions {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            num_ctx: config.context_length,
            num_predict: config.max_new_tokens.map(i64::from).unwrap_or(-1),
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            repeat_penalty: config.repetition_penalty,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}
