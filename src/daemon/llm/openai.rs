//! OpenAI-compatible backend implementation.
//!
//! Targets servers that expose `/v1/completions` with server-sent events,
//! such as the llama.cpp server or vLLM. These servers load their models at
//! startup, so `load` only checks the model is served and `release` is a no-op.

use super::{body_lines, RemoteModel, TokenSink};
use crate::config::GenerationConfig;
use anyhow::{anyhow, Context, Result};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Backend for OpenAI-compatible completion servers.
pub struct OpenAIBackend {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAIBackend {
    /// Create a new OpenAI-compatible backend.
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    /// Get the API key from config or environment. Local servers need none.
    fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.api_key() {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }

    /// Confirm the server lists the model.
    pub async fn load(&self, name: &str) -> Result<RemoteModel> {
        let models = self.list_models().await?;
        if !models.iter().any(|m| m == name) {
            return Err(anyhow!(
                "Model '{}' is not served by {} (available: {})",
                name,
                self.base_url,
                models.join(", ")
            ));
        }
        Ok(RemoteModel {
            name: name.to_string(),
        })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .authorized(self.client.get(&url))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("Failed to connect to the completions server")?;

        if !response.status().is_success() {
            return Err(anyhow!("Listing models failed: {}", response.status()));
        }

        let list: ModelList = response
            .json()
            .await
            .context("Failed to parse model list")?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    /// Stream a completion into `sink`.
    pub async fn generate(
        &self,
        model: &RemoteModel,
        prompt: &str,
        config: &GenerationConfig,
        sink: TokenSink,
    ) -> Result<()> {
        let url = format!("{}/completions", self.base_url);
        let request = CompletionRequest {
            model: &model.name,
            prompt,
            stream: true,
            max_tokens: config.max_new_tokens,
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            repetition_penalty: config.repetition_penalty,
        };

        let response = self
            .authorized(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .context("Failed to connect to the completions server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body: Result<ApiError, _> = response.json().await;
            let message = body
                .map(|e| e.error.message)
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Completion request failed with status {}: {}",
                status,
                message
            ));
        }

        let mut lines = body_lines(response.bytes_stream());
        while let Some(line) = lines.next_line().await.context("Completion stream interrupted")? {
            if forward_event(&line, &sink).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    pub async fn release(&self, model: &RemoteModel) -> Result<()> {
        debug!(model = %model.name, "Server manages model memory; nothing to release");
        Ok(())
    }

    /// Check if the server is reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.list_models().await.map(|_| ())
    }
}

/// Forward one SSE line. Returns true once the stream is finished.
async fn forward_event(line: &str, sink: &TokenSink) -> Result<bool> {
    let Some(data) = line.strip_prefix("data:") else {
        // Comments, event names and keep-alives
        return Ok(false);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(true);
    }
    let chunk: CompletionChunk =
        serde_json::from_str(data).with_context(|| format!("Unexpected completion chunk: {}", data))?;
    if let Some(error) = chunk.error {
        return Err(anyhow!("Completion server error: {}", error.message));
    }
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(false);
    };
    if !choice.text.is_empty() && sink.push(choice.text).await.is_err() {
        return Ok(true);
    }
    Ok(choice.finish_reason.is_some())
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
    top_k: u32,
    top_p: f32,
    repetition_penalty: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}
