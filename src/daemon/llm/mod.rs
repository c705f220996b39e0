//! Inference backend implementations.
//!
//! The daemon only needs four things from an inference engine: load a model
//! by name, encode a prompt, stream generated fragments into a [`TokenSink`],
//! and release a model. [`InferenceEngine`] captures that contract; [`Backend`]
//! is the production implementation over the supported HTTP servers.

#[cfg(test)]
pub mod mock;
pub mod ollama;
pub mod openai;

use crate::config::{BackendConfig, GenerationConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::io::StreamReader;

/// Capability contract of an inference engine.
#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    /// Loaded weights, shared by every session using the model.
    type Model: Send + Sync + 'static;
    /// Tokenizer loaded alongside the model.
    type Tokenizer: Send + Sync + 'static;
    /// Encoded prompt handed to `generate`.
    type Input: Send + 'static;

    /// Load a model and its tokenizer by name.
    async fn load(&self, name: &str) -> Result<(Self::Model, Self::Tokenizer)>;

    /// Encode a prompt for `generate`.
    fn encode(&self, tokenizer: &Self::Tokenizer, text: &str) -> Result<Self::Input>;

    /// Decode until exhaustion, pushing text fragments into `sink` in order.
    ///
    /// Dropping the sink is the end-of-stream signal, so it happens on every
    /// return path.
    async fn generate(
        &self,
        model: &Self::Model,
        input: Self::Input,
        config: &GenerationConfig,
        sink: TokenSink,
    ) -> Result<()>;

    /// Reclaim whatever the engine holds for a model that left the cache.
    async fn release(&self, model: &Self::Model) -> Result<()>;
}

/// Producer half of the bounded channel between a decode task and its session.
pub struct TokenSink {
    tx: mpsc::Sender<String>,
}

impl TokenSink {
    /// Create a sink and the receiver a session drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Push one fragment, waiting while the channel is full.
    ///
    /// Fails once the consuming session has gone away; engines should stop
    /// decoding when that happens.
    pub async fn push(&self, fragment: impl Into<String>) -> Result<()> {
        self.tx
            .send(fragment.into())
            .await
            .map_err(|_| anyhow!("Token consumer closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Handle for a model served by a remote inference server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteModel {
    pub name: String,
}

/// The remote servers tokenize themselves, so encoding passes text through.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTokenizer;

/// Enum-based backend for inference servers.
pub enum Backend {
    Ollama(ollama::OllamaBackend),
    OpenAI(openai::OpenAIBackend),
}

impl Backend {
    /// Get the backend name.
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Ollama(_) => "ollama",
            Backend::OpenAI(_) => "openai",
        }
    }

    /// Check if the backend server is reachable.
    pub async fn health_check(&self) -> Result<()> {
        match self {
            Backend::Ollama(b) => b.health_check().await,
            Backend::OpenAI(b) => b.health_check().await,
        }
    }
}

#[async_trait]
impl InferenceEngine for Backend {
    type Model = RemoteModel;
    type Tokenizer = PassthroughTokenizer;
    type Input = String;

    async fn load(&self, name: &str) -> Result<(RemoteModel, PassthroughTokenizer)> {
        let model = match self {
            Backend::Ollama(b) => b.load(name).await?,
            Backend::OpenAI(b) => b.load(name).await?,
        };
        Ok((model, PassthroughTokenizer))
    }

    fn encode(&self, _tokenizer: &PassthroughTokenizer, text: &str) -> Result<String> {
        Ok(text.to_string())
    }

    async fn generate(
        &self,
        model: &RemoteModel,
        input: String,
        config: &GenerationConfig,
        sink: TokenSink,
    ) -> Result<()> {
        match self {
            Backend::Ollama(b) => b.generate(model, &input, config, sink).await,
            Backend::OpenAI(b) => b.generate(model, &input, config, sink).await,
        }
    }

    async fn release(&self, model: &RemoteModel) -> Result<()> {
        match self {
            Backend::Ollama(b) => b.release(model).await,
            Backend::OpenAI(b) => b.release(model).await,
        }
    }
}

/// Create a backend from configuration.
pub fn create_backend(config: &BackendConfig) -> Result<Backend> {
    Ok(match config {
        BackendConfig::Ollama { host } => Backend::Ollama(ollama::OllamaBackend::new(host.clone())?),
        BackendConfig::OpenAI { base_url, api_key } => {
            Backend::OpenAI(openai::OpenAIBackend::new(base_url.clone(), api_key.clone())?)
        }
    })
}

/// Lines of a streamed HTTP body, reassembled across chunk boundaries.
pub(crate) fn body_lines<S>(body: S) -> Lines<impl AsyncBufRead + Unpin>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    StreamReader::new(body.map_err(io::Error::other)).lines()
}
