//! Configuration management for llmd.
//!
//! Configuration is loaded from `~/.config/llmd/config.toml` unless another
//! path is given on the command line.

use crate::protocol::GenerationArgs;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Inference backend configuration.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Dispatcher, pool and shutdown settings.
    #[serde(default)]
    pub daemon: DaemonSettings,
    /// Defaults applied to every generation request.
    #[serde(default)]
    pub generation: GenerationConfig,
}

/// Backend configuration for inference servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Ollama local server.
    Ollama {
        /// Ollama host URL (default: http://localhost:11434).
        #[serde(default = "default_ollama_host")]
        host: String,
    },
    /// Any server exposing the OpenAI completions API (llama.cpp, vLLM).
    OpenAI {
        /// API base URL including the version prefix.
        #[serde(default = "default_openai_base_url")]
        base_url: String,
        /// API key (prefer OPENAI_API_KEY env var).
        #[serde(default)]
        api_key: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Ollama {
            host: default_ollama_host(),
        }
    }
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_base_url() -> String {
    "http://localhost:8080/v1".to_string()
}

/// Dispatcher and session pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Model used by generation requests that omit `model`.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Sessions allowed to stream at the same time.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Generation requests allowed to wait for a free slot.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Fragments buffered between a decode task and its session.
    #[serde(default = "default_token_buffer")]
    pub token_buffer: usize,
    /// Events buffered in front of the stdout writer.
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
    /// How long a session waits for its decode task after the stream ends.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    /// How long `exit` waits for cancelled sessions and model release.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            queue_capacity: default_queue_capacity(),
            token_buffer: default_token_buffer(),
            output_buffer: default_output_buffer(),
            join_timeout_ms: default_join_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_model() -> String {
    "qwen3:0.6b".to_string()
}

fn default_max_concurrent_sessions() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_token_buffer() -> usize {
    64
}

fn default_output_buffer() -> usize {
    1024
}

fn default_join_timeout_ms() -> u64 {
    2000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

impl DaemonSettings {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Generation parameters handed to the inference backend.
///
/// Sampling is always stochastic; there is no greedy mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    /// Unset means generation is bounded only by the context length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            context_length: default_context_length(),
            max_new_tokens: None,
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
        }
    }
}

fn default_context_length() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_k() -> u32 {
    40
}

fn default_top_p() -> f32 {
    0.9
}

fn default_repetition_penalty() -> f32 {
    1.1
}

impl GenerationConfig {
    /// Apply a request's overrides on top of these defaults.
    ///
    /// A token budget larger than the context length is dropped; the context
    /// length alone then bounds generation.
    pub fn with_args(&self, args: &GenerationArgs) -> Self {
        let max_new_tokens = match args.max_new_tokens {
            Some(None) | Some(Some(0)) => None,
            Some(Some(n)) => Some(n),
            None => self.max_new_tokens,
        };
        let mut config = Self {
            context_length: args.context_length.unwrap_or(self.context_length),
            max_new_tokens,
            temperature: args.temperature.unwrap_or(self.temperature),
            top_k: args.top_k.unwrap_or(self.top_k),
            top_p: args.top_p.unwrap_or(self.top_p),
            repetition_penalty: args.repetition_penalty.unwrap_or(self.repetition_penalty),
        };
        if config.max_new_tokens.is_some_and(|n| config.context_length < n) {
            config.max_new_tokens = None;
        }
        config
    }
}

impl Config {
    /// Get the config directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("llmd"))
            .context("Could not determine config directory")
    }

    /// Get the config file path.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, using defaults if not found.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, using defaults if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        let daemon = &self.daemon;
        if daemon.max_concurrent_sessions == 0 {
            bail!("daemon.max_concurrent_sessions must be at least 1");
        }
        if daemon.queue_capacity == 0 {
            bail!("daemon.queue_capacity must be at least 1");
        }
        if daemon.token_buffer == 0 || daemon.output_buffer == 0 {
            bail!("daemon.token_buffer and daemon.output_buffer must be at least 1");
        }
        if daemon.default_model.trim().is_empty() {
            bail!("daemon.default_model must not be empty");
        }
        Ok(())
    }

    /// Get the backend type as a string.
    pub fn backend_type(&self) -> &'static str {
        match &self.backend {
            BackendConfig::Ollama { .. } => "ollama",
            BackendConfig::OpenAI { .. } => "openai",
        }
    }
}
