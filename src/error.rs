//! Error types that surface on the protocol channel.
//!
//! Application plumbing (config, backends, CLI) uses `anyhow`. The enums here
//! cover failures that must be reported to a client as an `error` event; their
//! `Display` output is exactly the wire message.

use thiserror::Error;

/// A per-request failure reported as a single `error` event.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The line was not valid JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The line was JSON but not a well-formed request object.
    #[error("Invalid request: {source}")]
    InvalidRequest {
        req_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Missing 'model' field")]
    MissingModel,

    #[error("Empty prompt")]
    EmptyPrompt,

    #[error("Model '{0}' not found")]
    ModelNotFound(String),

    #[error("Failed to load model")]
    LoadFailed,

    #[error("Model not loaded")]
    NotLoaded,

    #[error("Server busy: request queue is full")]
    QueueFull,

    #[error("Request cancelled: daemon shutting down")]
    ShuttingDown,
}

/// Why a streaming session ended without `done`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Expected rejection; reported without a trace.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Anything raised while encoding, decoding or draining.
    #[error(transparent)]
    Generation(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages() {
        assert_eq!(RequestError::EmptyPrompt.to_string(), "Empty prompt");
        assert_eq!(
            RequestError::ModelNotFound("bad-model".into()).to_string(),
            "Model 'bad-model' not found"
        );
        assert_eq!(RequestError::LoadFailed.to_string(), "Failed to load model");
        assert_eq!(RequestError::NotLoaded.to_string(), "Model not loaded");
    }

    #[test]
    fn test_invalid_json_prefix() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let message = RequestError::InvalidJson(err).to_string();
        assert!(message.starts_with("Invalid JSON: "), "{message}");
    }
}
