//! Wire protocol definitions for the daemon.
//!
//! The protocol is UTF-8 JSON, one object per line, in both directions.
//! Requests arrive on stdin and events leave on stdout. Log output goes to
//! stderr and never mixes with protocol lines.

use crate::error::RequestError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `req_id` used for events that have no originating request.
pub const SYSTEM_REQ_ID: &str = "system";

/// `req_id` assumed when a request omits one.
pub const UNKNOWN_REQ_ID: &str = "unknown";

fn default_req_id() -> String {
    UNKNOWN_REQ_ID.to_string()
}

/// Control commands handled inline by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Load,
    Unload,
    Exit,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Load => "load",
            Command::Unload => "unload",
            Command::Exit => "exit",
        }
    }
}

/// One inbound request line.
///
/// A request without `cmd` is a generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen identifier echoed on every event for this request.
    #[serde(default = "default_req_id")]
    pub req_id: String,
    /// Control command name; kept raw so unknown commands can be reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Generation knobs, validated when the session starts.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
}

impl Request {
    /// Build a generation request.
    pub fn generate(req_id: impl Into<String>, model: Option<String>, prompt: impl Into<String>, args: Value) -> Self {
        Self {
            req_id: req_id.into(),
            cmd: None,
            model,
            prompt: Some(prompt.into()),
            args,
        }
    }

    /// Build a control request.
    pub fn control(req_id: impl Into<String>, command: Command, model: Option<String>) -> Self {
        Self {
            req_id: req_id.into(),
            cmd: Some(command.as_str().to_string()),
            model,
            prompt: None,
            args: Value::Null,
        }
    }

    /// Parse one inbound line.
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_str(line).map_err(RequestError::InvalidJson)?;
        let req_id = value
            .get("req_id")
            .and_then(Value::as_str)
            .unwrap_or(SYSTEM_REQ_ID)
            .to_string();
        if !value.is_object() {
            return Err(RequestError::InvalidRequest {
                req_id,
                source: serde::de::Error::custom("expected a JSON object"),
            });
        }
        serde_json::from_value(value).map_err(|source| RequestError::InvalidRequest { req_id, source })
    }

    /// The control command, or `None` for a generation request.
    pub fn command(&self) -> Result<Option<Command>, RequestError> {
        match self.cmd.as_deref() {
            None => Ok(None),
            Some("load") => Ok(Some(Command::Load)),
            Some("unload") => Ok(Some(Command::Unload)),
            Some("exit") => Ok(Some(Command::Exit)),
            Some(other) => Err(RequestError::UnknownCommand(other.to_string())),
        }
    }

    /// The `model` field, treating an empty string as missing.
    pub fn require_model(&self) -> Result<&str, RequestError> {
        self.model
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or(RequestError::MissingModel)
    }
}

/// Generation knobs as they appear in a request's `args`.
///
/// Both the long names and the short engine names are accepted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerationArgs {
    #[serde(alias = "n_ctx")]
    pub context_length: Option<u32>,
    /// Outer `None` when absent. An explicit `null` or `0` means unbounded.
    #[serde(default, alias = "n_len", deserialize_with = "present")]
    pub max_new_tokens: Option<Option<u32>>,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    #[serde(alias = "repeat_penalty")]
    pub repetition_penalty: Option<f32>,
}

/// Keep an explicit `null` apart from a missing key.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl GenerationArgs {
    pub fn from_value(args: &Value) -> Result<Self, serde_json::Error> {
        if args.is_null() {
            return Ok(Self::default());
        }
        Self::deserialize(args)
    }
}

/// One outbound protocol line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub req_id: String,
    #[serde(flatten)]
    pub body: EventBody,
}

/// Payload of an [`Event`]. Variant order matters for decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventBody {
    Token {
        token: String,
    },
    Done {
        done: bool,
    },
    Loaded {
        loaded: bool,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Unloaded {
        unloaded: bool,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
}

impl Event {
    fn new(req_id: impl Into<String>, body: EventBody) -> Self {
        Self {
            req_id: req_id.into(),
            body,
        }
    }

    pub fn token(req_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self::new(req_id, EventBody::Token { token: token.into() })
    }

    pub fn done(req_id: impl Into<String>) -> Self {
        Self::new(req_id, EventBody::Done { done: true })
    }

    pub fn error(req_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            req_id,
            EventBody::Error {
                error: message.into(),
                prompt: None,
                traceback: None,
            },
        )
    }

    /// An error raised during generation, with its full cause chain as the trace.
    pub fn failure(req_id: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::new(
            req_id,
            EventBody::Error {
                error: format!("{err:#}"),
                prompt: None,
                traceback: Some(format!("{err:?}")),
            },
        )
    }

    pub fn empty_prompt(req_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            req_id,
            EventBody::Error {
                error: RequestError::EmptyPrompt.to_string(),
                prompt: Some(prompt.into()),
                traceback: None,
            },
        )
    }

    /// The event for a line that could not be turned into a request.
    pub fn rejected(err: &RequestError) -> Self {
        let req_id = match err {
            RequestError::InvalidRequest { req_id, .. } => req_id.as_str(),
            _ => SYSTEM_REQ_ID,
        };
        Self::error(req_id, err.to_string())
    }

    pub fn loaded(req_id: impl Into<String>, model: impl Into<String>, error: Option<String>) -> Self {
        Self::new(
            req_id,
            EventBody::Loaded {
                loaded: error.is_none(),
                model: model.into(),
                error,
            },
        )
    }

    pub fn unloaded(req_id: impl Into<String>, model: impl Into<String>, error: Option<String>) -> Self {
        Self::new(
            req_id,
            EventBody::Unloaded {
                unloaded: error.is_none(),
                model: model.into(),
                error,
            },
        )
    }

    /// Whether this event ends the interaction for its request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.body, EventBody::Token { .. })
    }
}

/// Framing for messages: newline-delimited JSON.
pub mod framing {
    use anyhow::Result;
    use tokio::io::{AsyncWrite, AsyncWriteExt};

    /// Write one message as a single line and flush it.
    pub async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        T: serde::Serialize,
    {
        // serde_json escapes embedded newlines, so one message is one line
        let mut json = serde_json::to_vec(message)?;
        json.push(b'\n');
        writer.write_all(&json).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_json(event: &Event) -> String {
        serde_json::to_string(event).unwrap()
    }

    #[test]
    fn test_empty_prompt_event() {
        assert_eq!(
            to_json(&Event::empty_prompt("2", "")),
            r#"{"req_id":"2","error":"Empty prompt","prompt":""}"#
        );
    }

    #[test]
    fn test_control_replies() {
        let failed = Event::loaded("3", "bad-model", Some(RequestError::LoadFailed.to_string()));
        assert_eq!(
            to_json(&failed),
            r#"{"req_id":"3","loaded":false,"model":"bad-model","error":"Failed to load model"}"#
        );
        let missing = Event::unloaded("4", "never-loaded", Some(RequestError::NotLoaded.to_string()));
        assert_eq!(
            to_json(&missing),
            r#"{"req_id":"4","unloaded":false,"model":"never-loaded","error":"Model not loaded"}"#
        );
        assert_eq!(
            to_json(&Event::loaded("5", "m", None)),
            r#"{"req_id":"5","loaded":true,"model":"m"}"#
        );
    }

    #[test]
    fn test_stream_events() {
        assert_eq!(to_json(&Event::token("1", "hel\nlo")), r#"{"req_id":"1","token":"hel\nlo"}"#);
        assert_eq!(to_json(&Event::done("1")), r#"{"req_id":"1","done":true}"#);
    }

    #[test]
    fn test_failure_carries_trace() {
        let err = anyhow::anyhow!("CUDA out of memory").context("Generation failed");
        let value = serde_json::to_value(Event::failure("9", &err)).unwrap();
        assert_eq!(value["error"], "Generation failed: CUDA out of memory");
        assert!(value["traceback"].as_str().unwrap().contains("CUDA out of memory"));
    }

    #[test]
    fn test_event_decoding_picks_variant() {
        let event: Event = serde_json::from_str(r#"{"req_id":"3","loaded":false,"model":"m","error":"x"}"#).unwrap();
        assert!(matches!(event.body, EventBody::Loaded { loaded: false, .. }));
        let event: Event = serde_json::from_str(r#"{"req_id":"1","token":"a"}"#).unwrap();
        assert!(!event.is_terminal());
        let event: Event = serde_json::from_str(r#"{"req_id":"1","error":"boom","traceback":"t"}"#).unwrap();
        assert!(event.is_terminal());
        assert!(matches!(event.body, EventBody::Error { traceback: Some(_), .. }));
    }

    #[test]
    fn test_request_defaults() {
        let req = Request::parse(r#"{"prompt":"hello"}"#).unwrap();
        assert_eq!(req.req_id, UNKNOWN_REQ_ID);
        assert_eq!(req.command().unwrap(), None);
        assert!(req.args.is_null());
    }

    #[test]
    fn test_request_commands() {
        let req = Request::parse(r#"{"cmd":"load","model":"m","req_id":"3"}"#).unwrap();
        assert_eq!(req.command().unwrap(), Some(Command::Load));
        assert_eq!(req.require_model().unwrap(), "m");

        let req = Request::parse(r#"{"cmd":"unload","model":""}"#).unwrap();
        assert!(matches!(req.require_model(), Err(RequestError::MissingModel)));

        let req = Request::parse(r#"{"cmd":"reboot"}"#).unwrap();
        assert!(matches!(req.command(), Err(RequestError::UnknownCommand(c)) if c == "reboot"));
    }

    #[test]
    fn test_invalid_lines() {
        let err = Request::parse("{\"req_id\": ").unwrap_err();
        assert_eq!(Event::rejected(&err).req_id, SYSTEM_REQ_ID);

        let err = Request::parse(r#"{"req_id":"7","prompt":42}"#).unwrap_err();
        let event = Event::rejected(&err);
        assert_eq!(event.req_id, "7");
        assert!(matches!(&event.body, EventBody::Error { error, .. } if error.starts_with("Invalid request: ")));

        let err = Request::parse("[1, 2]").unwrap_err();
        assert_eq!(Event::rejected(&err).req_id, SYSTEM_REQ_ID);
    }

    #[test]
    fn test_generation_args_aliases() {
        let args = GenerationArgs::from_value(&json!({
            "n_ctx": 1024,
            "n_len": 128,
            "repeat_penalty": 1.3,
            "top_k": 20,
            "unrelated": true
        }))
        .unwrap();
        assert_eq!(args.context_length, Some(1024));
        assert_eq!(args.max_new_tokens, Some(Some(128)));
        assert_eq!(args.repetition_penalty, Some(1.3));
        assert_eq!(args.top_k, Some(20));
        assert_eq!(args.temperature, None);

        let args = GenerationArgs::from_value(&json!({"context_length": 512, "max_new_tokens": 64})).unwrap();
        assert_eq!(args.context_length, Some(512));
        assert_eq!(args.max_new_tokens, Some(Some(64)));

        let args = GenerationArgs::from_value(&json!({"max_new_tokens": null})).unwrap();
        assert_eq!(args.max_new_tokens, Some(None));
        let args = GenerationArgs::from_value(&json!({"n_len": null})).unwrap();
        assert_eq!(args.max_new_tokens, Some(None));
        let args = GenerationArgs::from_value(&json!({"top_k": 3})).unwrap();
        assert_eq!(args.max_new_tokens, None);

        assert_eq!(GenerationArgs::from_value(&Value::Null).unwrap(), GenerationArgs::default());
        assert!(GenerationArgs::from_value(&json!({"temperature": "hot"})).is_err());
        assert!(GenerationArgs::from_value(&json!("not a map")).is_err());
    }

    #[tokio::test]
    async fn test_write_line() {
        let mut buf: Vec<u8> = Vec::new();
        framing::write_line(&mut buf, &Event::token("1", "a\nb")).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.ends_with('\n'));
    }
}
