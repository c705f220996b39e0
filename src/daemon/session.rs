//! One generation request, end to end.
//!
//! A session resolves its model through the cache, starts a decode task that
//! pushes fragments into a bounded channel, and turns each fragment into a
//! `token` event. Whatever happens, it finishes with exactly one terminal
//! event: `done`, or `error` if anything failed.

use crate::config::GenerationConfig;
use crate::daemon::cache::ModelCache;
use crate::daemon::llm::{InferenceEngine, TokenSink};
use crate::daemon::output::Output;
use crate::error::{RequestError, SessionError};
use crate::protocol::{Event, GenerationArgs};
use anyhow::{anyhow, Context};
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A validated generation request waiting for a session.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub req_id: String,
    pub model: String,
    pub prompt: String,
    pub args: Value,
}

/// Everything a session needs besides its job.
pub struct SessionContext<E: InferenceEngine> {
    pub cache: Arc<ModelCache<E>>,
    pub output: Output,
    pub defaults: GenerationConfig,
    pub token_buffer: usize,
    pub join_timeout: Duration,
}

impl<E: InferenceEngine> Clone for SessionContext<E> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            output: self.output.clone(),
            defaults: self.defaults.clone(),
            token_buffer: self.token_buffer,
            join_timeout: self.join_timeout,
        }
    }
}

pub struct StreamingSession<E: InferenceEngine> {
    ctx: SessionContext<E>,
    job: GenerationJob,
    cancel: CancellationToken,
}

impl<E: InferenceEngine> StreamingSession<E> {
    pub fn new(ctx: SessionContext<E>, job: GenerationJob, cancel: CancellationToken) -> Self {
        Self { ctx, job, cancel }
    }

    /// Stream the job and return its terminal event; the caller emits it.
    pub async fn finish(self) -> Event {
        let req_id = self.job.req_id.clone();
        debug!(req_id = %req_id, model = %self.job.model, "Session started");

        let outcome = AssertUnwindSafe(self.stream()).catch_unwind().await;
        let terminal = match outcome {
            Ok(Ok(())) => Event::done(&req_id),
            Ok(Err(SessionError::Request(e))) => {
                debug!(req_id = %req_id, "Session rejected: {}", e);
                Event::error(&req_id, e.to_string())
            }
            Ok(Err(SessionError::Generation(e))) => {
                warn!(req_id = %req_id, "Generation failed: {:#}", e);
                Event::failure(&req_id, &e)
            }
            Err(panic) => {
                let err = anyhow!("Session panicked: {}", panic_message(&*panic));
                warn!(req_id = %req_id, "{}", err);
                Event::failure(&req_id, &err)
            }
        };
        debug!(req_id = %req_id, "Session finished");
        terminal
    }

    async fn stream(&self) -> Result<(), SessionError> {
        let job = &self.job;
        let lease = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RequestError::ShuttingDown.into()),
            lease = self.ctx.cache.get(&job.model) => {
                lease.ok_or_else(|| RequestError::ModelNotFound(job.model.clone()))?
            }
        };

        let args = GenerationArgs::from_value(&job.args).context("Invalid generation args")?;
        let config = self.ctx.defaults.with_args(&args);
        let engine = Arc::clone(self.ctx.cache.engine());
        let input = engine
            .encode(lease.tokenizer(), &job.prompt)
            .context("Failed to encode prompt")?;
        if self.cancel.is_cancelled() {
            return Err(RequestError::ShuttingDown.into());
        }

        let (sink, mut fragments) = TokenSink::channel(self.ctx.token_buffer);
        let decode_lease = lease.clone();
        let decode = tokio::spawn(async move {
            engine
                .generate(decode_lease.model(), input, &config, sink)
                .await
        });

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    decode.abort();
                    return Err(RequestError::ShuttingDown.into());
                }
                fragment = fragments.recv() => match fragment {
                    Some(text) if text.is_empty() => {}
                    Some(text) => self.ctx.output.emit(Event::token(&job.req_id, text)).await,
                    None => break,
                },
            }
        }

        match tokio::time::timeout(self.ctx.join_timeout, decode).await {
            Ok(Ok(result)) => result.context("Generation failed")?,
            Ok(Err(join_error)) => {
                return Err(anyhow!("Decode task ended abnormally: {}", join_error).into());
            }
            Err(_) => warn!(
                req_id = %job.req_id,
                "Decode task still running {:?} after its stream ended; finishing anyway",
                self.ctx.join_timeout
            ),
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::llm::mock::MockEngine;
    use crate::daemon::output;
    use crate::protocol::EventBody;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    async fn run(session: StreamingSession<MockEngine>) {
        let output = session.ctx.output.clone();
        output.emit(session.finish().await).await;
    }

    async fn run_session(engine: MockEngine, job: GenerationJob, join_timeout: Duration) -> (Arc<MockEngine>, Vec<Event>) {
        let engine = Arc::new(engine);
        let cache = Arc::new(ModelCache::new(Arc::clone(&engine)));
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let (output, task) = output::spawn(writer, 16);
        let ctx = SessionContext {
            cache,
            output,
            defaults: GenerationConfig::default(),
            token_buffer: 2,
            join_timeout,
        };
        run(StreamingSession::new(ctx, job, CancellationToken::new())).await;
        task.finish().await.unwrap();

        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        let events = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        (engine, events)
    }

    fn job(model: &str, args: Value) -> GenerationJob {
        GenerationJob {
            req_id: "r1".to_string(),
            model: model.to_string(),
            prompt: "hello".to_string(),
            args,
        }
    }

    fn tokens(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match &e.body {
                EventBody::Token { token } => Some(token.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_streams_tokens_then_done() {
        let engine = MockEngine::new(["Hel", "", "lo", " world"]);
        let (_, events) = run_session(engine, job("m", Value::Null), Duration::from_secs(2)).await;
        assert_eq!(tokens(&events), vec!["Hel", "lo", " world"]);
        assert_eq!(events.last().unwrap(), &Event::done("r1"));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_missing_model_emits_single_error() {
        let engine = MockEngine::new(["a"]).failing_model("bad-model");
        let (_, events) = run_session(engine, job("bad-model", Value::Null), Duration::from_secs(2)).await;
        assert_eq!(events, vec![Event::error("r1", "Model 'bad-model' not found")]);
    }

    #[tokio::test]
    async fn test_decode_failure_after_tokens() {
        let engine = MockEngine::new(["a", "b", "c"]).fail_after(2);
        let (_, events) = run_session(engine, job("m", Value::Null), Duration::from_secs(2)).await;
        assert_eq!(tokens(&events), vec!["a", "b"]);
        assert_eq!(events.len(), 3);
        match &events[2].body {
            EventBody::Error { error, traceback, .. } => {
                assert!(error.contains("device lost during decode"), "{error}");
                assert!(traceback.is_some());
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_encode_failure_emits_error_without_tokens() {
        let engine = MockEngine::new(["a"]).fail_encode();
        let (_, events) = run_session(engine, job("m", Value::Null), Duration::from_secs(2)).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0].body, EventBody::Error { error, .. } if error.contains("Failed to encode prompt")));
    }

    #[tokio::test]
    async fn test_invalid_args_emit_error() {
        let engine = MockEngine::new(["a"]);
        let (_, events) = run_session(engine, job("m", json!({"top_k": "many"})), Duration::from_secs(2)).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0].body, EventBody::Error { error, .. } if error.starts_with("Invalid generation args")));
    }

    #[tokio::test]
    async fn test_args_reach_engine_with_precedence_applied() {
        let engine = MockEngine::new(["a"]);
        let args = json!({"n_ctx": 256, "n_len": 1000, "temperature": 0.3});
        let (engine, _) = run_session(engine, job("m", args), Duration::from_secs(2)).await;
        let configs = engine.configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].context_length, 256);
        assert_eq!(configs[0].max_new_tokens, None);
        assert_eq!(configs[0].temperature, 0.3);
    }

    #[tokio::test]
    async fn test_lingering_decode_does_not_block_done() {
        let engine = MockEngine::new(["a"]).linger(Duration::from_secs(30));
        let started = std::time::Instant::now();
        let (_, events) = run_session(engine, job("m", Value::Null), Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(tokens(&events), vec!["a"]);
        assert_eq!(events.last().unwrap(), &Event::done("r1"));
    }

    #[tokio::test]
    async fn test_cancelled_session_ends_with_error() {
        let engine = Arc::new(MockEngine::new(["a"; 100]).fragment_delay(Duration::from_millis(20)));
        let cache = Arc::new(ModelCache::new(Arc::clone(&engine)));
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let (output, task) = output::spawn(writer, 16);
        let ctx = SessionContext {
            cache,
            output,
            defaults: GenerationConfig::default(),
            token_buffer: 2,
            join_timeout: Duration::from_secs(1),
        };
        let cancel = CancellationToken::new();
        let session = tokio::spawn(run(StreamingSession::new(ctx, job("m", Value::Null), cancel.clone())));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        session.await.unwrap();
        task.finish().await.unwrap();

        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        let events: Vec<Event> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert!(tokens(&events).len() < 100);
        assert_eq!(events.last().unwrap(), &Event::error("r1", "Request cancelled: daemon shutting down"));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_slow_load() {
        let engine = Arc::new(MockEngine::new(["a"]).load_delay(Duration::from_secs(30)));
        let cache = Arc::new(ModelCache::new(Arc::clone(&engine)));
        let (writer, _reader) = tokio::io::duplex(1024);
        let (output, _task) = output::spawn(writer, 4);
        let ctx = SessionContext {
            cache,
            output,
            defaults: GenerationConfig::default(),
            token_buffer: 2,
            join_timeout: Duration::from_secs(1),
        };
        let cancel = CancellationToken::new();
        let session = tokio::spawn(StreamingSession::new(ctx, job("m", Value::Null), cancel.clone()).finish());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let terminal = tokio::time::timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
        assert_eq!(terminal, Event::error("r1", "Request cancelled: daemon shutting down"));
        assert_eq!(engine.loads(), 1);
        assert!(engine.configs().is_empty());
    }
}
