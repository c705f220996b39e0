//! Request dispatcher for the daemon.
//!
//! Reads requests line by line, answers control commands inline, and hands
//! generation requests to the session pool without waiting for them.

use crate::config::{Config, DaemonSettings, GenerationConfig};
use crate::daemon::cache::ModelCache;
use crate::daemon::llm::InferenceEngine;
use crate::daemon::output::{self, Output};
use crate::daemon::pool::SessionPool;
use crate::daemon::session::{GenerationJob, SessionContext};
use crate::error::RequestError;
use crate::protocol::{Command, Event, Request};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why the dispatcher stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The input channel was closed; in-flight sessions were allowed to finish.
    EndOfInput,
    /// A client sent `exit`.
    Exit,
    /// The process was interrupted.
    Interrupted,
}

/// The daemon: one dispatcher over a shared model cache.
pub struct DaemonServer<E: InferenceEngine> {
    settings: DaemonSettings,
    defaults: GenerationConfig,
    cache: Arc<ModelCache<E>>,
}

impl<E: InferenceEngine> DaemonServer<E> {
    /// Create a new daemon server around `engine`.
    pub fn new(config: &Config, engine: Arc<E>) -> Self {
        Self {
            settings: config.daemon.clone(),
            defaults: config.generation.clone(),
            cache: Arc::new(ModelCache::new(engine)),
        }
    }

    /// Serve requests from `input`, writing events to `output`, until the
    /// input ends, a client sends `exit`, or `interrupt` resolves.
    ///
    /// Every queued event is written and every cached model released before
    /// this returns.
    pub async fn run<R, W, I>(&self, input: R, output: W, interrupt: I) -> Result<Shutdown>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
        I: Future<Output = ()>,
    {
        let (output, writer) = output::spawn(output, self.settings.output_buffer);
        let cancel = CancellationToken::new();
        let ctx = SessionContext {
            cache: Arc::clone(&self.cache),
            output: output.clone(),
            defaults: self.defaults.clone(),
            token_buffer: self.settings.token_buffer,
            join_timeout: self.settings.join_timeout(),
        };
        let pool = SessionPool::spawn(
            ctx,
            self.settings.max_concurrent_sessions,
            self.settings.queue_capacity,
            cancel.clone(),
        );

        info!("Daemon ready, waiting for requests");
        let mut lines = BufReader::new(input).lines();
        tokio::pin!(interrupt);

        let reason = loop {
            let line = tokio::select! {
                _ = &mut interrupt => break Shutdown::Interrupted,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let dispatch = self.dispatch(&line, &output, &pool, &cancel);
                    tokio::pin!(dispatch);
                    let stop = tokio::select! {
                        stop = &mut dispatch => stop,
                        _ = &mut interrupt => {
                            // The request in progress still reports its cancellation
                            cancel.cancel();
                            dispatch.await;
                            Some(Shutdown::Interrupted)
                        }
                    };
                    if let Some(reason) = stop {
                        break reason;
                    }
                }
                Ok(None) => break Shutdown::EndOfInput,
                Err(e) => {
                    error!("Failed to read request: {}", e);
                    break Shutdown::EndOfInput;
                }
            }
        };

        info!(?reason, "Dispatcher stopped");
        match reason {
            Shutdown::EndOfInput => pool.drain().await,
            Shutdown::Exit | Shutdown::Interrupted => pool.cancel(self.settings.shutdown_grace()).await,
        }

        drop(output);
        if let Err(e) = writer.finish().await {
            warn!("Output writer stopped early: {:#}", e);
        }
        self.cache.shutdown(self.settings.shutdown_grace()).await;
        Ok(reason)
    }

    /// Handle one line. Returns a reason when the daemon should stop.
    async fn dispatch(
        &self,
        line: &str,
        output: &Output,
        pool: &SessionPool,
        cancel: &CancellationToken,
    ) -> Option<Shutdown> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejected input line: {}", e);
                output.emit(Event::rejected(&e)).await;
                return None;
            }
        };

        match request.command() {
            Ok(Some(Command::Load)) => self.handle_load(&request, output, cancel).await,
            Ok(Some(Command::Unload)) => self.handle_unload(&request, output).await,
            Ok(Some(Command::Exit)) => {
                info!(req_id = %request.req_id, "Received exit command");
                return Some(Shutdown::Exit);
            }
            Ok(None) => self.handle_generate(request, output, pool).await,
            Err(e) => output.emit(Event::error(&request.req_id, e.to_string())).await,
        }
        None
    }

    /// Load a model inline; the read loop waits for it unless shutdown starts.
    async fn handle_load(&self, request: &Request, output: &Output, cancel: &CancellationToken) {
        let model = match request.require_model() {
            Ok(model) => model,
            Err(e) => return output.emit(Event::error(&request.req_id, e.to_string())).await,
        };
        let error = tokio::select! {
            biased;
            _ = cancel.cancelled() => Some(RequestError::ShuttingDown.to_string()),
            lease = self.cache.get(model) => match lease {
                Some(_) => None,
                None => Some(RequestError::LoadFailed.to_string()),
            },
        };
        output.emit(Event::loaded(&request.req_id, model, error)).await;
    }

    /// Evict a model now; its memory is released once no session uses it.
    async fn handle_unload(&self, request: &Request, output: &Output) {
        let model = match request.require_model() {
            Ok(model) => model,
            Err(e) => return output.emit(Event::error(&request.req_id, e.to_string())).await,
        };
        let error = match self.cache.remove(model) {
            Some(entry) => {
                info!(model, "Model evicted");
                self.cache.reclaim(entry);
                None
            }
            None => Some(RequestError::NotLoaded.to_string()),
        };
        output.emit(Event::unloaded(&request.req_id, model, error)).await;
    }

    async fn handle_generate(&self, request: Request, output: &Output, pool: &SessionPool) {
        let prompt = request.prompt.unwrap_or_default();
        if prompt.is_empty() {
            return output.emit(Event::empty_prompt(&request.req_id, prompt)).await;
        }
        let model = request
            .model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.settings.default_model.clone());

        debug!(req_id = %request.req_id, model = %model, "Queueing generation");
        let job = GenerationJob {
            req_id: request.req_id,
            model,
            prompt,
            args: request.args,
        };
        let req_id = job.req_id.clone();
        if let Err(e) = pool.submit(job) {
            output.emit(Event::error(req_id, e.to_string())).await;
        }
    }
}
