//! Client side of the daemon protocol.
//!
//! A [`DaemonClient`] owns the daemon's input channel and a reader task over
//! its output channel. The reader routes each event to the request that
//! registered its `req_id`, so many requests can be in flight at once.

use crate::protocol::{framing, Command, Event, EventBody, Request};
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>>;

/// Connection to a running daemon.
pub struct DaemonClient {
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    routes: Routes,
    reader: JoinHandle<()>,
    child: Option<Child>,
}

impl DaemonClient {
    /// Start `exe run` as a child process and connect to its stdin/stdout.
    ///
    /// `global_args` go before the subcommand. The child's stderr is inherited.
    pub fn spawn(exe: &Path, global_args: &[OsString]) -> Result<Self> {
        let mut child = ProcessCommand::new(exe)
            .args(global_args)
            .arg("run")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start daemon: {}", exe.display()))?;

        let stdin = child.stdin.take().context("Daemon stdin was not captured")?;
        let stdout = child.stdout.take().context("Daemon stdout was not captured")?;
        debug!(pid = ?child.id(), "Daemon process started");

        let mut client = Self::connect(stdin, stdout);
        client.child = Some(child);
        Ok(client)
    }

    /// Talk to a daemon over an existing pair of streams.
    pub fn connect<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let routes = Routes::default();
        let reader = tokio::spawn(route_events(reader, Arc::clone(&routes)));
        Self {
            writer: Box::new(writer),
            routes,
            reader,
            child: None,
        }
    }

    /// Start a generation and return its fragments as they arrive.
    ///
    /// `model: None` lets the daemon use its default model.
    pub async fn generate(&mut self, model: Option<&str>, prompt: &str, args: Value) -> Result<TokenStream> {
        let req_id = Uuid::new_v4().to_string();
        let request = Request::generate(&req_id, model.map(str::to_string), prompt, args);
        let events = self.send(&req_id, &request).await?;
        Ok(TokenStream {
            req_id,
            events,
            finished: false,
        })
    }

    /// Ask the daemon to load `model` and wait for its reply.
    pub async fn load(&mut self, model: &str) -> Result<()> {
        let req_id = Uuid::new_v4().to_string();
        let request = Request::control(&req_id, Command::Load, Some(model.to_string()));
        let mut events = self.send(&req_id, &request).await?;

        match events.recv().await.map(|e| e.body) {
            Some(EventBody::Loaded { loaded: true, .. }) => Ok(()),
            Some(EventBody::Loaded { error, .. }) => {
                bail!("Failed to load '{}': {}", model, error.unwrap_or_default())
            }
            Some(EventBody::Error { error, .. }) => bail!("Failed to load '{}': {}", model, error),
            Some(other) => bail!("Unexpected reply to load: {:?}", other),
            None => bail!("Daemon exited before replying to load"),
        }
    }

    /// Send `exit`, close the daemon's input, and wait up to `timeout` for it
    /// to stop. A child that does not stop in time is killed.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        let Self {
            mut writer,
            reader,
            child,
            ..
        } = self;

        let exit = Request::control(Uuid::new_v4().to_string(), Command::Exit, None);
        if let Err(e) = framing::write_line(&mut writer, &exit).await {
            debug!("Could not send exit: {:#}", e);
        }
        drop(writer);

        if let Some(mut child) = child {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => {
                    let status = status.context("Failed to wait for daemon")?;
                    debug!(%status, "Daemon exited");
                }
                Err(_) => {
                    warn!("Daemon did not exit within {:?}; killing it", timeout);
                    child.kill().await.context("Failed to kill daemon")?;
                }
            }
        }

        let abort = reader.abort_handle();
        if tokio::time::timeout(timeout, reader).await.is_err() {
            abort.abort();
        }
        Ok(())
    }

    async fn send(&mut self, req_id: &str, request: &Request) -> Result<mpsc::UnboundedReceiver<Event>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(req_id.to_string(), tx);
        if let Err(e) = framing::write_line(&mut self.writer, request).await {
            self.routes.lock().remove(req_id);
            return Err(e.context("Failed to send request to daemon"));
        }
        Ok(rx)
    }
}

/// Fragments of one generation, in order.
pub struct TokenStream {
    req_id: String,
    events: mpsc::UnboundedReceiver<Event>,
    finished: bool,
}

impl TokenStream {
    pub fn req_id(&self) -> &str {
        &self.req_id
    }

    /// The next fragment, or `None` once the daemon reports `done`.
    ///
    /// An `error` event from the daemon becomes an `Err`.
    pub async fn next(&mut self) -> Result<Option<String>> {
        if self.finished {
            return Ok(None);
        }
        let event = self.events.recv().await;
        if event.as_ref().map_or(true, Event::is_terminal) {
            self.finished = true;
        }
        match event.map(|e| e.body) {
            Some(EventBody::Token { token }) => Ok(Some(token)),
            Some(EventBody::Done { .. }) => Ok(None),
            Some(EventBody::Error { error, .. }) => Err(anyhow!("{}", error)),
            Some(other) => bail!("Unexpected event for generation {}: {:?}", self.req_id, other),
            None => bail!("Daemon exited before finishing generation {}", self.req_id),
        }
    }

    /// Read the rest of the stream into one string.
    pub async fn collect(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await? {
            text.push_str(&fragment);
        }
        Ok(text)
    }
}

async fn route_events<R: AsyncRead + Unpin>(reader: R, routes: Routes) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read daemon output: {}", e);
                break;
            }
        };
        let event: Event = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring malformed daemon output: {}", e);
                continue;
            }
        };
        route(&routes, event);
    }

    // Waiting streams see the daemon go away
    routes.lock().clear();
    debug!("Daemon output closed");
}

fn route(routes: &Routes, event: Event) {
    let mut routes = routes.lock();
    let Some(tx) = routes.get(&event.req_id) else {
        warn!(req_id = %event.req_id, "Event for unknown request: {:?}", event.body);
        return;
    };
    let req_id = event.req_id.clone();
    let terminal = event.is_terminal();
    if tx.send(event).is_err() || terminal {
        routes.remove(&req_id);
    }
}
