//! Serialized writes to the protocol channel.
//!
//! Every emitter sends events through a queue to one writer task, which owns
//! the output stream and writes each event as one flushed line. Lines from
//! different emitters never interleave.

use crate::protocol::{framing, Event};
use anyhow::{Context, Result};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Cloneable handle used by the dispatcher and sessions to emit events.
#[derive(Clone)]
pub struct Output {
    tx: mpsc::Sender<Event>,
}

impl Output {
    /// Queue an event for writing, waiting if the writer is behind.
    pub async fn emit(&self, event: Event) {
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event).await {
            warn!(req_id = %event.req_id, "Output closed; dropping event");
        }
    }

    /// Queue `event` only if `claim` succeeds once there is room for it.
    ///
    /// Nothing is awaited between the claim and the send, so a caller
    /// aborted while waiting leaves its claim for someone else to take.
    pub async fn emit_claimed(&self, event: Event, claim: impl FnOnce() -> bool) {
        let Ok(permit) = self.tx.reserve().await else {
            warn!(req_id = %event.req_id, "Output closed; dropping event");
            return;
        };
        if claim() {
            permit.send(event);
        } else {
            debug!(req_id = %event.req_id, "Event already reported; skipping");
        }
    }
}

/// The writer task; finish it after every [`Output`] handle is dropped.
pub struct OutputWriter {
    handle: JoinHandle<Result<()>>,
}

impl OutputWriter {
    /// Wait until every queued event has been written.
    pub async fn finish(self) -> Result<()> {
        self.handle.await.context("Output writer task failed")?
    }
}

/// Start the writer task over `writer`.
pub fn spawn<W>(writer: W, capacity: usize) -> (Output, OutputWriter)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(write_events(writer, rx));
    (Output { tx }, OutputWriter { handle })
}

async fn write_events<W>(mut writer: W, mut rx: mpsc::Receiver<Event>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        if let Err(e) = framing::write_line(&mut writer, &event).await {
            // Dropping the receiver makes later emits fail fast
            error!("Failed to write event: {:#}", e);
            return Err(e.context("Protocol output closed"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_events_are_written_as_lines() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let (output, task) = spawn(writer, 4);
        output.emit(Event::token("1", "hi")).await;
        output.emit(Event::done("1")).await;
        drop(output);
        task.finish().await.unwrap();

        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "{\"req_id\":\"1\",\"token\":\"hi\"}\n{\"req_id\":\"1\",\"done\":true}\n");
    }

    #[tokio::test]
    async fn test_concurrent_emitters_never_interleave() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let (output, task) = spawn(writer, 2);

        let collect = tokio::spawn(async move {
            let mut text = String::new();
            reader.read_to_string(&mut text).await.unwrap();
            text
        });

        let mut emitters = Vec::new();
        for session in 0..8 {
            let output = output.clone();
            emitters.push(tokio::spawn(async move {
                for i in 0..25 {
                    let fragment = format!("s{session}-{i} {}", "x".repeat(40));
                    output.emit(Event::token(session.to_string(), fragment)).await;
                }
                output.emit(Event::done(session.to_string())).await;
            }));
        }
        for emitter in emitters {
            emitter.await.unwrap();
        }
        drop(output);
        task.finish().await.unwrap();

        let text = collect.await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 8 * 26);
        for session in 0..8 {
            let id = session.to_string();
            let events: Vec<Event> = lines
                .iter()
                .map(|l| serde_json::from_str::<Event>(l).unwrap())
                .filter(|e| e.req_id == id)
                .collect();
            assert_eq!(events.len(), 26);
            assert!(events.last().unwrap().is_terminal());
            // Per-emitter order survives
            for (i, event) in events[..25].iter().enumerate() {
                let expected = format!("s{session}-{i} ");
                assert!(matches!(&event.body, crate::protocol::EventBody::Token { token } if token.starts_with(&expected)));
            }
        }
    }

    #[tokio::test]
    async fn test_claimed_emit_happens_once() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let (output, task) = spawn(writer, 4);
        let mut unclaimed = true;
        output.emit_claimed(Event::done("1"), || std::mem::take(&mut unclaimed)).await;
        output.emit_claimed(Event::error("1", "late"), || std::mem::take(&mut unclaimed)).await;
        drop(output);
        task.finish().await.unwrap();

        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "{\"req_id\":\"1\",\"done\":true}\n");
    }

    #[tokio::test]
    async fn test_emit_after_writer_failure_does_not_panic() {
        let (writer, reader) = tokio::io::duplex(8);
        drop(reader);
        let (output, task) = spawn(writer, 1);
        output.emit(Event::done("1")).await;
        output.emit(Event::done("2")).await;
        drop(output);
        assert!(task.finish().await.is_err());
    }
}
