//! Bounded pool of streaming sessions.
//!
//! The dispatcher submits jobs into a bounded queue without waiting. A
//! scheduler task starts sessions in arrival order, at most
//! `max_concurrent` at a time. A full queue rejects the job immediately.
//!
//! Every accepted job is tracked until its terminal event is queued, so a
//! shutdown that has to abort sessions can still report each one.

use crate::daemon::llm::InferenceEngine;
use crate::daemon::output::Output;
use crate::daemon::session::{GenerationJob, SessionContext, StreamingSession};
use crate::error::RequestError;
use crate::protocol::Event;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Queued {
    ticket: u64,
    job: GenerationJob,
}

/// Accepted jobs whose terminal event has not been queued yet, by ticket.
#[derive(Clone, Default)]
struct Unreported(Arc<Mutex<HashMap<u64, String>>>);

impl Unreported {
    fn insert(&self, ticket: u64, req_id: &str) {
        self.0.lock().insert(ticket, req_id.to_string());
    }

    /// Take the right to report `ticket`. Only the first caller gets it.
    fn claim(&self, ticket: u64) -> bool {
        self.0.lock().remove(&ticket).is_some()
    }

    /// Take every outstanding ticket, oldest first.
    fn take_all(&self) -> Vec<String> {
        let mut left: Vec<(u64, String)> = self.0.lock().drain().collect();
        left.sort_unstable_by_key(|(ticket, _)| *ticket);
        left.into_iter().map(|(_, req_id)| req_id).collect()
    }

    /// Report every outstanding job as cancelled by shutdown.
    async fn report_all(&self, output: &Output) {
        for req_id in self.take_all() {
            debug!(req_id = %req_id, "Reporting aborted request");
            output
                .emit(Event::error(req_id, RequestError::ShuttingDown.to_string()))
                .await;
        }
    }
}

pub struct SessionPool {
    queue: mpsc::Sender<Queued>,
    scheduler: JoinHandle<()>,
    cancel: CancellationToken,
    unreported: Unreported,
    next_ticket: AtomicU64,
    output: Output,
}

impl SessionPool {
    /// Start the scheduler. Cancelling `cancel` stops every session.
    pub fn spawn<E: InferenceEngine>(
        ctx: SessionContext<E>,
        max_concurrent: usize,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (queue, jobs) = mpsc::channel(queue_capacity);
        let limit = Arc::new(Semaphore::new(max_concurrent));
        let unreported = Unreported::default();
        let output = ctx.output.clone();
        let scheduler = tokio::spawn(schedule(ctx, jobs, limit, cancel.clone(), unreported.clone()));
        info!(max_concurrent, queue_capacity, "Session pool started");
        Self {
            queue,
            scheduler,
            cancel,
            unreported,
            next_ticket: AtomicU64::new(0),
            output,
        }
    }

    /// Queue a job without waiting.
    pub fn submit(&self, job: GenerationJob) -> Result<(), RequestError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.unreported.insert(ticket, &job.req_id);
        self.queue.try_send(Queued { ticket, job }).map_err(|e| {
            self.unreported.claim(ticket);
            match e {
                mpsc::error::TrySendError::Full(queued) => {
                    warn!(req_id = %queued.job.req_id, "Request queue full; rejecting");
                    RequestError::QueueFull
                }
                mpsc::error::TrySendError::Closed(_) => RequestError::ShuttingDown,
            }
        })
    }

    /// Stop accepting jobs and let everything queued or running finish.
    pub async fn drain(self) {
        drop(self.queue);
        if let Err(e) = self.scheduler.await {
            error!("Session scheduler failed: {}", e);
        }
        self.unreported.report_all(&self.output).await;
    }

    /// Cancel every session and wait up to `grace` for them to report.
    ///
    /// Sessions still running after `grace` are aborted and reported here.
    pub async fn cancel(self, grace: Duration) {
        self.cancel.cancel();
        drop(self.queue);
        let mut scheduler = self.scheduler;
        match tokio::time::timeout(grace, &mut scheduler).await {
            Ok(Err(e)) => error!("Session scheduler failed: {}", e),
            Ok(Ok(())) => {}
            Err(_) => {
                warn!("Sessions did not stop within {:?}; aborting them", grace);
                // Dropping the scheduler's JoinSet aborts the sessions
                scheduler.abort();
                if let Err(e) = scheduler.await {
                    debug!("Session scheduler stopped: {}", e);
                }
            }
        }
        self.unreported.report_all(&self.output).await;
    }
}

async fn schedule<E: InferenceEngine>(
    ctx: SessionContext<E>,
    mut jobs: mpsc::Receiver<Queued>,
    limit: Arc<Semaphore>,
    cancel: CancellationToken,
    unreported: Unreported,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = result {
                    error!("Session task failed: {}", e);
                }
            }
            queued = jobs.recv() => {
                let Some(Queued { ticket, job }) = queued else { break };
                let Some(permit) = acquire(&limit, &cancel).await else {
                    reject(&ctx, &unreported, ticket, job).await;
                    break;
                };
                debug!(req_id = %job.req_id, active = sessions.len() + 1, "Starting session");
                let output = ctx.output.clone();
                let session = StreamingSession::new(ctx.clone(), job, cancel.child_token());
                sessions.spawn(run_session(session, output, unreported.clone(), ticket, permit));
            }
        }
    }

    if cancel.is_cancelled() {
        jobs.close();
        while let Some(Queued { ticket, job }) = jobs.recv().await {
            reject(&ctx, &unreported, ticket, job).await;
        }
    }

    while let Some(result) = sessions.join_next().await {
        if let Err(e) = result {
            error!("Session task failed: {}", e);
        }
    }
    debug!("Session scheduler stopped");
}

async fn acquire(limit: &Arc<Semaphore>, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = Arc::clone(limit).acquire_owned() => permit.ok(),
    }
}

async fn run_session<E: InferenceEngine>(
    session: StreamingSession<E>,
    output: Output,
    unreported: Unreported,
    ticket: u64,
    _permit: OwnedSemaphorePermit,
) {
    let terminal = session.finish().await;
    output.emit_claimed(terminal, || unreported.claim(ticket)).await;
}

async fn reject<E: InferenceEngine>(ctx: &SessionContext<E>, unreported: &Unreported, ticket: u64, job: GenerationJob) {
    debug!(req_id = %job.req_id, "Dropping queued request during shutdown");
    let event = Event::error(job.req_id, RequestError::ShuttingDown.to_string());
    ctx.output.emit_claimed(event, || unreported.claim(ticket)).await;
}
