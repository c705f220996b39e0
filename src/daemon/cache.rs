//! Cache of loaded models shared by every session.
//!
//! Loads are single-flight: concurrent callers for the same uncached name
//! await one load. Sessions hold a [`ModelLease`] while they use an entry, and
//! an evicted entry is only released to the engine once its last lease drops.

use crate::daemon::llm::InferenceEngine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OnceCell};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// A loaded model and its tokenizer.
pub struct ModelEntry<E: InferenceEngine> {
    name: String,
    model: E::Model,
    tokenizer: E::Tokenizer,
    leases: AtomicUsize,
    idle: Notify,
}

impl<E: InferenceEngine> ModelEntry<E> {
    fn new(name: &str, model: E::Model, tokenizer: E::Tokenizer) -> Self {
        Self {
            name: name.to_string(),
            model,
            tokenizer,
            leases: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &E::Model {
        &self.model
    }

    pub fn tokenizer(&self) -> &E::Tokenizer {
        &self.tokenizer
    }

    /// Number of live leases.
    pub fn leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            // Registered before the check so a release in between is not missed
            let notified = self.idle.notified();
            if self.leases() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// A session's counted hold on a [`ModelEntry`].
pub struct ModelLease<E: InferenceEngine> {
    entry: Arc<ModelEntry<E>>,
}

impl<E: InferenceEngine> ModelLease<E> {
    fn new(entry: Arc<ModelEntry<E>>) -> Self {
        entry.leases.fetch_add(1, Ordering::AcqRel);
        Self { entry }
    }
}

impl<E: InferenceEngine> Clone for ModelLease<E> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.entry))
    }
}

impl<E: InferenceEngine> Drop for ModelLease<E> {
    fn drop(&mut self) {
        if self.entry.leases.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.entry.idle.notify_waiters();
        }
    }
}

impl<E: InferenceEngine> Deref for ModelLease<E> {
    type Target = ModelEntry<E>;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

type Slot<E> = Arc<OnceCell<Arc<ModelEntry<E>>>>;

/// Keyed store of loaded models.
pub struct ModelCache<E: InferenceEngine> {
    engine: Arc<E>,
    slots: Mutex<HashMap<String, Slot<E>>>,
    reclaims: TaskTracker,
}

impl<E: InferenceEngine> ModelCache<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            slots: Mutex::new(HashMap::new()),
            reclaims: TaskTracker::new(),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Get a lease on `name`, loading it on a miss.
    ///
    /// Returns `None` if loading fails; the failure is logged, not cached.
    pub async fn get(&self, name: &str) -> Option<ModelLease<E>> {
        loop {
            let slot = Arc::clone(self.slots.lock().entry(name.to_string()).or_default());

            let loaded = slot
                .get_or_try_init(|| async {
                    info!(model = name, "Loading model");
                    let (model, tokenizer) = self.engine.load(name).await?;
                    info!(model = name, "Model loaded");
                    Ok::<_, anyhow::Error>(Arc::new(ModelEntry::new(name, model, tokenizer)))
                })
                .await;

            let entry = match loaded {
                Ok(entry) => Arc::clone(entry),
                Err(e) => {
                    error!(model = name, "Failed to load model: {:#}", e);
                    self.discard_empty(name, &slot);
                    return None;
                }
            };

            // Lease under the map lock so an eviction cannot slip in between
            let lease = {
                let slots = self.slots.lock();
                slots
                    .get(name)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot))
                    .then(|| ModelLease::new(entry))
            };
            if lease.is_some() {
                return lease;
            }
            debug!(model = name, "Model evicted while loading; retrying");
        }
    }

    fn discard_empty(&self, name: &str, slot: &Slot<E>) {
        let mut slots = self.slots.lock();
        if slot.get().is_none() && slots.get(name).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(name);
        }
    }

    /// Names of all fully loaded models.
    pub fn loaded_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.get().is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Evict `name` if it is loaded. A load still in progress is left alone.
    ///
    /// The caller decides when to [`reclaim`](Self::reclaim) the returned entry.
    pub fn remove(&self, name: &str) -> Option<Arc<ModelEntry<E>>> {
        let mut slots = self.slots.lock();
        let entry = slots.get(name)?.get().cloned()?;
        slots.remove(name);
        Some(entry)
    }

    /// Release an evicted entry once no session holds it, in the background.
    pub fn reclaim(&self, entry: Arc<ModelEntry<E>>) {
        let engine = Arc::clone(&self.engine);
        self.reclaims.spawn(async move {
            if entry.leases() > 0 {
                debug!(model = entry.name(), leases = entry.leases(), "Deferring release until sessions finish");
            }
            entry.wait_idle().await;
            match engine.release(&entry.model).await {
                Ok(()) => info!(model = entry.name(), "Model released"),
                Err(e) => warn!(model = entry.name(), "Failed to release model: {:#}", e),
            }
        });
    }

    /// Evict and release everything, waiting at most `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let models = self.loaded_models();
        if !models.is_empty() {
            info!(?models, "Releasing cached models");
        }
        let entries: Vec<_> = {
            let mut slots = self.slots.lock();
            slots.drain().filter_map(|(_, slot)| slot.get().cloned()).collect()
        };
        for entry in entries {
            self.reclaim(entry);
        }
        self.reclaims.close();
        if tokio::time::timeout(grace, self.reclaims.wait()).await.is_err() {
            warn!("Timed out releasing models; some may still be held by the backend");
        }
    }
}
