//! Validation scheduler.
//!
//! Edits do not trigger validation directly; they mark documents dirty and
//! arm a restartable debounce timer. Every further edit inside the window
//! restarts the timer, so a burst of keystrokes costs one validation run.
//! When the timer fires, the dirty set is drained, each document is
//! reconciled against its live buffer, and a single publish pass runs. A
//! publish already in flight is waited out, never raced: there is at most
//! one concurrent pass.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use ropey::Rope;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Url;

use crate::buffer::BufferStore;
use crate::engine::AnalysisEngine;
use crate::publish::{DiagnosticsPublisher, PublishOutcome};

/// A single-shot timer that can be re-armed. Re-arming cancels the pending
/// shot, so only the last `restart` within a window fires.
pub struct RestartableTimer {
    delay: Duration,
    armed: StdMutex<CancellationToken>,
}

impl RestartableTimer {
    pub fn new(delay: Duration) -> RestartableTimer {
        RestartableTimer {
            delay,
            armed: StdMutex::new(CancellationToken::new()),
        }
    }

    /// Cancel any pending shot and arm a fresh one. `fire` runs only if the
    /// full delay elapses without another restart.
    pub fn restart<F, Fut>(&self, fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = {
            let mut armed = self.armed.lock().expect("timer lock poisoned");
            armed.cancel();
            let fresh = CancellationToken::new();
            *armed = fresh.clone();
            fresh
        };
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => fire().await,
            }
        });
    }

    /// Cancel any pending shot without re-arming.
    pub fn stop(&self) {
        self.armed.lock().expect("timer lock poisoned").cancel();
    }
}

/// Tracks which document currently holds edit focus. The engine keeps a
/// cached parse for at most this one document; moving focus invalidates the
/// previous holder's cache.
struct ActiveUnitCache {
    slot: StdMutex<Option<Url>>,
}

impl ActiveUnitCache {
    fn new() -> ActiveUnitCache {
        ActiveUnitCache {
            slot: StdMutex::new(None),
        }
    }

    fn focus(&self, engine: &dyn AnalysisEngine, uri: &Url) {
        let mut slot = self.slot.lock().expect("focus lock poisoned");
        if slot.as_ref() == Some(uri) {
            return;
        }
        if let Some(previous) = slot.take() {
            engine.invalidate(&previous);
        }
        *slot = Some(uri.clone());
    }

    fn release(&self, engine: &dyn AnalysisEngine, uri: &Url) {
        let mut slot = self.slot.lock().expect("focus lock poisoned");
        if slot.as_ref() == Some(uri) {
            slot.take();
            engine.invalidate(uri);
        }
    }

    fn current(&self) -> Option<Url> {
        self.slot.lock().expect("focus lock poisoned").clone()
    }
}

struct SchedulerInner {
    store: Arc<Mutex<BufferStore>>,
    engine: Arc<dyn AnalysisEngine>,
    publisher: Arc<DiagnosticsPublisher>,
    dirty: StdMutex<HashSet<Url>>,
    active: ActiveUnitCache,
    timer: RestartableTimer,
    /// Serializes validation runs against lifecycle operations that must not
    /// observe a half-reconciled store (save, shutdown).
    reconcile_gate: Mutex<()>,
    /// At most one publish pass runs at a time.
    publish_gate: Mutex<()>,
    /// Cancels in-flight work; each debounce window hands the current pass a
    /// child token so a new edit can abandon a stale pass.
    in_flight: StdMutex<CancellationToken>,
    shutdown: CancellationToken,
}

pub struct ValidationScheduler {
    inner: Arc<SchedulerInner>,
}

impl ValidationScheduler {
    pub fn new(
        store: Arc<Mutex<BufferStore>>,
        engine: Arc<dyn AnalysisEngine>,
        publisher: Arc<DiagnosticsPublisher>,
        debounce: Duration,
    ) -> ValidationScheduler {
        ValidationScheduler {
            inner: Arc::new(SchedulerInner {
                store,
                engine,
                publisher,
                dirty: StdMutex::new(HashSet::new()),
                active: ActiveUnitCache::new(),
                timer: RestartableTimer::new(debounce),
                reconcile_gate: Mutex::new(()),
                publish_gate: Mutex::new(()),
                in_flight: StdMutex::new(CancellationToken::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Record an edit: the document joins the dirty set, takes edit focus,
    /// any stale in-flight pass is cancelled, and the debounce window
    /// restarts.
    pub fn mark_dirty(&self, uri: &Url) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner
            .dirty
            .lock()
            .expect("dirty lock poisoned")
            .insert(uri.clone());
        inner.active.focus(inner.engine.as_ref(), uri);
        {
            // Diagnostics computed for the pre-edit buffer are stale.
            let mut in_flight = inner.in_flight.lock().expect("in-flight lock poisoned");
            in_flight.cancel();
            *in_flight = CancellationToken::new();
        }
        let run = Arc::clone(inner);
        inner
            .timer
            .restart(move || SchedulerInner::run_validation(run));
    }

    /// Drop a document from the dirty set (on close).
    pub fn remove_dirty(&self, uri: &Url) {
        self.inner
            .dirty
            .lock()
            .expect("dirty lock poisoned")
            .remove(uri);
    }

    /// Release edit focus if `uri` holds it, invalidating its cached parse.
    pub fn release_focus(&self, uri: &Url) {
        self.inner.active.release(self.inner.engine.as_ref(), uri);
    }

    pub fn focused(&self) -> Option<Url> {
        self.inner.active.current()
    }

    /// Wait until any in-flight validation run and publish pass complete.
    /// Documents still dirty afterwards (edits that raced in) keep their
    /// pending window.
    pub async fn join(&self) {
        let _reconcile = self.inner.reconcile_gate.lock().await;
        let _publish = self.inner.publish_gate.lock().await;
    }

    /// Cancel any in-flight pass and wait for it to wind down. A cancelled
    /// pass re-marks its unfinished documents dirty, so the window is
    /// re-armed for them before returning.
    pub async fn quiesce(&self) {
        {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .expect("in-flight lock poisoned");
            in_flight.cancel();
            *in_flight = CancellationToken::new();
        }
        self.join().await;
        let pending = !self
            .inner
            .dirty
            .lock()
            .expect("dirty lock poisoned")
            .is_empty();
        if pending && !self.inner.shutdown.is_cancelled() {
            let run = Arc::clone(&self.inner);
            self.inner
                .timer
                .restart(move || SchedulerInner::run_validation(run));
        }
    }

    /// One synchronous publish outside the debounced pipeline, serialized
    /// with any running pass through the publish gate.
    pub async fn publish_now(&self, uri: &Url, rope: &Rope, version: Option<i32>) {
        let _publish = self.inner.publish_gate.lock().await;
        self.inner.publisher.publish_one(uri, rope, version).await;
    }

    /// Clear a document's diagnostics, serialized with any running pass.
    pub async fn clear_now(&self, uri: &Url) {
        let _publish = self.inner.publish_gate.lock().await;
        self.inner.publisher.clear(uri).await;
    }

    /// Stop the timer and cancel in-flight work. Marks made after shutdown
    /// are ignored.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.timer.stop();
        self.inner
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .cancel();
    }
}

impl SchedulerInner {
    async fn run_validation(inner: Arc<SchedulerInner>) {
        if inner.shutdown.is_cancelled() {
            return;
        }
        let cancel = inner
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .clone();
        let batch: Vec<Url> = {
            let mut dirty = inner.dirty.lock().expect("dirty lock poisoned");
            dirty.drain().collect()
        };
        if batch.is_empty() {
            return;
        }
        tracing::debug!(count = batch.len(), "validation run starting");

        {
            let _gate = inner.reconcile_gate.lock().await;
            for (index, uri) in batch.iter().enumerate() {
                if cancel.is_cancelled() || inner.shutdown.is_cancelled() {
                    // Put the unprocessed remainder back for the next window.
                    let mut dirty = inner.dirty.lock().expect("dirty lock poisoned");
                    for uri in &batch[index..] {
                        dirty.insert(uri.clone());
                    }
                    tracing::debug!("validation run cancelled during reconcile");
                    return;
                }
                let text = {
                    let store = inner.store.lock().await;
                    store.get(uri).map(|doc| doc.text())
                };
                // Closed while waiting for the timer.
                let Some(text) = text else { continue };
                match inner.engine.reconcile(uri, &text) {
                    Ok(()) => {
                        let mut store = inner.store.lock().await;
                        store.mark_clean(uri);
                    }
                    Err(err) => {
                        tracing::warn!(%uri, error = %err, "reconcile failed");
                    }
                }
            }
        }

        if cancel.is_cancelled() || inner.shutdown.is_cancelled() {
            let mut dirty = inner.dirty.lock().expect("dirty lock poisoned");
            for uri in &batch {
                dirty.insert(uri.clone());
            }
            return;
        }

        // Wait out any running pass rather than racing it.
        let _publish = inner.publish_gate.lock().await;
        match inner
            .publisher
            .publish_all(&inner.store, &batch, &cancel)
            .await
        {
            PublishOutcome::Done => {}
            PublishOutcome::Cancelled => {
                // Unpublished documents need another pass.
                let mut dirty = inner.dirty.lock().expect("dirty lock poisoned");
                for uri in &batch {
                    dirty.insert(uri.clone());
                }
            }
        }
    }
}
