//! Lifecycle controller.
//!
//! Entry points for the document notifications: open, change, save, close.
//! Each one mutates the buffer store and hands scheduling to the validation
//! scheduler; none of them run analysis inline. Also tracks the last client
//! version per document so long-running requests can detect that the
//! document changed under them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use ropey::Rope;
use tokio::sync::Mutex;
use tower_lsp::lsp_types::{TextDocumentContentChangeEvent, Url};

use crate::buffer::BufferStore;
use crate::config::Settings;
use crate::engine::{AnalysisEngine, DiagnosticsSink, ResourceLayer};
use crate::publish::DiagnosticsPublisher;
use crate::scheduler::ValidationScheduler;

/// JSON-RPC error code for a request invalidated by a newer document
/// version.
pub const CONTENT_MODIFIED: i64 = -32801;

pub struct Session {
    settings: Settings,
    engine: Arc<dyn AnalysisEngine>,
    resources: Arc<dyn ResourceLayer>,
    publisher: Arc<DiagnosticsPublisher>,
    store: Arc<Mutex<BufferStore>>,
    scheduler: ValidationScheduler,
    /// Last version the client announced per document, for change guards.
    versions: Arc<StdMutex<HashMap<Url, i32>>>,
}

impl Session {
    pub fn new(
        settings: Settings,
        engine: Arc<dyn AnalysisEngine>,
        resources: Arc<dyn ResourceLayer>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Session {
        let store = Arc::new(Mutex::new(BufferStore::new()));
        let publisher = Arc::new(DiagnosticsPublisher::new(
            engine.clone(),
            resources.clone(),
            sink,
            settings.clone(),
        ));
        let scheduler = ValidationScheduler::new(
            store.clone(),
            engine.clone(),
            publisher.clone(),
            Duration::from_millis(settings.debounce_ms),
        );
        Session {
            settings,
            engine,
            resources,
            publisher,
            store,
            scheduler,
            versions: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// A document was opened in the editor. The working copy is seeded from
    /// disk when possible; if the client's text differs (unsaved restore,
    /// external edit), the client text wins and the copy starts out dirty.
    /// Derived documents never become working copies.
    pub async fn did_open(&self, uri: Url, version: i32, text: String) {
        if self.resources.is_derived(&uri) {
            tracing::debug!(%uri, "ignoring open of derived document");
            return;
        }
        if !self.resources.exists(&uri) {
            // The editor can open a file created a moment ago, before the
            // resource layer noticed it.
            self.resources.refresh(&uri);
        }
        self.versions
            .lock()
            .expect("version lock poisoned")
            .insert(uri.clone(), version);

        let disk = self.resources.read(&uri).ok();
        {
            let mut store = self.store.lock().await;
            match disk {
                Some(disk) => {
                    store.open(&uri, &disk, version);
                    let differs = store.get(&uri).map(|doc| doc.text() != text).unwrap_or(false);
                    if differs {
                        if let Err(err) = store.apply_change(&uri, None, &text, version) {
                            tracing::error!(%uri, error = %err, "failed to seed working copy");
                        }
                    }
                }
                // Nothing on disk; the client text is all there is.
                None => {
                    store.open(&uri, &text, version);
                }
            }
            store.record_synced_len(&uri);
        }
        tracing::debug!(%uri, version, "document opened");
        self.scheduler.mark_dirty(&uri);
    }

    /// A batch of edits arrived. Edits are applied in order against the live
    /// buffer; a malformed edit drops the rest of its batch and keeps the
    /// last good buffer state. An empty batch is ignored entirely.
    pub async fn did_change(&self, uri: Url, version: i32, changes: Vec<TextDocumentContentChangeEvent>) {
        if changes.is_empty() {
            return;
        }
        {
            let mut store = self.store.lock().await;
            if !store.contains(&uri) {
                tracing::warn!(%uri, "change for a document with no working copy");
                return;
            }
            self.versions
                .lock()
                .expect("version lock poisoned")
                .insert(uri.clone(), version);
            if let Some((expected, actual)) = store.sync_drift(&uri) {
                tracing::error!(
                    %uri,
                    expected,
                    actual,
                    "working copy drifted since last batch"
                );
            }
            for change in changes {
                match store.apply_change(&uri, change.range, &change.text, version) {
                    Ok(kind) => tracing::trace!(%uri, ?kind, "applied edit"),
                    Err(err) => {
                        tracing::error!(%uri, error = %err, "edit failed, dropping rest of batch");
                        break;
                    }
                }
            }
            store.record_synced_len(&uri);
        }
        self.scheduler.mark_dirty(&uri);
    }

    /// The document was saved. Any in-flight validation is waited out, then
    /// the working copy is re-seeded from the saved on-disk content and a
    /// fresh validation window opens.
    pub async fn did_save(&self, uri: Url) {
        if !self.store.lock().await.contains(&uri) {
            return;
        }
        // Never reacquire a buffer a validation run is still reading.
        self.scheduler.join().await;
        match self.resources.read(&uri) {
            Ok(disk) => {
                let mut store = self.store.lock().await;
                store.reacquire(&uri, &disk);
                store.record_synced_len(&uri);
            }
            Err(err) => {
                tracing::warn!(%uri, error = %err, "save arrived but resource unreadable");
            }
        }
        tracing::debug!(%uri, "document saved");
        self.scheduler.mark_dirty(&uri);
    }

    /// The document was closed. Un-reconciled edits get one final publish
    /// computed from the on-disk content; otherwise the document's
    /// diagnostics are cleared, since analysis for it ends here. The working
    /// copy and all per-document state are dropped.
    pub async fn did_close(&self, uri: Url) {
        if !self.store.lock().await.contains(&uri) {
            return;
        }
        self.versions
            .lock()
            .expect("version lock poisoned")
            .remove(&uri);
        // A pass that snapshotted the pre-close buffer must not land after
        // the final publish below; cancel it and wait it out.
        self.scheduler.quiesce().await;
        self.scheduler.remove_dirty(&uri);
        self.scheduler.release_focus(&uri);

        // Discard the working copy before publishing so a pass starting
        // concurrently can no longer pick this document up.
        let (had_unsaved, version) = {
            let mut store = self.store.lock().await;
            let doc = store.close(&uri);
            (
                doc.as_ref().map(|doc| doc.is_dirty()).unwrap_or(false),
                doc.map(|doc| doc.version()),
            )
        };
        let exists = self.resources.exists(&uri);

        if self.settings.syntax_only || !exists || !had_unsaved {
            // Closing is the end of analysis for this document; whatever was
            // on screen no longer applies.
            self.scheduler.clear_now(&uri).await;
        } else {
            // Unsaved edits are being thrown away; re-publish from the
            // on-disk content so stale diagnostics don't linger.
            match self.resources.read(&uri) {
                Ok(disk) => {
                    self.scheduler
                        .publish_now(&uri, &Rope::from_str(&disk), version)
                        .await;
                }
                Err(err) => {
                    tracing::warn!(%uri, error = %err, "close reload failed, clearing instead");
                    self.scheduler.clear_now(&uri).await;
                }
            }
        }

        self.publisher.forget(&uri).await;
        tracing::debug!(%uri, "document closed");
    }

    /// Snapshot a document's version for a long-running request. The monitor
    /// answers whether the document changed since.
    pub fn monitor(&self, uri: &Url) -> DocumentMonitor {
        let initial = self
            .versions
            .lock()
            .expect("version lock poisoned")
            .get(uri)
            .copied();
        DocumentMonitor {
            uri: uri.clone(),
            initial,
            versions: Arc::clone(&self.versions),
        }
    }

    pub async fn is_open(&self, uri: &Url) -> bool {
        self.store.lock().await.contains(uri)
    }

    pub async fn text(&self, uri: &Url) -> Option<String> {
        self.store.lock().await.get(uri).map(|doc| doc.text())
    }

    pub fn version(&self, uri: &Url) -> Option<i32> {
        self.versions
            .lock()
            .expect("version lock poisoned")
            .get(uri)
            .copied()
    }

    pub fn engine(&self) -> &Arc<dyn AnalysisEngine> {
        &self.engine
    }

    /// Stop scheduling and cancel in-flight work. Called on server shutdown.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.scheduler.join().await;
    }
}

/// Version guard for a request that must not outlive the document state it
/// started from.
pub struct DocumentMonitor {
    uri: Url,
    initial: Option<i32>,
    versions: Arc<StdMutex<HashMap<Url, i32>>>,
}

impl DocumentMonitor {
    /// Whether the document has changed (or closed) since the monitor was
    /// taken.
    pub fn has_changed(&self) -> bool {
        let current = self
            .versions
            .lock()
            .expect("version lock poisoned")
            .get(&self.uri)
            .copied();
        current != self.initial
    }

    /// Fails with ContentModified when the document changed under the
    /// request.
    pub fn check_changed(&self) -> tower_lsp::jsonrpc::Result<()> {
        if self.has_changed() {
            let mut err = tower_lsp::jsonrpc::Error::new(
                tower_lsp::jsonrpc::ErrorCode::ServerError(CONTENT_MODIFIED),
            );
            err.message = "Document changed, request is no longer valid".into();
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_uri, FakeEngine, FakeResources, FakeSink};
    use tower_lsp::lsp_types::{Position, Range};

    struct Fixture {
        engine: Arc<FakeEngine>,
        resources: Arc<FakeResources>,
        sink: Arc<FakeSink>,
        session: Session,
    }

    fn fixture(settings: Settings) -> Fixture {
        let engine = Arc::new(FakeEngine::new());
        let resources = Arc::new(FakeResources::new());
        let sink = Arc::new(FakeSink::new());
        let session = Session::new(
            settings,
            engine.clone(),
            resources.clone(),
            sink.clone(),
        );
        Fixture {
            engine,
            resources,
            sink,
            session,
        }
    }

    fn change(range: Option<Range>, text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range,
            range_length: None,
            text: text.to_string(),
        }
    }

    /// Test: opening with text matching disk keeps the copy clean.
    #[tokio::test(start_paused = true)]
    async fn test_open_matching_disk() {
        let fx = fixture(Settings::default());
        let uri = test_uri("a.unit");
        fx.resources.write(&uri, "on disk\n");

        fx.session.did_open(uri.clone(), 1, "on disk\n".into()).await;

        assert!(fx.session.is_open(&uri).await);
        assert_eq!(fx.session.text(&uri).await.as_deref(), Some("on disk\n"));
        assert_eq!(fx.session.version(&uri), Some(1));
    }

    /// Test: client text differing from disk wins.
    #[tokio::test(start_paused = true)]
    async fn test_open_client_text_wins() {
        let fx = fixture(Settings::default());
        let uri = test_uri("a.unit");
        fx.resources.write(&uri, "stale disk\n");

        fx.session
            .did_open(uri.clone(), 1, "client copy\n".into())
            .await;

        assert_eq!(fx.session.text(&uri).await.as_deref(), Some("client copy\n"));
    }

    /// Test: a document missing from disk triggers one refresh attempt and
    /// still opens from the client text.
    #[tokio::test(start_paused = true)]
    async fn test_open_missing_resource() {
        let fx = fixture(Settings::default());
        let uri = test_uri("fresh.unit");

        fx.session.did_open(uri.clone(), 1, "brand new\n".into()).await;

        assert_eq!(*fx.resources.refreshed.lock().unwrap(), vec![uri.clone()]);
        assert_eq!(fx.session.text(&uri).await.as_deref(), Some("brand new\n"));
    }

    /// Test: derived documents never become working copies.
    #[tokio::test(start_paused = true)]
    async fn test_open_derived_ignored() {
        let fx = fixture(Settings::default());
        let uri = test_uri("generated.unit");
        fx.resources.write(&uri, "generated\n");
        fx.resources.mark_derived(&uri);

        fx.session.did_open(uri.clone(), 1, "generated\n".into()).await;

        assert!(!fx.session.is_open(&uri).await);
    }

    /// Test: edits apply in order and the version advances.
    #[tokio::test(start_paused = true)]
    async fn test_change_applies_edits() {
        let fx = fixture(Settings::default());
        let uri = test_uri("a.unit");
        fx.resources.write(&uri, "ab\n");
        fx.session.did_open(uri.clone(), 1, "ab\n".into()).await;

        let pos = |line, character| Position { line, character };
        fx.session
            .did_change(
                uri.clone(),
                2,
                vec![
                    change(Some(Range { start: pos(0, 1), end: pos(0, 1) }), "X"),
                    change(Some(Range { start: pos(0, 2), end: pos(0, 2) }), "Y"),
                ],
            )
            .await;

        assert_eq!(fx.session.text(&uri).await.as_deref(), Some("aXYb\n"));
        assert_eq!(fx.session.version(&uri), Some(2));
    }

    /// Test: an empty change batch is ignored and does not bump the version.
    #[tokio::test(start_paused = true)]
    async fn test_empty_change_batch_ignored() {
        let fx = fixture(Settings::default());
        let uri = test_uri("a.unit");
        fx.resources.write(&uri, "ab\n");
        fx.session.did_open(uri.clone(), 1, "ab\n".into()).await;

        fx.session.did_change(uri.clone(), 9, vec![]).await;

        assert_eq!(fx.session.version(&uri), Some(1));
    }

    /// Test: a malformed edit drops the rest of its batch, keeping the last
    /// good state.
    #[tokio::test(start_paused = true)]
    async fn test_bad_edit_drops_batch_remainder() {
        let fx = fixture(Settings::default());
        let uri = test_uri("a.unit");
        fx.resources.write(&uri, "ab\n");
        fx.session.did_open(uri.clone(), 1, "ab\n".into()).await;

        let pos = |line, character| Position { line, character };
        fx.session
            .did_change(
                uri.clone(),
                2,
                vec![
                    change(Some(Range { start: pos(0, 1), end: pos(0, 1) }), "X"),
                    change(Some(Range { start: pos(40, 0), end: pos(40, 1) }), "nope"),
                    change(Some(Range { start: pos(0, 0), end: pos(0, 0) }), "unreached"),
                ],
            )
            .await;

        assert_eq!(fx.session.text(&uri).await.as_deref(), Some("aXb\n"));
    }

    /// Test: changes for unopened documents are ignored.
    #[tokio::test(start_paused = true)]
    async fn test_change_without_open_ignored() {
        let fx = fixture(Settings::default());
        let uri = test_uri("a.unit");

        fx.session
            .did_change(uri.clone(), 1, vec![change(None, "text")])
            .await;

        assert!(!fx.session.is_open(&uri).await);
        assert_eq!(fx.session.version(&uri), None);
    }

    /// Test: save re-seeds the working copy from disk.
    #[tokio::test(start_paused = true)]
    async fn test_save_reacquires_from_disk() {
        let fx = fixture(Settings::default());
        let uri = test_uri("a.unit");
        fx.resources.write(&uri, "v1\n");
        fx.session.did_open(uri.clone(), 1, "v1\n".into()).await;
        fx.session
            .did_change(uri.clone(), 2, vec![change(None, "v2 unsaved\n")])
            .await;

        // The editor wrote the buffer to disk, then notified.
        fx.resources.write(&uri, "v2 saved\n");
        fx.session.did_save(uri.clone()).await;

        assert_eq!(fx.session.text(&uri).await.as_deref(), Some("v2 saved\n"));
    }

    /// Test: closing a clean document clears its diagnostics and drops all
    /// state.
    #[tokio::test(start_paused = true)]
    async fn test_close_clean_document() {
        let fx = fixture(Settings::default());
        let uri = test_uri("a.unit");
        fx.resources.write(&uri, "clean\n");
        fx.session.did_open(uri.clone(), 1, "clean\n".into()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let publishes_before = fx.sink.published.lock().unwrap().len();

        fx.session.did_close(uri.clone()).await;

        assert!(!fx.session.is_open(&uri).await);
        assert_eq!(fx.session.version(&uri), None);
        let published = fx.sink.published.lock().unwrap();
        assert_eq!(published.len(), publishes_before + 1);
        assert!(published.last().unwrap().1.is_empty());
    }

    /// Test: closing a document that was never opened does nothing.
    #[tokio::test(start_paused = true)]
    async fn test_close_unopened_is_noop() {
        let fx = fixture(Settings::default());
        let uri = test_uri("never-opened.unit");

        fx.session.did_close(uri.clone()).await;

        assert!(fx.sink.published.lock().unwrap().is_empty());
    }

    /// Test: closing with unsaved edits re-publishes from the on-disk
    /// content.
    #[tokio::test(start_paused = true)]
    async fn test_close_discards_unsaved_edits() {
        let fx = fixture(Settings::default());
        let uri = test_uri("a.unit");
        fx.resources.write(&uri, "clean on disk\n");
        fx.session.did_open(uri.clone(), 1, "clean on disk\n".into()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Introduce an error in the buffer only, then close without saving.
        fx.session
            .did_change(uri.clone(), 2, vec![change(None, "SYNTAX_ERR\n")])
            .await;
        fx.session.did_close(uri.clone()).await;

        let published = fx.sink.published.lock().unwrap();
        let last = published.last().unwrap();
        assert_eq!(last.0, uri);
        // Computed from disk content, which is clean.
        assert!(last.1.is_empty());
    }

    /// Test: closing a document whose file is gone clears diagnostics.
    #[tokio::test(start_paused = true)]
    async fn test_close_deleted_file_clears() {
        let fx = fixture(Settings::default());
        let uri = test_uri("a.unit");
        fx.resources.write(&uri, "SYNTAX_ERR\n");
        fx.session.did_open(uri.clone(), 1, "SYNTAX_ERR\n".into()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        fx.resources.delete(&uri);
        fx.session.did_close(uri.clone()).await;

        let published = fx.sink.published.lock().unwrap();
        let last = published.last().unwrap();
        assert_eq!(last.0, uri);
        assert!(last.1.is_empty());
    }

    /// Test: in syntax-only mode, close always clears.
    #[tokio::test(start_paused = true)]
    async fn test_close_syntax_only_clears() {
        let settings = Settings {
            syntax_only: true,
            ..Settings::default()
        };
        let fx = fixture(settings);
        let uri = test_uri("a.unit");
        fx.resources.write(&uri, "clean\n");
        fx.session.did_open(uri.clone(), 1, "clean\n".into()).await;

        fx.session.did_close(uri.clone()).await;

        let published = fx.sink.published.lock().unwrap();
        let last = published.last().unwrap();
        assert!(last.1.is_empty());
    }

    /// Test: close releases edit focus and invalidates the cached parse.
    #[tokio::test(start_paused = true)]
    async fn test_close_releases_focus() {
        let fx = fixture(Settings::default());
        let uri = test_uri("a.unit");
        fx.resources.write(&uri, "clean\n");
        fx.session.did_open(uri.clone(), 1, "clean\n".into()).await;

        fx.session.did_close(uri.clone()).await;

        assert!(fx
            .engine
            .invalidated
            .lock()
            .unwrap()
            .contains(&uri));
    }

    /// Test: the monitor notices version changes and closure.
    #[tokio::test(start_paused = true)]
    async fn test_monitor_detects_change() {
        let fx = fixture(Settings::default());
        let uri = test_uri("a.unit");
        fx.resources.write(&uri, "ab\n");
        fx.session.did_open(uri.clone(), 1, "ab\n".into()).await;

        let monitor = fx.session.monitor(&uri);
        assert!(!monitor.has_changed());
        assert!(monitor.check_changed().is_ok());

        fx.session
            .did_change(uri.clone(), 2, vec![change(None, "cd\n")])
            .await;
        assert!(monitor.has_changed());
        let err = monitor.check_changed().unwrap_err();
        assert_eq!(
            err.code,
            tower_lsp::jsonrpc::ErrorCode::ServerError(CONTENT_MODIFIED)
        );

        let monitor = fx.session.monitor(&uri);
        fx.session.did_close(uri.clone()).await;
        assert!(monitor.has_changed());
    }
}
