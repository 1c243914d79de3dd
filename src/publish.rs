//! Diagnostics publisher.
//!
//! One publish pass walks the documents that need fresh diagnostics, runs a
//! full analysis on each live buffer, classifies the problems, merges in any
//! resource-level markers, and pushes the result to the client. A failure on
//! one document never blocks the rest of the pass. Sends are suppressed when
//! the diagnostic set for a document has not changed since the last send,
//! except for clears, which always go out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;
use ropey::Rope;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{Diagnostic, Url};

use crate::buffer::BufferStore;
use crate::classify;
use crate::config::Settings;
use crate::engine::{AnalysisEngine, DiagnosticsSink, ResourceLayer};

/// How a publish pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Done,
    /// The pass was cancelled mid-way; documents not yet published need
    /// another pass.
    Cancelled,
}

/// Identity of a diagnostic for marker deduplication. Engine problems and
/// resource markers describing the same issue collapse to one entry.
type DiagnosticKey = (u32, u32, u32, u32, String, Option<String>, String);

fn identity_key(diag: &Diagnostic) -> DiagnosticKey {
    (
        diag.range.start.line,
        diag.range.start.character,
        diag.range.end.line,
        diag.range.end.character,
        diag.message.clone(),
        diag.source.clone(),
        diag.code
            .as_ref()
            .map(|code| match code {
                tower_lsp::lsp_types::NumberOrString::Number(n) => n.to_string(),
                tower_lsp::lsp_types::NumberOrString::String(s) => s.clone(),
            })
            .unwrap_or_default(),
    )
}

pub struct DiagnosticsPublisher {
    engine: Arc<dyn AnalysisEngine>,
    resources: Arc<dyn ResourceLayer>,
    sink: Arc<dyn DiagnosticsSink>,
    settings: Settings,
    /// Last set sent per document, for unchanged-send suppression.
    last_published: Mutex<HashMap<Url, Vec<Diagnostic>>>,
}

impl DiagnosticsPublisher {
    pub fn new(
        engine: Arc<dyn AnalysisEngine>,
        resources: Arc<dyn ResourceLayer>,
        sink: Arc<dyn DiagnosticsSink>,
        settings: Settings,
    ) -> DiagnosticsPublisher {
        DiagnosticsPublisher {
            engine,
            resources,
            sink,
            settings,
            last_published: Mutex::new(HashMap::new()),
        }
    }

    /// One full pass. `batch` lists the documents that triggered the pass;
    /// when `validate_all_open_buffers` is set, every other open document is
    /// appended after them, so the triggering documents get fresh diagnostics
    /// first. Cancellation is checked between documents.
    pub async fn publish_all(
        &self,
        store: &Mutex<BufferStore>,
        batch: &[Url],
        cancel: &CancellationToken,
    ) -> PublishOutcome {
        let targets: Vec<(Url, Rope, i32)> = {
            let store = store.lock().await;
            let mut uris: Vec<Url> = batch
                .iter()
                .filter(|uri| store.contains(uri))
                .cloned()
                .collect();
            if self.settings.validate_all_open_buffers {
                let requested: HashSet<&Url> = uris.iter().collect();
                let rest = store
                    .open_uris()
                    .into_iter()
                    .filter(|uri| !requested.contains(uri))
                    .sorted_by(|a, b| a.as_str().cmp(b.as_str()))
                    .collect_vec();
                uris.extend(rest);
            }
            uris.into_iter()
                .filter_map(|uri| {
                    store
                        .get(&uri)
                        .map(|doc| (uri.clone(), doc.rope().clone(), doc.version()))
                })
                .collect()
        };

        for (uri, rope, version) in targets {
            if cancel.is_cancelled() {
                tracing::debug!("publish pass cancelled");
                return PublishOutcome::Cancelled;
            }
            if self.publish_unit(&uri, &rope, Some(version), cancel).await
                == PublishOutcome::Cancelled
            {
                return PublishOutcome::Cancelled;
            }
        }
        PublishOutcome::Done
    }

    /// Analyze and publish a single document from the given buffer state,
    /// outside any pass.
    pub async fn publish_one(&self, uri: &Url, rope: &Rope, version: Option<i32>) {
        let _ = self
            .publish_unit(uri, rope, version, &CancellationToken::new())
            .await;
    }

    /// Analysis failure publishes nothing and keeps the previous diagnostics
    /// on the client. Cancellation is honored between analysis and
    /// classification, before anything is sent.
    async fn publish_unit(
        &self,
        uri: &Url,
        rope: &Rope,
        version: Option<i32>,
        cancel: &CancellationToken,
    ) -> PublishOutcome {
        let text = rope.to_string();
        let problems = match self.engine.analyze(uri, &text) {
            Ok(problems) => problems,
            Err(err) => {
                tracing::warn!(%uri, error = %err, "analysis failed, keeping previous diagnostics");
                return PublishOutcome::Done;
            }
        };
        if cancel.is_cancelled() {
            return PublishOutcome::Cancelled;
        }
        let mut diagnostics = classify::to_diagnostics(
            Some(rope),
            &problems,
            self.settings.syntax_only,
            self.settings.diagnostic_tags,
        );
        self.merge_markers(uri, &mut diagnostics);
        self.send(uri, diagnostics, version).await;
        PublishOutcome::Done
    }

    /// Append resource-level markers not already covered by an engine
    /// diagnostic with the same identity.
    fn merge_markers(&self, uri: &Url, diagnostics: &mut Vec<Diagnostic>) {
        let mut seen: HashSet<DiagnosticKey> = diagnostics.iter().map(identity_key).collect();
        for marker in self.resources.markers(uri) {
            if seen.insert(identity_key(&marker)) {
                diagnostics.push(marker);
            }
        }
    }

    async fn send(&self, uri: &Url, diagnostics: Vec<Diagnostic>, version: Option<i32>) {
        {
            let mut last = self.last_published.lock().await;
            if last.get(uri) == Some(&diagnostics) {
                tracing::trace!(%uri, "diagnostics unchanged, skipping send");
                return;
            }
            last.insert(uri.clone(), diagnostics.clone());
        }
        tracing::debug!(%uri, count = diagnostics.len(), "publishing diagnostics");
        self.sink.publish_diagnostics(uri.clone(), diagnostics, version).await;
    }

    /// Publish an empty set unconditionally. Used on close; the suppression
    /// cache is bypassed so a client that re-opened the document elsewhere
    /// still converges on empty.
    pub async fn clear(&self, uri: &Url) {
        self.last_published
            .lock()
            .await
            .insert(uri.clone(), Vec::new());
        tracing::debug!(%uri, "clearing diagnostics");
        self.sink.publish_diagnostics(uri.clone(), Vec::new(), None).await;
    }

    /// Drop the suppression cache entry for a closed document.
    pub async fn forget(&self, uri: &Url) {
        self.last_published.lock().await.remove(uri);
    }
}
