//! Shared test utilities for vigil.
//!
//! This module provides the fakes used across multiple test modules: a
//! marker-driven analysis engine, a recording diagnostics sink, and an
//! in-memory resource layer. It is only compiled when running tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tower_lsp::lsp_types::{Diagnostic, Url};

use crate::engine::{
    AnalysisEngine, DiagnosticsSink, Problem, ProblemKind, ProblemSeverity, ResourceLayer,
};

/// Derive problems from marker substrings in the text, so tests can script
/// analyzer output by editing document content:
///
/// - `SYNTAX_ERR`  -> ParseError (Error, syntax category)
/// - `UNRESOLVED`  -> UnresolvedVariable (Error, suppressed in full mode)
/// - `DEPRECATED`  -> UsingDeprecatedMethod (Warning, Deprecated tag)
/// - `TASK`        -> Task (Warning, demoted to Information)
///
/// Offsets are char offsets; marker texts are ASCII so byte positions from
/// `match_indices` are also char positions.
pub fn scan_problems(text: &str) -> Vec<Problem> {
    let markers: [(&str, ProblemKind, ProblemSeverity); 4] = [
        ("SYNTAX_ERR", ProblemKind::ParseError, ProblemSeverity::Error),
        (
            "UNRESOLVED",
            ProblemKind::UnresolvedVariable,
            ProblemSeverity::Error,
        ),
        (
            "DEPRECATED",
            ProblemKind::UsingDeprecatedMethod,
            ProblemSeverity::Warning,
        ),
        ("TASK", ProblemKind::Task, ProblemSeverity::Warning),
    ];

    let mut problems = Vec::new();
    for (marker, kind, severity) in markers {
        for (offset, _) in text.match_indices(marker) {
            let prefix = &text[..offset];
            let line = prefix.lines().count().max(1) as u32;
            let column = (offset - prefix.rfind('\n').map(|i| i + 1).unwrap_or(0) + 1) as u32;
            let mut problem = Problem::new(kind, severity, offset, offset + marker.len());
            problem.line = line;
            problem.column = column;
            problem.message = format!("{marker} at offset {offset}");
            problems.push(problem);
        }
    }
    problems
}

/// Analysis engine fake: analyzes via [`scan_problems`], records call and
/// concurrency counts, and can be scripted to fail for specific documents.
#[derive(Default)]
pub struct FakeEngine {
    pub failing: Mutex<HashSet<Url>>,
    pub invalidated: Mutex<Vec<Url>>,
    pub reconciled: Mutex<Vec<Url>>,
    pub analyze_count: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> FakeEngine {
        FakeEngine::default()
    }

    pub fn fail_for(&self, uri: &Url) {
        self.failing.lock().unwrap().insert(uri.clone());
    }
}

impl AnalysisEngine for FakeEngine {
    fn reconcile(&self, uri: &Url, _text: &str) -> anyhow::Result<()> {
        self.reconciled.lock().unwrap().push(uri.clone());
        Ok(())
    }

    fn analyze(&self, uri: &Url, text: &str) -> anyhow::Result<Vec<Problem>> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.analyze_count.fetch_add(1, Ordering::SeqCst);
        let result = if self.failing.lock().unwrap().contains(uri) {
            Err(anyhow::anyhow!("engine exploded on {uri}"))
        } else {
            Ok(scan_problems(text))
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn invalidate(&self, uri: &Url) {
        self.invalidated.lock().unwrap().push(uri.clone());
    }
}

/// Diagnostics sink fake: records every publish in order.
#[derive(Default)]
pub struct FakeSink {
    pub published: Mutex<Vec<(Url, Vec<Diagnostic>, Option<i32>)>>,
}

impl FakeSink {
    pub fn new() -> FakeSink {
        FakeSink::default()
    }

    pub fn published_for(&self, uri: &Url) -> Vec<Vec<Diagnostic>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _, _)| u == uri)
            .map(|(_, d, _)| d.clone())
            .collect()
    }
}

#[tower_lsp::async_trait]
impl DiagnosticsSink for FakeSink {
    async fn publish_diagnostics(
        &self,
        uri: Url,
        diagnostics: Vec<Diagnostic>,
        version: Option<i32>,
    ) {
        // Yield so overlapping publishes would interleave if they existed.
        tokio::task::yield_now().await;
        self.published.lock().unwrap().push((uri, diagnostics, version));
    }
}

/// In-memory resource layer fake: scripted disk contents and markers.
#[derive(Default)]
pub struct FakeResources {
    pub disk: Mutex<HashMap<Url, String>>,
    pub derived: Mutex<HashSet<Url>>,
    pub markers: Mutex<HashMap<Url, Vec<Diagnostic>>>,
    pub refreshed: Mutex<Vec<Url>>,
}

impl FakeResources {
    pub fn new() -> FakeResources {
        FakeResources::default()
    }

    pub fn write(&self, uri: &Url, text: &str) {
        self.disk.lock().unwrap().insert(uri.clone(), text.to_string());
    }

    pub fn delete(&self, uri: &Url) {
        self.disk.lock().unwrap().remove(uri);
    }

    pub fn mark_derived(&self, uri: &Url) {
        self.derived.lock().unwrap().insert(uri.clone());
    }

    pub fn set_markers(&self, uri: &Url, markers: Vec<Diagnostic>) {
        self.markers.lock().unwrap().insert(uri.clone(), markers);
    }
}

impl ResourceLayer for FakeResources {
    fn exists(&self, uri: &Url) -> bool {
        self.disk.lock().unwrap().contains_key(uri)
    }

    fn refresh(&self, uri: &Url) {
        self.refreshed.lock().unwrap().push(uri.clone());
    }

    fn read(&self, uri: &Url) -> anyhow::Result<String> {
        self.disk
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("resource missing: {uri}"))
    }

    fn is_derived(&self, uri: &Url) -> bool {
        self.derived.lock().unwrap().contains(uri)
    }

    fn markers(&self, uri: &Url) -> Vec<Diagnostic> {
        self.markers.lock().unwrap().get(uri).cloned().unwrap_or_default()
    }
}

pub fn test_uri(name: &str) -> Url {
    Url::parse(&format!("file:///workspace/{name}")).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: marker scanning produces offsets and 1-based line/column.
    #[test]
    fn test_scan_problems_positions() {
        let text = "clean line\nhas SYNTAX_ERR here\n";
        let problems = scan_problems(text);
        assert_eq!(problems.len(), 1);
        let p = &problems[0];
        assert_eq!(p.kind, ProblemKind::ParseError);
        assert_eq!(p.start, 15);
        assert_eq!(p.end, 25);
        assert_eq!(p.line, 2);
        assert_eq!(p.column, 5);
    }

    /// Test: clean text yields no problems.
    #[test]
    fn test_scan_problems_clean() {
        assert!(scan_problems("nothing to see\n").is_empty());
    }
}
