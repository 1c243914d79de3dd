//! Document synchronization and incremental validation core for a language
//! server.
//!
//! The crate keeps an authoritative working copy of every open document,
//! applies incremental edits from the client, and schedules background
//! revalidation behind a debounce window so diagnostics stay fresh without
//! running the analyzer on every keystroke. The analyzer itself, the
//! on-disk resource view, and the outbound diagnostics channel are traits
//! ([`engine::AnalysisEngine`], [`engine::ResourceLayer`],
//! [`engine::DiagnosticsSink`]), so the core is independent of any
//! particular language front end.
//!
//! The usual wiring: construct a [`session::Session`] with an engine, a
//! resource layer, and a sink (a `tower_lsp::Client` works directly), then
//! forward the `didOpen`/`didChange`/`didSave`/`didClose` notifications to
//! it.

pub mod buffer;
pub mod classify;
pub mod config;
pub mod engine;
pub mod publish;
pub mod scheduler;
pub mod session;

#[cfg(test)]
pub mod test_utils;
