//! Buffer store and edit applier.
//!
//! Owns the current text and version of every open document. Text lives in
//! [`ropey::Rope`]s so incremental edits and line/char-to-offset conversion
//! stay cheap regardless of document size. All range conversion is done
//! against the buffer being patched, never a previous snapshot, so a burst
//! of size-changing edits cannot corrupt offsets.

use std::collections::HashMap;

use ropey::Rope;
use thiserror::Error;
use tower_lsp::lsp_types::{Position, Range, Url};

#[derive(Debug, Error)]
pub enum EditError {
    #[error("no working copy for {0}")]
    UnknownDocument(Url),
    #[error("line {line} out of bounds (document has {len_lines} lines)")]
    LineOutOfBounds { line: u32, len_lines: usize },
    #[error("character {character} out of bounds on line {line}")]
    CharacterOutOfBounds { line: u32, character: u32 },
    #[error("range start {start:?} is after range end {end:?}")]
    InvertedRange { start: Position, end: Position },
}

/// What an applied change turned out to be, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Insert,
    Delete,
    Replace,
}

/// One open document: its rope, client version, and reconciliation state.
#[derive(Debug, Clone)]
pub struct DocumentBuffer {
    rope: Rope,
    version: i32,
    dirty: bool,
    /// Buffer length recorded after the last change batch. A mismatch at the
    /// start of the next batch means something mutated the buffer behind the
    /// edit applier's back.
    last_synced_len: Option<usize>,
}

impl DocumentBuffer {
    fn new(text: &str, version: i32) -> DocumentBuffer {
        DocumentBuffer {
            rope: Rope::from_str(text),
            version,
            dirty: false,
            last_synced_len: None,
        }
    }

    pub fn rope(&self) -> &Rope {
        &self.rope
    }

    pub fn text(&self) -> String {
        self.rope.to_string()
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Convert an LSP position to a char offset against `rope`.
fn position_to_char(rope: &Rope, pos: Position) -> Result<usize, EditError> {
    let line = pos.line as usize;
    if line >= rope.len_lines() {
        return Err(EditError::LineOutOfBounds {
            line: pos.line,
            len_lines: rope.len_lines(),
        });
    }
    let line_slice = rope.line(line);
    if pos.character as usize > line_slice.len_chars() {
        return Err(EditError::CharacterOutOfBounds {
            line: pos.line,
            character: pos.character,
        });
    }
    Ok(rope.line_to_char(line) + pos.character as usize)
}

/// All open working copies, keyed by URI. Mutation goes through
/// [`BufferStore::apply_change`]; callers hold the store's lock for the
/// duration of a change batch.
#[derive(Default)]
pub struct BufferStore {
    docs: HashMap<Url, DocumentBuffer>,
}

impl BufferStore {
    pub fn new() -> BufferStore {
        BufferStore::default()
    }

    /// Create a working copy if none exists. Returns whether one was created.
    pub fn open(&mut self, uri: &Url, text: &str, version: i32) -> bool {
        if self.docs.contains_key(uri) {
            return false;
        }
        self.docs.insert(uri.clone(), DocumentBuffer::new(text, version));
        true
    }

    /// Discard the working copy and seed a fresh one from `text` (used on
    /// save and on close-with-unsaved-changes, where the on-disk content is
    /// authoritative). Keeps the current version.
    pub fn reacquire(&mut self, uri: &Url, text: &str) {
        if let Some(doc) = self.docs.get_mut(uri) {
            let version = doc.version;
            *doc = DocumentBuffer::new(text, version);
        }
    }

    pub fn close(&mut self, uri: &Url) -> Option<DocumentBuffer> {
        self.docs.remove(uri)
    }

    pub fn get(&self, uri: &Url) -> Option<&DocumentBuffer> {
        self.docs.get(uri)
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.docs.contains_key(uri)
    }

    pub fn mark_clean(&mut self, uri: &Url) {
        if let Some(doc) = self.docs.get_mut(uri) {
            doc.dirty = false;
        }
    }

    /// Buffer length drift since the last change batch, if any. `None` means
    /// no drift (or no previous batch).
    pub fn sync_drift(&self, uri: &Url) -> Option<(usize, usize)> {
        let doc = self.docs.get(uri)?;
        match doc.last_synced_len {
            Some(last) if last != doc.rope.len_chars() => Some((last, doc.rope.len_chars())),
            _ => None,
        }
    }

    /// Record the buffer length at the end of a change batch.
    pub fn record_synced_len(&mut self, uri: &Url) {
        if let Some(doc) = self.docs.get_mut(uri) {
            doc.last_synced_len = Some(doc.rope.len_chars());
        }
    }

    /// Cheap snapshot of every open document: (uri, rope clone, version).
    /// Rope clones share their backing storage, so this is O(open docs).
    pub fn snapshot(&self) -> Vec<(Url, Rope, i32)> {
        self.docs
            .iter()
            .map(|(uri, doc)| (uri.clone(), doc.rope.clone(), doc.version))
            .collect()
    }

    pub fn open_uris(&self) -> Vec<Url> {
        self.docs.keys().cloned().collect()
    }

    /// Apply one incremental change. `range == None` replaces the whole
    /// document. The document is marked dirty and its version bumped to
    /// `version`. A malformed range leaves the buffer at its last good
    /// state and reports the error to the caller.
    pub fn apply_change(
        &mut self,
        uri: &Url,
        range: Option<Range>,
        text: &str,
        version: i32,
    ) -> Result<EditKind, EditError> {
        let doc = self
            .docs
            .get_mut(uri)
            .ok_or_else(|| EditError::UnknownDocument(uri.clone()))?;

        let (start, end) = match range {
            Some(range) => {
                let start = position_to_char(&doc.rope, range.start)?;
                let end = position_to_char(&doc.rope, range.end)?;
                if start > end {
                    return Err(EditError::InvertedRange {
                        start: range.start,
                        end: range.end,
                    });
                }
                (start, end)
            }
            // Range is optional; without one the whole content is replaced.
            None => (0, doc.rope.len_chars()),
        };

        let kind = if start == end {
            doc.rope.insert(start, text);
            EditKind::Insert
        } else if text.is_empty() {
            doc.rope.remove(start..end);
            EditKind::Delete
        } else {
            doc.rope.remove(start..end);
            doc.rope.insert(start, text);
            EditKind::Replace
        };

        doc.version = version;
        doc.dirty = true;
        Ok(kind)
    }
}
