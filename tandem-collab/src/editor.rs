//! Editor-surface seam.
//!
//! The session never touches an editor directly; it talks to an
//! [`EditorSurface`] and is fed [`TextChange`] events. Offsets and lengths are
//! counted in Unicode scalar values.

use std::collections::HashMap;
use std::fmt;

/// Identity of a shared document, e.g. a path or URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Last path segment, used as the human-facing buffer name.
    pub fn name(&self) -> &str {
        self.0
            .rsplit(|c| c == '/' || c == '\\')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(self.0.as_str())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Handle of an open editor view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(pub u64);

/// A change reported by the editor: `range_length` characters starting at
/// `range_offset` were replaced by `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub range_offset: usize,
    pub range_length: usize,
    pub text: String,
}

impl TextChange {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self::replace(offset, 0, text)
    }

    pub fn delete(offset: usize, length: usize) -> Self {
        Self::replace(offset, length, String::new())
    }

    pub fn replace(offset: usize, length: usize, text: impl Into<String>) -> Self {
        Self {
            range_offset: offset,
            range_length: length,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditorError {
    #[error("no editor view for document {0}")]
    NoView(DocumentId),
    #[error("edit at {offset}+{length} outside document of {len} characters")]
    OutOfRange {
        offset: usize,
        length: usize,
        len: usize,
    },
}

/// Outbound half of the editor seam.
pub trait EditorSurface {
    fn locate_view(&self, document: &DocumentId) -> Option<ViewId>;

    fn apply_insert(&mut self, document: &DocumentId, offset: usize, text: &str)
        -> Result<(), EditorError>;

    fn apply_delete(
        &mut self,
        document: &DocumentId,
        offset: usize,
        length: usize,
    ) -> Result<(), EditorError>;

    /// Replace the whole document content in a single edit.
    fn materialize(&mut self, document: &DocumentId, text: &str) -> Result<(), EditorError>;
}

/// Headless editor holding documents in memory.
///
/// Like a real editor it reports every edit, programmatic or not, as a
/// [`TextChange`]; drain them with [`MemorySurface::drain_changes`] and feed
/// them back to the session.
#[derive(Debug, Default)]
pub struct MemorySurface {
    documents: HashMap<DocumentId, (ViewId, String)>,
    changes: Vec<(DocumentId, TextChange)>,
    next_view: u64,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a view on `document` with `text`.
    pub fn open(&mut self, document: &DocumentId, text: &str) -> ViewId {
        self.next_view += 1;
        let view = ViewId(self.next_view);
        self.documents
            .insert(document.clone(), (view, text.to_string()));
        view
    }

    pub fn close(&mut self, document: &DocumentId) {
        self.documents.remove(document);
    }

    pub fn text(&self, document: &DocumentId) -> Option<&str> {
        self.documents.get(document).map(|(_, text)| text.as_str())
    }

    /// Take every change reported since the last drain.
    pub fn drain_changes(&mut self) -> Vec<(DocumentId, TextChange)> {
        std::mem::take(&mut self.changes)
    }

    /// Apply a user edit and return the change the editor reports for it.
    pub fn edit(&mut self, document: &DocumentId, change: TextChange) -> Result<TextChange, EditorError> {
        self.splice(document, &change)?;
        Ok(change)
    }

    fn splice(&mut self, document: &DocumentId, change: &TextChange) -> Result<(), EditorError> {
        let (_, text) = self
            .documents
            .get_mut(document)
            .ok_or_else(|| EditorError::NoView(document.clone()))?;

        let len = text.chars().count();
        let end = change.range_offset + change.range_length;
        if end > len {
            return Err(EditorError::OutOfRange {
                offset: change.range_offset,
                length: change.range_length,
                len,
            });
        }
        let start = byte_offset(text, change.range_offset);
        let stop = byte_offset(text, end);
        text.replace_range(start..stop, &change.text);
        Ok(())
    }

    fn programmatic(&mut self, document: &DocumentId, change: TextChange) -> Result<(), EditorError> {
        self.splice(document, &change)?;
        self.changes.push((document.clone(), change));
        Ok(())
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map_or(text.len(), |(i, _)| i)
}

impl EditorSurface for MemorySurface {
    fn locate_view(&self, document: &DocumentId) -> Option<ViewId> {
        self.documents.get(document).map(|(view, _)| *view)
    }

    fn apply_insert(&mut self, document: &DocumentId, offset: usize, text: &str) -> Result<(), EditorError> {
        self.programmatic(document, TextChange::insert(offset, text))
    }

    fn apply_delete(&mut self, document: &DocumentId, offset: usize, length: usize) -> Result<(), EditorError> {
        self.programmatic(document, TextChange::delete(offset, length))
    }

    fn materialize(&mut self, document: &DocumentId, text: &str) -> Result<(), EditorError> {
        let len = self
            .text(document)
            .ok_or_else(|| EditorError::NoView(document.clone()))?
            .chars()
            .count();
        self.programmatic(document, TextChange::replace(0, len, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_name() {
        assert_eq!(DocumentId::new("/home/alice/notes.txt").name(), "notes.txt");
        assert_eq!(DocumentId::new("C:\\work\\plan.md").name(), "plan.md");
        assert_eq!(DocumentId::new("scratch").name(), "scratch");
        assert_eq!(DocumentId::new("dir/").name(), "dir/");
    }

    #[test]
    fn test_programmatic_edits_are_reported() {
        let doc = DocumentId::new("a.txt");
        let mut surface = MemorySurface::new();
        surface.open(&doc, "héllo");

        surface.apply_insert(&doc, 5, "!").unwrap();
        surface.apply_delete(&doc, 1, 1).unwrap();
        assert_eq!(surface.text(&doc), Some("hllo!"));

        let changes = surface.drain_changes();
        assert_eq!(
            changes,
            vec![
                (doc.clone(), TextChange::insert(5, "!")),
                (doc.clone(), TextChange::delete(1, 1)),
            ]
        );
        assert!(surface.drain_changes().is_empty());
    }

    #[test]
    fn test_materialize_replaces_everything() {
        let doc = DocumentId::new("a.txt");
        let mut surface = MemorySurface::new();
        surface.open(&doc, "old");
        surface.materialize(&doc, "brand new").unwrap();
        assert_eq!(surface.text(&doc), Some("brand new"));
        assert_eq!(
            surface.drain_changes(),
            vec![(doc, TextChange::replace(0, 3, "brand new"))]
        );
    }

    #[test]
    fn test_user_edit_not_recorded() {
        let doc = DocumentId::new("a.txt");
        let mut surface = MemorySurface::new();
        surface.open(&doc, "ab");
        let change = surface.edit(&doc, TextChange::insert(2, "c")).unwrap();
        assert_eq!(change, TextChange::insert(2, "c"));
        assert_eq!(surface.text(&doc), Some("abc"));
        assert!(surface.drain_changes().is_empty());
    }

    #[test]
    fn test_missing_view() {
        let doc = DocumentId::new("gone.txt");
        let mut surface = MemorySurface::new();
        assert_eq!(surface.locate_view(&doc), None);
        assert_eq!(
            surface.apply_insert(&doc, 0, "x"),
            Err(EditorError::NoView(doc.clone()))
        );
    }

    #[test]
    fn test_out_of_range_edit() {
        let doc = DocumentId::new("a.txt");
        let mut surface = MemorySurface::new();
        surface.open(&doc, "ab");
        assert!(matches!(
            surface.apply_delete(&doc, 1, 5),
            Err(EditorError::OutOfRange { .. })
        ));
    }
}
