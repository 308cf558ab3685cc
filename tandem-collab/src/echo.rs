//! Echo suppression for programmatic edits.
//!
//! Before the session edits the editor on behalf of a remote operation it
//! records a [`PendingEdit`]. The editor reports that edit back as an ordinary
//! change; the oldest pending edit is compared against the next change and, when
//! it matches, the change is swallowed and the token consumed. Any change that
//! does not match clears every outstanding token, so a missing echo can never
//! keep suppressing real user edits.

use std::collections::VecDeque;

use crate::editor::TextChange;

/// A programmatic edit whose echo is expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingEdit {
    Insert { offset: usize, text: String },
    Delete { offset: usize, length: usize },
    /// Whole-document replacement; the replaced length is whatever the editor held.
    Materialize { text: String },
}

impl PendingEdit {
    pub fn matches(&self, change: &TextChange) -> bool {
        match self {
            PendingEdit::Insert { offset, text } => {
                change.range_offset == *offset && change.range_length == 0 && change.text == *text
            }
            PendingEdit::Delete { offset, length } => {
                change.range_offset == *offset
                    && change.range_length == *length
                    && change.text.is_empty()
            }
            PendingEdit::Materialize { text } => change.range_offset == 0 && change.text == *text,
        }
    }
}

/// Outstanding echo tokens, oldest first.
#[derive(Debug, Default)]
pub struct EchoGuard {
    pending: VecDeque<PendingEdit>,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an edit about to be applied to the editor.
    pub fn expect(&mut self, edit: PendingEdit) {
        self.pending.push_back(edit);
    }

    /// Drop the most recent token; its edit never reached the editor.
    pub fn withdraw(&mut self) {
        self.pending.pop_back();
    }

    /// Returns `true` if `change` is the echo of the oldest pending edit.
    pub fn consume(&mut self, change: &TextChange) -> bool {
        match self.pending.front() {
            Some(edit) if edit.matches(change) => {
                self.pending.pop_front();
                true
            }
            Some(_) => {
                log::debug!(
                    "Change at {} does not match pending echo, clearing {} token(s)",
                    change.range_offset,
                    self.pending.len()
                );
                self.pending.clear();
                false
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
