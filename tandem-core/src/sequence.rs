//! Sequence CRDT: position identifiers mapped to characters.
//!
//! The sequence keeps every live identifier in one ascending index, with the two
//! sentinels always at its head. Text offsets handed in and out of this type never
//! include the sentinels; the translation is kept here and nowhere else.
//!
//! Deleted identifiers are remembered so that [`Sequence::generate_at`] never
//! hands one out again; a reused identifier could be removed by a concurrent
//! delete of the character that first carried it.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pid::{Pid, SiteId};

/// Separator used to split a snapshot's text into lines.
pub const LINE_SEPARATOR: &str = "\n";

/// Number of sentinel entries at the head of the index.
const SENTINELS: usize = 2;

/// Errors loading a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("snapshot does not start with the document sentinels")]
    MissingSentinels,
    #[error("snapshot carries {pids} identifiers for {chars} characters")]
    Misaligned { pids: usize, chars: usize },
    #[error("snapshot identifiers out of order at position {position}")]
    Unordered { position: usize },
}

/// A host's document state, sent to a joining replica.
///
/// `pids` includes the two leading sentinels and is aligned with the characters of
/// `lines` joined by [`LINE_SEPARATOR`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub pids: Vec<Pid>,
    pub lines: Vec<String>,
}

impl Snapshot {
    /// The snapshot's document text.
    pub fn text(&self) -> String {
        self.lines.join(LINE_SEPARATOR)
    }
}

/// Ordered store of identifier → character.
#[derive(Debug, Clone)]
pub struct Sequence {
    chars: HashMap<Pid, char>,
    /// Every live identifier, ascending, sentinels first.
    index: Vec<Pid>,
    /// Identifiers deleted from this replica.
    retired: HashSet<Pid>,
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence {
    /// An empty document holding only the sentinels.
    pub fn new() -> Self {
        Self {
            chars: HashMap::new(),
            index: vec![Pid::document_start(), Pid::line_start()],
            retired: HashSet::new(),
        }
    }

    /// Build a document from existing text, generating identifiers for `site`.
    pub fn from_text(site: SiteId, text: &str) -> Self {
        let mut sequence = Self::new();
        for ch in text.chars() {
            let pid = sequence.generate_at(site, sequence.len());
            sequence.index.push(pid.clone());
            sequence.chars.insert(pid, ch);
        }
        sequence
    }

    /// Number of characters in the document.
    pub fn len(&self) -> usize {
        self.index.len() - SENTINELS
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `ch` at `pid`.
    ///
    /// Returns the text offset the character now occupies, or `None` when the
    /// identifier is already present (duplicate delivery) or would land on or
    /// before the line-start sentinel.
    pub fn insert(&mut self, pid: Pid, ch: char) -> Option<usize> {
        if pid <= self.index[SENTINELS - 1] {
            log::warn!("Ignoring insert at reserved position {pid}");
            return None;
        }
        match self.index.binary_search(&pid) {
            Ok(_) => None,
            Err(position) => {
                self.index.insert(position, pid.clone());
                self.chars.insert(pid, ch);
                Some(position - SENTINELS)
            }
        }
    }

    /// Remove the character at `pid`.
    ///
    /// Returns the text offset it occupied and the removed character, or `None` if
    /// the identifier is not present.
    pub fn delete(&mut self, pid: &Pid) -> Option<(usize, char)> {
        let ch = self.chars.remove(pid)?;
        let position = self.index.binary_search(pid).ok()?;
        self.index.remove(position);
        self.retired.insert(pid.clone());
        Some((position - SENTINELS, ch))
    }

    /// Identifier of the character at text offset `offset`.
    pub fn pid_at(&self, offset: usize) -> Option<&Pid> {
        self.index.get(offset + SENTINELS)
    }

    pub fn char_at(&self, pid: &Pid) -> Option<char> {
        self.chars.get(pid).copied()
    }

    /// Text offset of `pid`, if present.
    pub fn offset_of(&self, pid: &Pid) -> Option<usize> {
        if !self.chars.contains_key(pid) {
            return None;
        }
        self.index.binary_search(pid).ok().map(|p| p - SENTINELS)
    }

    /// Neighbours of the insertion point at `offset`: the identifier just before it
    /// (the line-start sentinel at offset 0) and the one at it (`None` at the end).
    pub fn bounds_at(&self, offset: usize) -> Option<(&Pid, Option<&Pid>)> {
        if offset > self.len() {
            return None;
        }
        let prev = &self.index[offset + SENTINELS - 1];
        Some((prev, self.index.get(offset + SENTINELS)))
    }

    /// Generate a fresh identifier for an insertion at `offset`.
    ///
    /// Offsets past the end are clamped to the end.
    pub fn generate_at(&self, site: SiteId, offset: usize) -> Pid {
        let offset = offset.min(self.len());
        let prev = &self.index[offset + SENTINELS - 1];
        let mut pid = Pid::generate(site, prev, self.index.get(offset + SENTINELS));
        // Each retry lands strictly between `prev` and the rejected candidate.
        while self.retired.contains(&pid) {
            pid = Pid::generate(site, prev, Some(&pid));
        }
        pid
    }

    /// Characters in document order with their identifiers.
    pub fn iter(&self) -> impl Iterator<Item = (&Pid, char)> + '_ {
        self.index[SENTINELS..]
            .iter()
            .filter_map(move |pid| self.chars.get(pid).map(|&ch| (pid, ch)))
    }

    /// The materialized document text.
    pub fn text(&self) -> String {
        self.iter().map(|(_, ch)| ch).collect()
    }

    /// Capture the current state for a joining replica.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            pids: self.index.clone(),
            lines: self.text().split(LINE_SEPARATOR).map(str::to_owned).collect(),
        }
    }

    /// Replace the whole state with `snapshot`.
    ///
    /// Nothing is modified when the snapshot is rejected.
    pub fn load_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), SequenceError> {
        let pids = &snapshot.pids;
        if pids.len() < SENTINELS
            || pids[0] != Pid::document_start()
            || pids[1] != Pid::line_start()
        {
            return Err(SequenceError::MissingSentinels);
        }

        let text = snapshot.text();
        let chars = text.chars().count();
        if pids.len() - SENTINELS != chars {
            return Err(SequenceError::Misaligned {
                pids: pids.len() - SENTINELS,
                chars,
            });
        }
        if let Some(position) = pids.windows(2).position(|w| w[0] >= w[1]) {
            return Err(SequenceError::Unordered {
                position: position + 1,
            });
        }

        self.chars = pids[SENTINELS..].iter().cloned().zip(text.chars()).collect();
        self.index = pids.clone();
        self.retired.clear();
        Ok(())
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (_, ch) in self.iter() {
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}
