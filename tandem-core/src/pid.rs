//! Position identifiers.
//!
//! A [`Pid`] is a path of [`Level`]s, each a `(digit, site)` pair. Paths compare
//! lexicographically level by level on digit, then on site; a path that is a strict
//! prefix of another sorts before it. That is exactly the derived ordering of a
//! `Vec<Level>` whose `Level` orders by digit first, so [`Pid`] derives `Ord`.
//!
//! Wire form: one `u64` per level, digit in the high 32 bits and site in the low 32.
//!
//! ```text
//!   document start   [0@0]
//!   line start       [1@0]
//!   'a'              [1025@3]
//!   'b'              [1537@7]            (inserted between 'a' and 'c' by site 7)
//!   'c'              [2049@3]
//!   'x'              [1025@3 1024@2]     (no digit free between 1025 and 1026)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exclusive upper bound for digits. Used as the right-hand digit whenever the
/// right neighbour is the end of the document or has already been passed.
pub const MAX_DIGIT: u32 = u32::MAX;

/// Largest step taken past the left neighbour when a gap is found. Keeps appends
/// dense at the start of the digit range so paths stay short while typing.
const STEP_BOUNDARY: u64 = 1024;

/// Replica identity, assigned by the relay when a replica joins a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(pub u32);

impl SiteId {
    /// Reserved for the document sentinels; never handed to a replica.
    pub const SENTINEL: SiteId = SiteId(0);
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One step of a position path.
///
/// Field order matters: the derived `Ord` compares `digit` before `site`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Level {
    pub digit: u32,
    pub site: SiteId,
}

impl Level {
    pub const fn new(digit: u32, site: SiteId) -> Self {
        Self { digit, site }
    }

    fn to_wire(self) -> u64 {
        (u64::from(self.digit) << 32) | u64::from(self.site.0)
    }

    fn from_wire(raw: u64) -> Self {
        Self {
            digit: (raw >> 32) as u32,
            site: SiteId(raw as u32),
        }
    }
}

const DOCUMENT_START: [Level; 1] = [Level::new(0, SiteId::SENTINEL)];
const LINE_START: [Level; 1] = [Level::new(1, SiteId::SENTINEL)];

/// Errors decoding a position identifier from its wire form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PidError {
    #[error("position identifier has no levels")]
    Empty,
}

/// Immutable, totally ordered position identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<u64>", try_from = "Vec<u64>")]
pub struct Pid {
    levels: Vec<Level>,
}

impl Pid {
    /// Build an identifier from an explicit path. Returns `None` for an empty path.
    pub fn from_levels(levels: Vec<Level>) -> Option<Self> {
        if levels.is_empty() {
            None
        } else {
            Some(Self { levels })
        }
    }

    /// Sentinel bounding the start of every document.
    pub fn document_start() -> Self {
        Self {
            levels: DOCUMENT_START.to_vec(),
        }
    }

    /// Sentinel marking the start of the first line. Lower bound for every
    /// generated identifier.
    pub fn line_start() -> Self {
        Self {
            levels: LINE_START.to_vec(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.levels == DOCUMENT_START || self.levels == LINE_START
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Site of the replica that generated this identifier.
    pub fn site(&self) -> SiteId {
        self.levels[self.levels.len() - 1].site
    }

    /// Generate an identifier strictly between `prev` and `next`.
    ///
    /// `next = None` means the end of the document. Two calls with the same bounds
    /// and different sites produce distinct identifiers, both inside the bounds.
    ///
    /// `prev` must sort before `next`, and `next` must not be a sentinel.
    pub fn generate(site: SiteId, prev: &Pid, next: Option<&Pid>) -> Pid {
        debug_assert!(next.map_or(true, |n| prev < n), "generate bounds out of order");

        let mut levels = Vec::with_capacity(prev.depth() + 1);
        // True while the path built so far is still equal to that bound's prefix.
        let mut on_prev = true;
        let mut on_next = next.is_some();

        let mut depth = 0;
        loop {
            let low = if on_prev { prev.levels.get(depth) } else { None };
            let high = match next {
                Some(next) if on_next => next.levels.get(depth),
                _ => None,
            };
            debug_assert!(!on_next || high.is_some(), "generate passed the end of next");

            let lo = low.map_or(0, |l| u64::from(l.digit));
            let hi = high.map_or(u64::from(MAX_DIGIT), |l| u64::from(l.digit));

            if hi > lo + 1 {
                let step = ((hi - lo) / 2).min(STEP_BOUNDARY);
                levels.push(Level::new((lo + step) as u32, site));
                return Pid { levels };
            }

            // No room at this depth: keep a level that still sorts between the bounds
            // and descend.
            let kept = match (low, high) {
                (Some(low), _) => *low,
                (None, Some(high)) if u64::from(high.digit) == lo => *high,
                _ => Level::new(lo as u32, site),
            };
            on_prev = on_prev && low == Some(&kept);
            on_next = on_next && high == Some(&kept);
            levels.push(kept);
            depth += 1;
        }
    }

    /// Lossless wire encoding of the full path.
    pub fn to_wire(&self) -> Vec<u64> {
        self.levels.iter().map(|l| l.to_wire()).collect()
    }

    pub fn from_wire(raw: &[u64]) -> Result<Self, PidError> {
        if raw.is_empty() {
            return Err(PidError::Empty);
        }
        Ok(Self {
            levels: raw.iter().copied().map(Level::from_wire).collect(),
        })
    }
}

impl From<Pid> for Vec<u64> {
    fn from(pid: Pid) -> Self {
        pid.to_wire()
    }
}

impl TryFrom<Vec<u64>> for Pid {
    type Error = PidError;

    fn try_from(raw: Vec<u64>) -> Result<Self, Self::Error> {
        Pid::from_wire(&raw)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, level) in self.levels.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}@{}", level.digit, level.site)?;
        }
        f.write_str("]")
    }
}
