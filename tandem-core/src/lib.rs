//! # tandem-core: replicated plain-text sequence
//!
//! Every character of a shared document carries a globally unique, totally ordered
//! position identifier. Replicas exchange inserts and deletes keyed by identifier
//! and converge on the same text whatever order concurrent edits were made in.
//!
//! ```text
//!  local edit ──► Pid::generate ──► Sequence::insert / delete ──► wire
//!  wire ───────────────────────────► Sequence::insert / delete ──► editor
//! ```
//!
//! ## Modules
//!
//! - [`pid`]: position identifiers (ordering, generation, wire form)
//! - [`sequence`]: identifier → character store, offsets, snapshots

pub mod pid;
pub mod sequence;

pub use pid::{Level, Pid, PidError, SiteId, MAX_DIGIT};
pub use sequence::{Sequence, SequenceError, Snapshot, LINE_SEPARATOR};
