//! Entry domain model and its projections.
//!
//! # Responsibility
//! - Define the caller-facing entry record and the read-side projection
//!   carrying derived attributes.
//! - Define the replica-exchange record shared by live rows and tombstones.
//!
//! # Invariants
//! - `uuid` is stable and never reused for another entry.
//! - `start` is unique among live entries (enforced by storage).
//! - A `SyncEntry` with `start == None` denotes a tombstone.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for every entry across replicas.
pub type EntryId = Uuid;

/// Duration sentinel for the open-ended last entry.
pub const OPEN_DURATION: i64 = -1;

/// A single timed activity record as supplied by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Stable global ID, shared between replicas.
    pub uuid: EntryId,
    /// Activity start, seconds since epoch. Primary key among live entries.
    pub start: i64,
    /// Hierarchical category path, e.g. `work/project/task`.
    pub category: String,
    /// Free-text comment.
    pub comment: String,
}

impl Entry {
    /// Creates an entry with a generated stable ID.
    pub fn new(start: i64, category: impl Into<String>, comment: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), start, category, comment)
    }

    /// Creates an entry with a caller-provided stable ID.
    ///
    /// Used by sync and undo paths where identity already exists.
    pub fn with_id(
        uuid: EntryId,
        start: i64,
        category: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            uuid,
            start,
            category: category.into(),
            comment: comment.into(),
        }
    }
}

/// Read-side projection of an entry with its derived attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedEntry {
    pub uuid: EntryId,
    pub start: i64,
    pub category: String,
    pub comment: String,
    /// Gap to the successor in seconds, or [`OPEN_DURATION`] when last.
    pub duration: i64,
    /// Start of the nearest predecessor, or 0 when none.
    pub preceding_start: i64,
}

impl DerivedEntry {
    /// Strips the derived attributes back to the caller-facing record.
    pub fn to_entry(&self) -> Entry {
        Entry::with_id(self.uuid, self.start, &self.category, &self.comment)
    }
}

/// Replica-exchange record carrying a live entry or a tombstone.
///
/// Tombstones have no live fields; `mtime` is the last-writer-wins basis
/// in milliseconds since epoch, monotonic per uuid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub uuid: EntryId,
    pub start: Option<i64>,
    pub category: Option<String>,
    pub comment: Option<String>,
    pub mtime: i64,
}

impl SyncEntry {
    /// Wraps a live entry for exchange or store primitives.
    pub fn live(entry: &Entry, mtime: i64) -> Self {
        Self {
            uuid: entry.uuid,
            start: Some(entry.start),
            category: Some(entry.category.clone()),
            comment: Some(entry.comment.clone()),
            mtime,
        }
    }

    /// Builds a tombstone record.
    pub fn tombstone(uuid: EntryId, mtime: i64) -> Self {
        Self {
            uuid,
            start: None,
            category: None,
            comment: None,
            mtime,
        }
    }

    /// Whether this record describes a live entry rather than a tombstone.
    pub fn is_live(&self) -> bool {
        self.start.is_some()
    }

    /// Converts to the caller-facing record; `None` for tombstones.
    pub fn to_entry(&self) -> Option<Entry> {
        Some(Entry::with_id(
            self.uuid,
            self.start?,
            self.category.clone().unwrap_or_default(),
            self.comment.clone().unwrap_or_default(),
        ))
    }
}

/// One aggregated stats bucket: a category prefix and its summed duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub category: String,
    pub duration: i64,
}

#[cfg(test)]
mod tests {
    use super::{Entry, SyncEntry};
    use uuid::Uuid;

    #[test]
    fn tombstone_is_not_live() {
        let tombstone = SyncEntry::tombstone(Uuid::new_v4(), 42);
        assert!(!tombstone.is_live());
        assert!(tombstone.to_entry().is_none());
    }

    #[test]
    fn live_record_round_trips_to_entry() {
        let entry = Entry::new(100, "work/project", "first task");
        let record = SyncEntry::live(&entry, 1_000);
        assert!(record.is_live());
        assert_eq!(record.to_entry().unwrap(), entry);
    }
}
