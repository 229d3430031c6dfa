//! Observer contract for engine events.
//!
//! # Responsibility
//! - Define every event the worker emits, with no-op defaults so observers
//!   implement only what they consume.
//!
//! # Invariants
//! - Events for one command are delivered before the next command runs; the
//!   worker is single-threaded and callbacks are synchronous.

use crate::model::entry::{CategoryStats, DerivedEntry, Entry, SyncEntry};
use crate::model::fields::FieldMask;
use std::collections::BTreeSet;

/// The six parallel lists summarising what a sync merge will do.
///
/// `removed_new` carries the merged tombstone form: the prior live state's
/// fields under the remote's uuid and mtime, so observers can display the
/// pre-removal state. `*_old` entries are `None` when no local record
/// existed.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub removed_old: Vec<Option<SyncEntry>>,
    pub removed_new: Vec<SyncEntry>,
    pub inserted_old: Vec<Option<SyncEntry>>,
    pub inserted_new: Vec<SyncEntry>,
    pub updated_old: Vec<SyncEntry>,
    pub updated_new: Vec<SyncEntry>,
}

impl SyncStats {
    /// Whether the merge will change nothing.
    pub fn is_empty(&self) -> bool {
        self.removed_new.is_empty() && self.inserted_new.is_empty() && self.updated_new.is_empty()
    }
}

/// Event sink for the history worker.
pub trait HistoryObserver {
    fn data_inserted(&self, _entry: &Entry) {}
    fn data_removed(&self, _entry: &Entry) {}
    /// The minimal set of rows whose derived attributes shifted, with one
    /// field mask per row (same mask for the whole batch).
    fn data_updated(&self, _entries: &[DerivedEntry], _fields: &[FieldMask]) {}
    fn data_imported(&self, _entries: &[Entry]) {}
    fn data_synced(&self, _updated: &[SyncEntry], _removed: &[SyncEntry]) {}
    /// Observers should drop cached state and re-read.
    fn data_outdated(&self) {}
    fn history_request_completed(&self, _entries: &[DerivedEntry], _request_id: i64) {}
    fn stats_data_available(&self, _stats: &[CategoryStats], _until: i64) {}
    fn sync_data_available(&self, _entries: &[SyncEntry], _m_end: i64) {}
    fn sync_stats_available(&self, _stats: &SyncStats) {}
    fn size_changed(&self, _size: i64) {}
    fn categories_changed(&self, _categories: &BTreeSet<String>) {}
    fn undo_count_changed(&self, _count: usize) {}
    fn error(&self, _message: &str) {}
}
