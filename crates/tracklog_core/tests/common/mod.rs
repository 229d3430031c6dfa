#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracklog_core::{
    CategoryStats, DerivedEntry, Entry, FieldMask, HistoryObserver, HistoryWorker,
    SqliteHistoryRepository, SyncEntry, SyncStats,
};

/// Request id used by [`snapshot`]; tests pick other ids for their own calls.
pub const SNAPSHOT_REQUEST_ID: i64 = 9_999;

/// Observer that records every event for later assertions.
#[derive(Default)]
pub struct RecordingObserver {
    pub inserted: Mutex<Vec<Entry>>,
    pub removed: Mutex<Vec<Entry>>,
    pub updated: Mutex<Vec<(Vec<DerivedEntry>, Vec<FieldMask>)>>,
    pub imported: Mutex<Vec<Vec<Entry>>>,
    pub synced: Mutex<usize>,
    pub outdated: Mutex<usize>,
    pub history: Mutex<Vec<(Vec<DerivedEntry>, i64)>>,
    pub stats: Mutex<Vec<(Vec<CategoryStats>, i64)>>,
    pub sync_feed: Mutex<Vec<(Vec<SyncEntry>, i64)>>,
    pub sync_stats: Mutex<Vec<SyncStats>>,
    pub sizes: Mutex<Vec<i64>>,
    pub categories: Mutex<Vec<BTreeSet<String>>>,
    pub undo_counts: Mutex<Vec<usize>>,
    pub errors: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn last_size(&self) -> Option<i64> {
        self.sizes.lock().unwrap().last().copied()
    }

    pub fn last_categories(&self) -> Option<BTreeSet<String>> {
        self.categories.lock().unwrap().last().cloned()
    }

    pub fn last_updated(&self) -> Option<(Vec<DerivedEntry>, Vec<FieldMask>)> {
        self.updated.lock().unwrap().last().cloned()
    }

    pub fn clear(&self) {
        self.inserted.lock().unwrap().clear();
        self.removed.lock().unwrap().clear();
        self.updated.lock().unwrap().clear();
        self.imported.lock().unwrap().clear();
        *self.synced.lock().unwrap() = 0;
        *self.outdated.lock().unwrap() = 0;
        self.history.lock().unwrap().clear();
        self.stats.lock().unwrap().clear();
        self.sync_feed.lock().unwrap().clear();
        self.sync_stats.lock().unwrap().clear();
        self.sizes.lock().unwrap().clear();
        self.categories.lock().unwrap().clear();
        self.undo_counts.lock().unwrap().clear();
        self.errors.lock().unwrap().clear();
    }
}

impl HistoryObserver for RecordingObserver {
    fn data_inserted(&self, entry: &Entry) {
        self.inserted.lock().unwrap().push(entry.clone());
    }

    fn data_removed(&self, entry: &Entry) {
        self.removed.lock().unwrap().push(entry.clone());
    }

    fn data_updated(&self, entries: &[DerivedEntry], fields: &[FieldMask]) {
        self.updated
            .lock()
            .unwrap()
            .push((entries.to_vec(), fields.to_vec()));
    }

    fn data_imported(&self, entries: &[Entry]) {
        self.imported.lock().unwrap().push(entries.to_vec());
    }

    fn data_synced(&self, _updated: &[SyncEntry], _removed: &[SyncEntry]) {
        *self.synced.lock().unwrap() += 1;
    }

    fn data_outdated(&self) {
        *self.outdated.lock().unwrap() += 1;
    }

    fn history_request_completed(&self, entries: &[DerivedEntry], request_id: i64) {
        self.history
            .lock()
            .unwrap()
            .push((entries.to_vec(), request_id));
    }

    fn stats_data_available(&self, stats: &[CategoryStats], until: i64) {
        self.stats.lock().unwrap().push((stats.to_vec(), until));
    }

    fn sync_data_available(&self, entries: &[SyncEntry], m_end: i64) {
        self.sync_feed
            .lock()
            .unwrap()
            .push((entries.to_vec(), m_end));
    }

    fn sync_stats_available(&self, stats: &SyncStats) {
        self.sync_stats.lock().unwrap().push(stats.clone());
    }

    fn size_changed(&self, size: i64) {
        self.sizes.lock().unwrap().push(size);
    }

    fn categories_changed(&self, categories: &BTreeSet<String>) {
        self.categories.lock().unwrap().push(categories.clone());
    }

    fn undo_count_changed(&self, count: usize) {
        self.undo_counts.lock().unwrap().push(count);
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

/// In-memory worker with a subscribed recording observer.
pub fn worker_with_observer() -> (HistoryWorker<SqliteHistoryRepository>, Arc<RecordingObserver>) {
    let mut worker = HistoryWorker::open_in_memory().expect("in-memory db should open");
    let observer = Arc::new(RecordingObserver::default());
    worker.subscribe(observer.clone());
    assert!(worker.init());
    (worker, observer)
}

/// Full ascending history read through the event surface.
pub fn snapshot(
    worker: &HistoryWorker<SqliteHistoryRepository>,
    observer: &RecordingObserver,
) -> Vec<DerivedEntry> {
    worker.history_between(SNAPSHOT_REQUEST_ID, 0, i64::MAX, None);
    let history = observer.history.lock().unwrap();
    let (entries, request_id) = history.last().expect("history request should complete");
    assert_eq!(*request_id, SNAPSHOT_REQUEST_ID);
    entries.clone()
}
