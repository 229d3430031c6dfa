//! History engine command surface.
//!
//! # Responsibility
//! - Drive the repository primitives from the public commands.
//! - Record inverses in the undo journal before each mutation.
//! - Reconcile replica sync batches with last-writer-wins semantics.
//! - Notify observers of the minimal set of rows whose derived attributes
//!   shifted after each mutation.
//!
//! # Invariants
//! - `size()` equals the live row count after every mutation.
//! - `categories()` equals the distinct categories of live rows after every
//!   mutation.
//! - Stale or tombstone-dominated writes are silent no-ops: no events.
//! - Storage failures clear the undo journal and emit `data_outdated`.

use crate::db::{open_db, open_db_in_memory, DbError};
use crate::model::entry::{DerivedEntry, Entry, SyncEntry};
use crate::model::fields::FieldMask;
use crate::repo::history_repo::{HistoryRepository, RepoError, RepoResult, SqliteHistoryRepository};
use crate::service::observer::{HistoryObserver, SyncStats};
use crate::service::undo::{UndoRecord, UndoStack};
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Single-writer history engine over a [`HistoryRepository`].
///
/// The worker itself is synchronous; the host owns threading and delivers
/// commands one at a time. Observer callbacks run inline, so all events for
/// one command are seen before the next command executes.
pub struct HistoryWorker<R: HistoryRepository> {
    repo: R,
    size: i64,
    categories: BTreeSet<String>,
    undo_stack: UndoStack,
    observers: Vec<Arc<dyn HistoryObserver>>,
    last_mtime: i64,
}

impl HistoryWorker<SqliteHistoryRepository> {
    /// Opens (or creates) the database file and wires the SQLite store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = open_db(path)?;
        Ok(Self::new(SqliteHistoryRepository::new(conn)))
    }

    /// In-memory store, used by tests and throwaway sessions.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = open_db_in_memory()?;
        Ok(Self::new(SqliteHistoryRepository::new(conn)))
    }
}

impl<R: HistoryRepository> HistoryWorker<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            size: 0,
            categories: BTreeSet::new(),
            undo_stack: UndoStack::new(),
            observers: Vec::new(),
            last_mtime: 0,
        }
    }

    /// Registers an observer; events are delivered in subscription order.
    pub fn subscribe(&mut self, observer: Arc<dyn HistoryObserver>) {
        self.observers.push(observer);
    }

    /// Loads the size and category properties from the store.
    ///
    /// Must be called once after subscription and before any command.
    pub fn init(&mut self) -> bool {
        match self.refresh_size().and_then(|()| self.refresh_categories()) {
            Ok(()) => {
                info!(
                    "event=init module=history status=ok size={} categories={}",
                    self.size,
                    self.categories.len()
                );
                true
            }
            Err(err) => {
                error!("event=init module=history status=error error={err}");
                self.emit_error(&err.to_string());
                false
            }
        }
    }

    /// Count of live entries.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// Distinct categories of live entries.
    pub fn categories(&self) -> &BTreeSet<String> {
        &self.categories
    }

    /// Depth of the undo journal.
    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    /// Inserts a new entry, journalling its inverse first.
    pub fn insert(&mut self, entry: Entry) {
        self.push_undo(UndoRecord::Insert(entry.clone()));

        let record = SyncEntry::live(&entry, self.next_mtime());
        if let MutationOutcome::Suppressed = self.insert_entry(&entry, &record) {
            // Nothing happened, so there is nothing to reverse.
            self.drop_last_undo();
        }
    }

    /// Removes the entry with the given uuid, journalling its pre-image.
    pub fn remove(&mut self, entry: &Entry) {
        let old = match self.repo.entry_by_uuid(entry.uuid) {
            Ok(Some(old)) => old,
            Ok(None) => {
                warn!(
                    "event=remove module=history status=rejected reason=unknown_uuid uuid={}",
                    entry.uuid
                );
                self.emit_error("Entry to remove not found");
                return;
            }
            Err(err) => {
                self.fail(&err);
                return;
            }
        };

        let pre_image = old.to_entry();
        self.push_undo(UndoRecord::Remove(pre_image.clone()));
        let mtime = self.next_mtime();
        self.remove_entry(&pre_image, mtime);
    }

    /// Edits the masked fields of an entry, journalling its pre-image.
    pub fn edit(&mut self, entry: Entry, fields: FieldMask) {
        if fields.is_empty() {
            warn!("event=edit module=history status=rejected reason=no_fields");
            return;
        }

        let old = match self.repo.entry_by_uuid(entry.uuid) {
            Ok(Some(old)) => old,
            Ok(None) => {
                warn!(
                    "event=edit module=history status=rejected reason=unknown_uuid uuid={}",
                    entry.uuid
                );
                self.emit_error("Entry to update not found");
                return;
            }
            Err(err) => {
                self.fail(&err);
                return;
            }
        };

        self.push_undo(UndoRecord::Edit(old.to_entry(), fields));

        let record = SyncEntry::live(&entry, self.next_mtime());
        self.apply_edit(&record, fields, old.start, &old.category);
    }

    /// Renames every entry of `old_name` to `new_name`.
    pub fn edit_category(&mut self, old_name: &str, new_name: &str) {
        if new_name.is_empty() {
            error!("event=edit_category module=history status=rejected reason=empty_name");
            self.emit_error("Empty category name");
            return;
        }
        if old_name == new_name {
            warn!(
                "event=edit_category module=history status=rejected reason=same_name \
                 category={new_name}"
            );
            return;
        }

        let entries = match self.repo.entries_by_category(old_name) {
            Ok(entries) => entries,
            Err(err) => {
                self.fail(&err);
                return;
            }
        };
        if entries.is_empty() {
            // The name may only survive in the in-memory index; prune it.
            warn!(
                "event=edit_category module=history status=rejected reason=unknown_category \
                 category={old_name}"
            );
            self.remove_category(old_name);
            return;
        }

        let data: Vec<Entry> = entries.iter().map(DerivedEntry::to_entry).collect();
        let masks = vec![FieldMask::CATEGORY; data.len()];
        self.push_undo(UndoRecord::EditCategory(data, masks));

        let mtime = self.next_mtime();
        match self.repo.rename_category(old_name, new_name, mtime) {
            Ok(renamed) => {
                debug!("event=edit_category module=history status=ok renamed={renamed}");
                if let Err(err) = self.refresh_categories() {
                    self.fail(&err);
                    return;
                }
                self.for_each(|o| o.data_outdated());
            }
            Err(err) => self.fail(&err),
        }
    }

    /// Inserts a batch atomically. Records no undo; clears it on failure.
    pub fn import(&mut self, entries: &[Entry]) {
        let now = self.next_mtime();
        let records: Vec<SyncEntry> = entries
            .iter()
            .map(|entry| SyncEntry::live(entry, now))
            .collect();

        match self.repo.import_entries(&records) {
            Ok(()) => {
                if let Err(err) = self.refresh_size().and_then(|()| self.refresh_categories()) {
                    self.fail(&err);
                    return;
                }
                info!(
                    "event=import module=history status=ok count={}",
                    entries.len()
                );
                self.for_each(|o| o.data_imported(entries));
            }
            Err(err) => self.fail(&err),
        }
    }

    /// Reconciles remote updates and removals against local state.
    ///
    /// A remote record loses against any local record with `mtime >=` its
    /// own; surviving records are applied atomically: removals, insertions,
    /// then full-field updates.
    pub fn sync(&mut self, updated: &[SyncEntry], removed: &[SyncEntry]) {
        let stats = match self.classify_sync(updated, removed) {
            Some(stats) => stats,
            None => return,
        };

        self.for_each(|o| o.sync_stats_available(&stats));

        if let Err(err) =
            self.repo
                .apply_sync(&stats.removed_new, &stats.inserted_new, &stats.updated_new)
        {
            self.fail(&err);
            return;
        }

        if let Err(err) = self.refresh_size().and_then(|()| self.refresh_categories()) {
            self.fail(&err);
            return;
        }

        info!(
            "event=sync module=history status=ok removed={} inserted={} updated={}",
            stats.removed_new.len(),
            stats.inserted_new.len(),
            stats.updated_new.len()
        );

        for record in &stats.removed_new {
            // Merged removals carry live fields only when a live row existed.
            if let Some(entry) = record.to_entry() {
                self.for_each(|o| o.data_removed(&entry));
            }
        }
        for record in &stats.removed_new {
            if let Some(start) = record.start {
                self.notify_remove_updates(start);
            }
        }
        for record in &stats.inserted_new {
            if let Some(entry) = record.to_entry() {
                self.for_each(|o| o.data_inserted(&entry));
            }
        }
        for record in &stats.inserted_new {
            if let Some(start) = record.start {
                self.notify_insert_updates(start);
            }
        }
        for (new, old) in stats.updated_new.iter().zip(stats.updated_old.iter()) {
            let mut fields = FieldMask::NONE;
            if new.start != old.start {
                fields |= FieldMask::START_TIME;
            }
            if new.category != old.category {
                fields |= FieldMask::CATEGORY;
            }
            if new.comment != old.comment {
                fields |= FieldMask::COMMENT;
            }
            self.notify_edit_updates(new, fields, old.start.unwrap_or(0));
        }

        self.for_each(|o| o.data_synced(updated, removed));
    }

    /// Reverses the most recent journalled mutation.
    pub fn undo(&mut self) {
        let Some(record) = self.undo_stack.pop() else {
            warn!("event=undo module=history status=rejected reason=empty_stack");
            return;
        };

        match record {
            UndoRecord::Insert(entry) => {
                let mtime = self.next_mtime();
                self.remove_entry(&entry, mtime);
            }
            UndoRecord::Remove(entry) => {
                let record = SyncEntry::live(&entry, self.next_mtime());
                self.insert_entry(&entry, &record);
            }
            UndoRecord::Edit(entry, fields) => {
                self.undo_edit(&entry, fields);
            }
            UndoRecord::EditCategory(entries, masks) => {
                for (entry, fields) in entries.iter().zip(masks.iter()) {
                    if !self.undo_edit(entry, *fields) {
                        break;
                    }
                }
            }
        }

        self.for_each(|o| o.undo_count_changed(self.undo_stack.len()));
    }

    /// Entries with `start` in `[begin, end]`, ascending, optionally
    /// filtered by exact category. `request_id` is echoed verbatim.
    pub fn history_between(&self, request_id: i64, begin: i64, end: i64, category: Option<&str>) {
        match self.repo.history_between(begin, end, category) {
            Ok(entries) => self.for_each(|o| o.history_request_completed(&entries, request_id)),
            Err(err) => {
                self.emit_error(&err.to_string());
                self.for_each(|o| o.history_request_completed(&[], request_id));
            }
        }
    }

    /// Up to `limit` entries with `start > from`, ascending.
    pub fn history_after(&self, request_id: i64, limit: u32, from: i64) {
        match self.repo.history_after(from, limit) {
            Ok(entries) => self.for_each(|o| o.history_request_completed(&entries, request_id)),
            Err(err) => {
                self.emit_error(&err.to_string());
                self.for_each(|o| o.history_request_completed(&[], request_id));
            }
        }
    }

    /// Up to `limit` entries with `start < until`, nearest first, emitted
    /// ascending.
    pub fn history_before(&self, request_id: i64, limit: u32, until: i64) {
        match self.repo.history_before(until, limit) {
            Ok(entries) => self.for_each(|o| o.history_request_completed(&entries, request_id)),
            Err(err) => {
                self.emit_error(&err.to_string());
                self.for_each(|o| o.history_request_completed(&[], request_id));
            }
        }
    }

    /// Sums durations per category prefix over `[begin, end]`.
    pub fn stats(&self, begin: i64, end: i64, category: Option<&str>, separator: &str) {
        match self.repo.stats(begin, end, category, separator, now_secs()) {
            Ok(stats) => self.for_each(|o| o.stats_data_available(&stats, end)),
            Err(err) => self.emit_error(&err.to_string()),
        }
    }

    /// Live rows and tombstones modified in `(m_begin, m_end]`.
    pub fn sync_data(&self, m_begin: i64, m_end: i64) {
        match self.repo.sync_data(m_begin, m_end) {
            Ok(entries) => self.for_each(|o| o.sync_data_available(&entries, m_end)),
            Err(err) => self.emit_error(&err.to_string()),
        }
    }

    fn classify_sync(&mut self, updated: &[SyncEntry], removed: &[SyncEntry]) -> Option<SyncStats> {
        let mut stats = SyncStats::default();

        for entry in removed {
            let affected = match self.repo.sync_affected(entry.uuid) {
                Ok(affected) => affected,
                Err(err) => {
                    self.fail(&err);
                    return None;
                }
            };
            if let Some(local) = &affected {
                if local.mtime >= entry.mtime {
                    continue;
                }
            }

            // Merged tombstone: the prior live state's fields under the
            // remote's uuid and mtime.
            let merged = match &affected {
                Some(prior) if prior.is_live() => SyncEntry {
                    uuid: entry.uuid,
                    start: prior.start,
                    category: prior.category.clone(),
                    comment: prior.comment.clone(),
                    mtime: entry.mtime,
                },
                _ => SyncEntry::tombstone(entry.uuid, entry.mtime),
            };
            stats.removed_old.push(affected);
            stats.removed_new.push(merged);
        }

        for entry in updated {
            let affected = match self.repo.sync_affected(entry.uuid) {
                Ok(affected) => affected,
                Err(err) => {
                    self.fail(&err);
                    return None;
                }
            };
            if let Some(local) = &affected {
                if local.mtime >= entry.mtime {
                    continue;
                }
            }

            match affected {
                Some(prior) if prior.is_live() => {
                    stats.updated_old.push(prior);
                    stats.updated_new.push(entry.clone());
                }
                other => {
                    stats.inserted_old.push(other);
                    stats.inserted_new.push(entry.clone());
                }
            }
        }

        Some(stats)
    }

    fn insert_entry(&mut self, entry: &Entry, record: &SyncEntry) -> MutationOutcome {
        match self.repo.insert_entry(record) {
            Ok(true) => {
                self.set_size(self.size + 1);
                self.add_category(entry.category.clone());
                self.for_each(|o| o.data_inserted(entry));
                self.notify_insert_updates(entry.start);
                MutationOutcome::Applied
            }
            Ok(false) => {
                debug!(
                    "event=insert module=history status=suppressed uuid={} start={}",
                    entry.uuid, entry.start
                );
                MutationOutcome::Suppressed
            }
            Err(err) => {
                self.fail(&err);
                MutationOutcome::Failed
            }
        }
    }

    fn remove_entry(&mut self, entry: &Entry, mtime: i64) -> MutationOutcome {
        match self.repo.remove_entry(entry.uuid, mtime) {
            Ok(true) => {
                self.set_size(self.size - 1);
                self.for_each(|o| o.data_removed(entry));
                self.notify_remove_updates(entry.start);
                self.prune_category(&entry.category);
                MutationOutcome::Applied
            }
            Ok(false) => {
                debug!(
                    "event=remove module=history status=suppressed uuid={}",
                    entry.uuid
                );
                MutationOutcome::Suppressed
            }
            Err(err) => {
                self.fail(&err);
                MutationOutcome::Failed
            }
        }
    }

    fn undo_edit(&mut self, entry: &Entry, fields: FieldMask) -> bool {
        let old = match self.repo.entry_by_uuid(entry.uuid) {
            Ok(Some(old)) => old,
            Ok(None) => {
                self.emit_error("Entry to update not found");
                return false;
            }
            Err(err) => {
                self.fail(&err);
                return false;
            }
        };

        let record = SyncEntry::live(entry, self.next_mtime());
        self.apply_edit(&record, fields, old.start, &old.category)
    }

    fn apply_edit(
        &mut self,
        data: &SyncEntry,
        fields: FieldMask,
        old_start: i64,
        old_category: &str,
    ) -> bool {
        match self.repo.edit_entry(data, fields) {
            Ok(true) => {
                if fields.contains(FieldMask::CATEGORY) {
                    if let Some(category) = &data.category {
                        self.add_category(category.clone());
                    }
                    self.prune_category(old_category);
                }
                self.notify_edit_updates(data, fields, old_start);
                true
            }
            Ok(false) => {
                debug!(
                    "event=edit module=history status=suppressed uuid={}",
                    data.uuid
                );
                true
            }
            Err(err) => {
                self.fail(&err);
                false
            }
        }
    }

    fn notify_insert_updates(&self, start: i64) {
        match self.repo.insert_neighbourhood(start) {
            Ok(entries) => {
                self.emit_updated(entries, FieldMask::DURATION | FieldMask::PRECEDING_START)
            }
            Err(err) => self.emit_error(&err.to_string()),
        }
    }

    fn notify_remove_updates(&self, start: i64) {
        match self.repo.remove_neighbourhood(start) {
            Ok(entries) => {
                self.emit_updated(entries, FieldMask::DURATION | FieldMask::PRECEDING_START)
            }
            Err(err) => self.emit_error(&err.to_string()),
        }
    }

    fn notify_edit_updates(&self, data: &SyncEntry, mut fields: FieldMask, old_start: i64) {
        let new_start = data.start.unwrap_or(0);
        let result = if fields.contains(FieldMask::START_TIME) {
            // Moving an entry shifts derived attributes around both the old
            // and the new position.
            fields |= FieldMask::DURATION | FieldMask::PRECEDING_START;
            self.repo.edit_neighbourhood(new_start, old_start)
        } else {
            self.repo.entry_at(new_start)
        };

        match result {
            Ok(entries) => self.emit_updated(entries, fields),
            Err(err) => self.emit_error(&err.to_string()),
        }
    }

    fn emit_updated(&self, entries: Vec<DerivedEntry>, fields: FieldMask) {
        if entries.is_empty() {
            return;
        }
        debug!(
            "event=notify module=history status=ok count={} fields={}",
            entries.len(),
            fields
        );
        let masks = vec![fields; entries.len()];
        self.for_each(|o| o.data_updated(&entries, &masks));
    }

    fn set_size(&mut self, size: i64) {
        if self.size == size {
            return;
        }
        self.size = size;
        self.for_each(|o| o.size_changed(size));
    }

    fn refresh_size(&mut self) -> RepoResult<()> {
        let count = self.repo.live_count()?;
        self.set_size(count);
        Ok(())
    }

    fn refresh_categories(&mut self) -> RepoResult<()> {
        let fresh = self.repo.distinct_categories()?;
        if fresh != self.categories {
            self.categories = fresh;
            self.for_each(|o| o.categories_changed(&self.categories));
        }
        Ok(())
    }

    fn add_category(&mut self, category: String) {
        if self.categories.insert(category) {
            self.for_each(|o| o.categories_changed(&self.categories));
        }
    }

    fn remove_category(&mut self, category: &str) {
        if self.categories.remove(category) {
            self.for_each(|o| o.categories_changed(&self.categories));
        }
    }

    /// Drops `category` from the index when no live entry carries it anymore.
    fn prune_category(&mut self, category: &str) {
        if !self.categories.contains(category) {
            return;
        }
        match self.repo.category_in_use(category) {
            Ok(true) => {}
            Ok(false) => self.remove_category(category),
            Err(err) => self.emit_error(&err.to_string()),
        }
    }

    /// Wall-clock milliseconds, nudged forward so consecutive commands never
    /// share an mtime. Keeps mtime strictly monotonic per uuid even when
    /// several commands land in the same millisecond (e.g. remove then undo).
    fn next_mtime(&mut self) -> i64 {
        let now = now_ms();
        self.last_mtime = if now > self.last_mtime {
            now
        } else {
            self.last_mtime + 1
        };
        self.last_mtime
    }

    fn push_undo(&mut self, record: UndoRecord) {
        if self.undo_stack.push(record) {
            self.for_each(|o| o.undo_count_changed(self.undo_stack.len()));
        }
    }

    fn drop_last_undo(&mut self) {
        if self.undo_stack.pop().is_some() {
            self.for_each(|o| o.undo_count_changed(self.undo_stack.len()));
        }
    }

    /// Storage failure: report, clear the journal, tell observers to reload.
    fn fail(&mut self, err: &RepoError) {
        error!("event=mutation module=history status=error error={err}");
        let message = err.to_string();
        self.for_each(|o| o.error(&message));
        self.process_fail();
    }

    fn process_fail(&mut self) {
        self.undo_stack.clear();
        self.for_each(|o| o.undo_count_changed(0));
        self.for_each(|o| o.data_outdated());
    }

    fn emit_error(&self, message: &str) {
        error!("event=error module=history message={message}");
        self.for_each(|o| o.error(message));
    }

    fn for_each(&self, f: impl Fn(&dyn HistoryObserver)) {
        for observer in &self.observers {
            f(observer.as_ref());
        }
    }
}

enum MutationOutcome {
    Applied,
    Suppressed,
    Failed,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
