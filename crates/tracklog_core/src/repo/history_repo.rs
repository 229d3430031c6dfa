//! History repository contract and SQLite implementation.
//!
//! # Responsibility
//! - Provide the primitive mutations of the history store under the
//!   trigger-enforced duration and modification-time rules.
//! - Provide every read path: history ranges, stats aggregation, the sync
//!   feed and the notification neighbourhood queries.
//!
//! # Invariants
//! - Mutations suppressed by the mtime guards return `false`/zero, not errors.
//! - Bulk operations run inside one transaction and roll back wholesale.
//! - UUIDs are persisted as 16-byte big-endian RFC 4122 blobs.

use crate::db::DbError;
use crate::model::entry::{CategoryStats, DerivedEntry, EntryId, SyncEntry};
use crate::model::fields::FieldMask;
use rusqlite::types::Value;
use rusqlite::{named_params, params, params_from_iter, Connection, Params, Row};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Shared projection: every read yields the row plus the start instant of
/// its nearest predecessor (0 when none).
const ENTRY_SELECT_SQL: &str = "SELECT uuid, start, category, comment, duration, \
     ifnull((SELECT start FROM timelog WHERE start < result.start ORDER BY start DESC LIMIT 1), 0) \
     FROM timelog AS result";

pub type RepoResult<T> = Result<T, RepoError>;

/// Generic repository error for history persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid history data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Storage contract of the history engine.
///
/// Write primitives return whether a row actually changed so callers can
/// distinguish applied mutations from silent last-writer-wins rejections.
pub trait HistoryRepository {
    /// Inserts a live row. Returns `false` when a tombstone suppressed it.
    fn insert_entry(&mut self, data: &SyncEntry) -> RepoResult<bool>;
    /// Records or bumps a tombstone; returns `true` iff a live row was
    /// deleted as a consequence.
    fn remove_entry(&mut self, uuid: EntryId, mtime: i64) -> RepoResult<bool>;
    /// Updates the masked fields plus mtime. Returns `false` on stale mtime.
    fn edit_entry(&mut self, data: &SyncEntry, fields: FieldMask) -> RepoResult<bool>;
    /// Moves every entry of `old` to `new`, bumping mtime. Returns the row count.
    fn rename_category(&mut self, old: &str, new: &str, mtime: i64) -> RepoResult<usize>;
    /// Inserts a batch atomically; rolls back wholesale on failure.
    fn import_entries(&mut self, data: &[SyncEntry]) -> RepoResult<()>;
    /// Applies a merged sync batch atomically: removals, then insertions,
    /// then full-field updates.
    fn apply_sync(
        &mut self,
        removed: &[SyncEntry],
        inserted: &[SyncEntry],
        updated: &[SyncEntry],
    ) -> RepoResult<()>;

    fn entry_by_uuid(&self, uuid: EntryId) -> RepoResult<Option<DerivedEntry>>;
    fn entries_by_category(&self, category: &str) -> RepoResult<Vec<DerivedEntry>>;
    fn history_between(
        &self,
        begin: i64,
        end: i64,
        category: Option<&str>,
    ) -> RepoResult<Vec<DerivedEntry>>;
    fn history_after(&self, from: i64, limit: u32) -> RepoResult<Vec<DerivedEntry>>;
    /// Entries with `start < until`, nearest first internally, returned ascending.
    fn history_before(&self, until: i64, limit: u32) -> RepoResult<Vec<DerivedEntry>>;
    /// Sums durations per category prefix; `now` feeds the open-ended bucket.
    fn stats(
        &self,
        begin: i64,
        end: i64,
        category: Option<&str>,
        separator: &str,
        now: i64,
    ) -> RepoResult<Vec<CategoryStats>>;
    /// Live rows and tombstones with `mtime` in `(m_begin, m_end]`, mtime ascending.
    fn sync_data(&self, m_begin: i64, m_end: i64) -> RepoResult<Vec<SyncEntry>>;
    /// The record (live or tombstone) with the largest mtime for `uuid`.
    fn sync_affected(&self, uuid: EntryId) -> RepoResult<Option<SyncEntry>>;

    fn live_count(&self) -> RepoResult<i64>;
    fn distinct_categories(&self) -> RepoResult<BTreeSet<String>>;
    fn category_in_use(&self, category: &str) -> RepoResult<bool>;

    /// Rows whose derived attributes shift after an insert at `start`.
    fn insert_neighbourhood(&self, start: i64) -> RepoResult<Vec<DerivedEntry>>;
    /// Rows whose derived attributes shift after a removal at `start`.
    fn remove_neighbourhood(&self, start: i64) -> RepoResult<Vec<DerivedEntry>>;
    /// Union of the insert neighbourhood at `new_start` and the removal
    /// neighbourhood at `old_start`.
    fn edit_neighbourhood(&self, new_start: i64, old_start: i64) -> RepoResult<Vec<DerivedEntry>>;
    fn entry_at(&self, start: i64) -> RepoResult<Vec<DerivedEntry>>;
}

/// SQLite-backed history repository owning the connection.
pub struct SqliteHistoryRepository {
    conn: Connection,
}

impl SqliteHistoryRepository {
    /// Wraps a migrated/ready connection (see [`crate::db::open_db`]).
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    fn query_entries<P: Params>(&self, sql: &str, bindings: P) -> RepoResult<Vec<DerivedEntry>> {
        collect_entries(&self.conn, sql, bindings)
    }

    fn query_sync<P: Params>(&self, sql: &str, bindings: P) -> RepoResult<Vec<SyncEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(bindings)?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(parse_sync_row(row)?);
        }
        Ok(entries)
    }
}

impl HistoryRepository for SqliteHistoryRepository {
    fn insert_entry(&mut self, data: &SyncEntry) -> RepoResult<bool> {
        insert_row(&self.conn, data)
    }

    fn remove_entry(&mut self, uuid: EntryId, mtime: i64) -> RepoResult<bool> {
        remove_row(&self.conn, uuid, mtime)
    }

    fn edit_entry(&mut self, data: &SyncEntry, fields: FieldMask) -> RepoResult<bool> {
        edit_row(&self.conn, data, fields)
    }

    fn rename_category(&mut self, old: &str, new: &str, mtime: i64) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE timelog SET category = ?1, mtime = ?2 WHERE category = ?3;",
            params![new, mtime, old],
        )?;
        Ok(changed)
    }

    fn import_entries(&mut self, data: &[SyncEntry]) -> RepoResult<()> {
        let tx = self.conn.transaction()?;
        for entry in data {
            insert_row(&tx, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn apply_sync(
        &mut self,
        removed: &[SyncEntry],
        inserted: &[SyncEntry],
        updated: &[SyncEntry],
    ) -> RepoResult<()> {
        let tx = self.conn.transaction()?;
        for entry in removed {
            remove_row(&tx, entry.uuid, entry.mtime)?;
        }
        for entry in inserted {
            insert_row(&tx, entry)?;
        }
        for entry in updated {
            edit_row(&tx, entry, FieldMask::ALL_FIELDS)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn entry_by_uuid(&self, uuid: EntryId) -> RepoResult<Option<DerivedEntry>> {
        let entries = self.query_entries(
            &format!("{ENTRY_SELECT_SQL} WHERE uuid = ?1"),
            [uuid.as_bytes().as_slice()],
        )?;
        Ok(entries.into_iter().next())
    }

    fn entries_by_category(&self, category: &str) -> RepoResult<Vec<DerivedEntry>> {
        self.query_entries(
            &format!("{ENTRY_SELECT_SQL} WHERE category = ?1 ORDER BY start ASC"),
            [category],
        )
    }

    fn history_between(
        &self,
        begin: i64,
        end: i64,
        category: Option<&str>,
    ) -> RepoResult<Vec<DerivedEntry>> {
        match category {
            None => self.query_entries(
                &format!("{ENTRY_SELECT_SQL} WHERE start BETWEEN ?1 AND ?2 ORDER BY start ASC"),
                params![begin, end],
            ),
            Some(category) => self.query_entries(
                &format!(
                    "{ENTRY_SELECT_SQL} \
                     WHERE start BETWEEN ?1 AND ?2 AND category = ?3 ORDER BY start ASC"
                ),
                params![begin, end, category],
            ),
        }
    }

    fn history_after(&self, from: i64, limit: u32) -> RepoResult<Vec<DerivedEntry>> {
        self.query_entries(
            &format!("{ENTRY_SELECT_SQL} WHERE start > ?1 ORDER BY start ASC LIMIT ?2"),
            params![from, limit],
        )
    }

    fn history_before(&self, until: i64, limit: u32) -> RepoResult<Vec<DerivedEntry>> {
        let mut entries = self.query_entries(
            &format!("{ENTRY_SELECT_SQL} WHERE start < ?1 ORDER BY start DESC LIMIT ?2"),
            params![until, limit],
        )?;
        entries.reverse();
        Ok(entries)
    }

    fn stats(
        &self,
        begin: i64,
        end: i64,
        category: Option<&str>,
        separator: &str,
        now: i64,
    ) -> RepoResult<Vec<CategoryStats>> {
        // The bucket name is the category cut at the first separator beyond
        // the filter; an open-ended last entry contributes `now - start`.
        let sql = format!(
            "WITH result AS ( \
                 SELECT rtrim(substr(category, 1, ifnull({prefix}, length(category)))) AS category, \
                        CASE WHEN duration != -1 THEN duration \
                             ELSE :now - (SELECT start FROM timelog ORDER BY start DESC LIMIT 1) \
                        END AS duration \
                 FROM timelog \
                 WHERE (start BETWEEN :begin AND :end) {filter} \
             ) \
             SELECT category, sum(duration) FROM result \
             GROUP BY category \
             ORDER BY category ASC",
            prefix = match category {
                None => "nullif(instr(category, :separator) - 1, -1)",
                Some(_) =>
                    "nullif(instr(substr(category, \
                         nullif(instr(substr(category, length(:category) + 1), :separator), 0) \
                         + 1 + length(:category)), :separator), 0) + length(:category)",
            },
            filter = match category {
                None => "",
                Some(_) => "AND category LIKE :category || '%'",
            },
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = match category {
            None => stmt.query(named_params! {
                ":begin": begin,
                ":end": end,
                ":separator": separator,
                ":now": now,
            })?,
            Some(category) => stmt.query(named_params! {
                ":begin": begin,
                ":end": end,
                ":separator": separator,
                ":now": now,
                ":category": category,
            })?,
        };

        let mut stats = Vec::new();
        while let Some(row) = rows.next()? {
            stats.push(CategoryStats {
                category: row.get(0)?,
                duration: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
            });
        }
        Ok(stats)
    }

    fn sync_data(&self, m_begin: i64, m_end: i64) -> RepoResult<Vec<SyncEntry>> {
        self.query_sync(
            "WITH result AS ( \
                 SELECT uuid, start, category, comment, mtime FROM timelog \
                 WHERE mtime > :m_begin AND mtime <= :m_end \
             UNION ALL \
                 SELECT uuid, NULL, NULL, NULL, mtime FROM removed \
                 WHERE mtime > :m_begin AND mtime <= :m_end \
             ) \
             SELECT * FROM result ORDER BY mtime ASC",
            named_params! { ":m_begin": m_begin, ":m_end": m_end },
        )
    }

    fn sync_affected(&self, uuid: EntryId) -> RepoResult<Option<SyncEntry>> {
        let entries = self.query_sync(
            "WITH result AS ( \
                 SELECT uuid, start, category, comment, mtime FROM timelog \
                 WHERE uuid = :uuid \
             UNION ALL \
                 SELECT uuid, NULL, NULL, NULL, mtime FROM removed \
                 WHERE uuid = :uuid \
             ) \
             SELECT * FROM result ORDER BY mtime DESC LIMIT 1",
            named_params! { ":uuid": uuid.as_bytes().as_slice() },
        )?;
        Ok(entries.into_iter().next())
    }

    fn live_count(&self) -> RepoResult<i64> {
        let count = self
            .conn
            .query_row("SELECT count(*) FROM timelog;", [], |row| row.get(0))?;
        Ok(count)
    }

    fn distinct_categories(&self) -> RepoResult<BTreeSet<String>> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT category FROM timelog;")?;
        let mut rows = stmt.query([])?;
        let mut categories = BTreeSet::new();
        while let Some(row) = rows.next()? {
            categories.insert(row.get(0)?);
        }
        Ok(categories)
    }

    fn category_in_use(&self, category: &str) -> RepoResult<bool> {
        let in_use = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM timelog WHERE category = ?1);",
            [category],
            |row| row.get(0),
        )?;
        Ok(in_use)
    }

    fn insert_neighbourhood(&self, start: i64) -> RepoResult<Vec<DerivedEntry>> {
        // LIMIT 2 below the new start covers the inserted row and its
        // predecessor; one row above covers the successor.
        self.query_entries(
            &format!(
                "SELECT * FROM ( \
                     {ENTRY_SELECT_SQL} WHERE start <= :new_start ORDER BY start DESC LIMIT 2 \
                 ) \
                 UNION \
                 SELECT * FROM ( \
                     {ENTRY_SELECT_SQL} WHERE start > :new_start ORDER BY start ASC LIMIT 1 \
                 ) \
                 ORDER BY start ASC"
            ),
            named_params! { ":new_start": start },
        )
    }

    fn remove_neighbourhood(&self, start: i64) -> RepoResult<Vec<DerivedEntry>> {
        self.query_entries(
            &format!(
                "SELECT * FROM ( \
                     {ENTRY_SELECT_SQL} WHERE start < :old_start ORDER BY start DESC LIMIT 1 \
                 ) \
                 UNION \
                 SELECT * FROM ( \
                     {ENTRY_SELECT_SQL} WHERE start > :old_start ORDER BY start ASC LIMIT 1 \
                 ) \
                 ORDER BY start ASC"
            ),
            named_params! { ":old_start": start },
        )
    }

    fn edit_neighbourhood(&self, new_start: i64, old_start: i64) -> RepoResult<Vec<DerivedEntry>> {
        self.query_entries(
            &format!(
                "SELECT * FROM ( \
                     {ENTRY_SELECT_SQL} WHERE start <= :new_start ORDER BY start DESC LIMIT 2 \
                 ) \
                 UNION \
                 SELECT * FROM ( \
                     {ENTRY_SELECT_SQL} WHERE start > :new_start ORDER BY start ASC LIMIT 1 \
                 ) \
                 UNION \
                 SELECT * FROM ( \
                     {ENTRY_SELECT_SQL} WHERE start < :old_start ORDER BY start DESC LIMIT 1 \
                 ) \
                 UNION \
                 SELECT * FROM ( \
                     {ENTRY_SELECT_SQL} WHERE start > :old_start ORDER BY start ASC LIMIT 1 \
                 ) \
                 ORDER BY start ASC"
            ),
            named_params! { ":new_start": new_start, ":old_start": old_start },
        )
    }

    fn entry_at(&self, start: i64) -> RepoResult<Vec<DerivedEntry>> {
        self.query_entries(&format!("{ENTRY_SELECT_SQL} WHERE start = ?1"), [start])
    }
}

fn insert_row(conn: &Connection, data: &SyncEntry) -> RepoResult<bool> {
    let start = data
        .start
        .ok_or_else(|| RepoError::InvalidData("tombstone record passed to insert".to_string()))?;

    let changed = conn.execute(
        "INSERT INTO timelog (uuid, start, category, comment, mtime) \
         VALUES (?1, ?2, ?3, ?4, ?5);",
        params![
            data.uuid.as_bytes().as_slice(),
            start,
            data.category.as_deref().unwrap_or_default(),
            data.comment.as_deref().unwrap_or_default(),
            data.mtime,
        ],
    )?;

    Ok(changed > 0)
}

fn remove_row(conn: &Connection, uuid: EntryId, mtime: i64) -> RepoResult<bool> {
    let had_live: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM timelog WHERE uuid = ?1);",
        [uuid.as_bytes().as_slice()],
        |row| row.get(0),
    )?;

    // The insert trigger deletes the live row; OR REPLACE bumps the mtime of
    // an older tombstone.
    let changed = conn.execute(
        "INSERT OR REPLACE INTO removed (uuid, mtime) VALUES (?1, ?2);",
        params![uuid.as_bytes().as_slice(), mtime],
    )?;

    Ok(changed > 0 && had_live)
}

fn edit_row(conn: &Connection, data: &SyncEntry, fields: FieldMask) -> RepoResult<bool> {
    let mut assignments = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if fields.contains(FieldMask::START_TIME) {
        let start = data.start.ok_or_else(|| {
            RepoError::InvalidData("start time edit without a start value".to_string())
        })?;
        assignments.push("start = ?");
        bind_values.push(Value::Integer(start));
    }
    if fields.contains(FieldMask::CATEGORY) {
        assignments.push("category = ?");
        bind_values.push(Value::Text(data.category.clone().unwrap_or_default()));
    }
    if fields.contains(FieldMask::COMMENT) {
        assignments.push("comment = ?");
        bind_values.push(Value::Text(data.comment.clone().unwrap_or_default()));
    }

    if assignments.is_empty() {
        return Err(RepoError::InvalidData(
            "edit with an empty field mask".to_string(),
        ));
    }

    bind_values.push(Value::Integer(data.mtime));
    bind_values.push(Value::Blob(data.uuid.as_bytes().to_vec()));

    let sql = format!(
        "UPDATE timelog SET {}, mtime = ? WHERE uuid = ?;",
        assignments.join(", ")
    );
    let changed = conn.execute(&sql, params_from_iter(bind_values))?;

    Ok(changed > 0)
}

fn collect_entries<P: Params>(
    conn: &Connection,
    sql: &str,
    bindings: P,
) -> RepoResult<Vec<DerivedEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(bindings)?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(parse_derived_row(row)?);
    }
    Ok(entries)
}

fn parse_derived_row(row: &Row<'_>) -> RepoResult<DerivedEntry> {
    Ok(DerivedEntry {
        uuid: parse_uuid_blob(row.get(0)?)?,
        start: row.get(1)?,
        category: row.get(2)?,
        comment: row.get(3)?,
        duration: row.get(4)?,
        preceding_start: row.get(5)?,
    })
}

fn parse_sync_row(row: &Row<'_>) -> RepoResult<SyncEntry> {
    Ok(SyncEntry {
        uuid: parse_uuid_blob(row.get(0)?)?,
        start: row.get(1)?,
        category: row.get(2)?,
        comment: row.get(3)?,
        mtime: row.get(4)?,
    })
}

fn parse_uuid_blob(bytes: Vec<u8>) -> RepoResult<Uuid> {
    Uuid::from_slice(&bytes)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid blob of {} bytes", bytes.len())))
}
