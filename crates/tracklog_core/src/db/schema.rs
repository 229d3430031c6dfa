//! Schema lifecycle for the history database.
//!
//! # Responsibility
//! - Bring a raw connection up to the schema this build expects.
//! - Refuse databases stamped by a newer build instead of guessing.
//!
//! # Invariants
//! - A step's version is its position in [`SCHEMA_STEPS`]; ordering is
//!   structural, never declared.
//! - `PRAGMA user_version` is stamped once, after every pending step landed
//!   in the same transaction.

use crate::db::{DbError, DbResult};
use rusqlite::Connection;

/// Ordered schema steps. Step `N` (1-based) brings a database stamped `N-1`
/// to `N`; appending to this array is the only way to evolve the schema.
const SCHEMA_STEPS: &[&str] = &[
    include_str!("sql/tables.sql"),
    include_str!("sql/triggers.sql"),
];

/// Schema version this build reads and writes.
pub fn schema_version() -> u32 {
    SCHEMA_STEPS.len() as u32
}

/// Runs every schema step the database has not seen yet.
///
/// Pending steps and the final version stamp share one transaction, so an
/// interrupted upgrade leaves the old stamp and reruns cleanly.
pub fn ensure_schema(conn: &mut Connection) -> DbResult<()> {
    let stamped = stamped_version(conn)?;
    let supported = schema_version();

    if stamped > supported {
        return Err(DbError::SchemaTooNew { stamped, supported });
    }
    if stamped == supported {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for step in &SCHEMA_STEPS[stamped as usize..] {
        tx.execute_batch(step)?;
    }
    tx.execute_batch(&format!("PRAGMA user_version = {supported};"))?;
    tx.commit()?;

    Ok(())
}

fn stamped_version(conn: &Connection) -> DbResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::{ensure_schema, schema_version, stamped_version, SCHEMA_STEPS};
    use rusqlite::Connection;

    fn trigger_count(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'trigger';",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn pending_steps_resume_from_the_stamped_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        // A database left behind by a build that only knew the tables step.
        conn.execute_batch(SCHEMA_STEPS[0]).unwrap();
        conn.execute_batch("PRAGMA user_version = 1;").unwrap();
        assert_eq!(trigger_count(&conn), 0);

        ensure_schema(&mut conn).unwrap();

        assert_eq!(stamped_version(&conn).unwrap(), schema_version());
        assert!(trigger_count(&conn) > 0);
    }

    #[test]
    fn ensure_schema_is_a_no_op_when_already_current() {
        let mut conn = Connection::open_in_memory().unwrap();
        ensure_schema(&mut conn).unwrap();
        let triggers = trigger_count(&conn);

        ensure_schema(&mut conn).unwrap();

        assert_eq!(stamped_version(&conn).unwrap(), schema_version());
        assert_eq!(trigger_count(&conn), triggers);
    }
}
