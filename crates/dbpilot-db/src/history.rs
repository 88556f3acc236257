use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use dbpilot_common::{Error, MigrationError, Result, validate_identifier};
pub use dbpilot_common::DEFAULT_HISTORY_TABLE;
use rusqlite::{Connection, OptionalExtension, ffi, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Proof that a migration's forward action completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// Durable record of applied migrations. The only source of truth for
/// whether a migration has already run.
pub struct HistoryStore<'c> {
    conn: &'c Connection,
    table: String,
}

impl<'c> HistoryStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            table: DEFAULT_HISTORY_TABLE.to_string(),
        }
    }

    pub fn with_table(conn: &'c Connection, table: &str) -> Result<Self> {
        validate_identifier(table)?;
        Ok(Self {
            conn,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the history table if it does not exist yet. Safe on every start.
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    applied_at TEXT NOT NULL
                );",
                table = self.table
            ))
            .map_err(|e| Error::Database(format!("failed to create history table: {e}")))
    }

    pub fn exists(&self) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT count(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                params![self.table],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to check history table: {e}")))
    }

    pub fn applied_names(&self) -> Result<HashSet<String>> {
        if !self.exists()? {
            return Ok(HashSet::new());
        }

        let mut stmt = self
            .conn
            .prepare(&format!("SELECT name FROM {}", self.table))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Database(format!("failed to query applied migrations: {e}")))?;

        rows.collect::<std::result::Result<HashSet<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read history row: {e}")))
    }

    /// Record `name` as applied now.
    ///
    /// `applied_at` is kept strictly increasing: if the clock has not moved
    /// past the newest record, the new record lands one microsecond after it.
    pub fn record(&self, name: &str) -> Result<MigrationRecord> {
        if self.get(name)?.is_some() {
            return Err(MigrationError::DuplicateRecord {
                name: name.to_string(),
            }
            .into());
        }

        let applied_at = self.next_timestamp()?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {} (name, applied_at) VALUES (?1, ?2)",
                    self.table
                ),
                params![name, format_timestamp(&applied_at)],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
                {
                    Error::from(MigrationError::DuplicateRecord {
                        name: name.to_string(),
                    })
                }
                e => Error::Database(format!("failed to record migration: {e}")),
            })?;

        debug!("recorded migration '{name}' at {applied_at}");
        Ok(MigrationRecord {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
            applied_at,
        })
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let deleted = self
            .conn
            .execute(
                &format!("DELETE FROM {} WHERE name = ?1", self.table),
                params![name],
            )
            .map_err(|e| Error::Database(format!("failed to delete migration history: {e}")))?;

        if deleted == 0 {
            return Err(MigrationError::NotFound(format!("no record for '{name}'")).into());
        }
        debug!("removed migration record '{name}'");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<MigrationRecord>> {
        if !self.exists()? {
            return Ok(None);
        }

        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, name, applied_at FROM {} WHERE name = ?1",
                    self.table
                ),
                params![name],
                read_row,
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to query migration: {e}")))?;

        row.map(into_record).transpose()
    }

    /// All records, oldest first.
    ///
    /// Sorted on the parsed instant: hand-written rows may use another
    /// offset or SQLite's `datetime('now')` form, which do not order as text.
    pub fn history(&self) -> Result<Vec<MigrationRecord>> {
        if !self.exists()? {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id, name, applied_at FROM {}", self.table))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], read_row)
            .map_err(|e| Error::Database(format!("failed to query history: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            let row = row.map_err(|e| Error::Database(format!("failed to read history row: {e}")))?;
            records.push(into_record(row)?);
        }
        records.sort_by_key(|r| (r.applied_at, r.id));
        Ok(records)
    }

    fn next_timestamp(&self) -> Result<DateTime<Utc>> {
        let now = Utc::now().trunc_subsecs(6);
        let latest = self.history()?.into_iter().map(|r| r.applied_at).max();

        match latest {
            Some(latest) if now <= latest => Ok(latest + Duration::microseconds(1)),
            _ => Ok(now),
        }
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn into_record((id, name, applied_at): (i64, String, String)) -> Result<MigrationRecord> {
    Ok(MigrationRecord {
        id,
        name,
        applied_at: parse_timestamp(&applied_at)?,
    })
}

/// Fixed-width RFC 3339 in UTC with microseconds.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite datetime('now') produces "YYYY-MM-DD HH:MM:SS"
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|naive| naive.and_utc())
        })
        .map_err(|e| Error::Database(format!("invalid applied_at '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::open_in_memory;

    fn store(conn: &Connection) -> HistoryStore<'_> {
        let store = HistoryStore::new(conn);
        store.ensure_schema().unwrap();
        store
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let conn = open_in_memory().unwrap();
        let history = HistoryStore::new(&conn);
        assert!(!history.exists().unwrap());

        history.ensure_schema().unwrap();
        history.record("m1").unwrap();
        history.ensure_schema().unwrap();

        assert!(history.exists().unwrap());
        assert_eq!(history.history().unwrap().len(), 1);
    }

    #[test]
    fn reads_are_empty_before_schema_exists() {
        let conn = open_in_memory().unwrap();
        let history = HistoryStore::new(&conn);
        assert!(history.applied_names().unwrap().is_empty());
        assert!(history.history().unwrap().is_empty());
        assert!(history.get("m1").unwrap().is_none());
        assert!(!history.exists().unwrap());
    }

    #[test]
    fn record_and_list_applied_names() {
        let conn = open_in_memory().unwrap();
        let history = store(&conn);
        history.record("m1").unwrap();
        history.record("m2").unwrap();

        let names = history.applied_names().unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.contains("m1"));
        assert!(names.contains("m2"));
    }

    #[test]
    fn duplicate_record_is_rejected() {
        let conn = open_in_memory().unwrap();
        let history = store(&conn);
        history.record("m1").unwrap();

        match history.record("m1").unwrap_err() {
            Error::Migration(MigrationError::DuplicateRecord { name }) => assert_eq!(name, "m1"),
            other => panic!("expected DuplicateRecord, got: {other:?}"),
        }
        assert_eq!(history.history().unwrap().len(), 1);
    }

    #[test]
    fn remove_missing_record_is_not_found() {
        let conn = open_in_memory().unwrap();
        let history = store(&conn);
        history.record("m1").unwrap();
        history.remove("m1").unwrap();

        assert!(history.applied_names().unwrap().is_empty());
        assert!(matches!(
            history.remove("m1").unwrap_err(),
            Error::Migration(MigrationError::NotFound(_))
        ));
    }

    #[test]
    fn timestamps_strictly_increase() {
        let conn = open_in_memory().unwrap();
        let history = store(&conn);
        for i in 0..20 {
            history.record(&format!("m{i}")).unwrap();
        }

        let records = history.history().unwrap();
        for pair in records.windows(2) {
            assert!(pair[0].applied_at < pair[1].applied_at);
        }
    }

    #[test]
    fn record_after_future_timestamp_still_increases() {
        let conn = open_in_memory().unwrap();
        let history = store(&conn);
        let future = Utc::now().trunc_subsecs(6) + Duration::hours(1);
        conn.execute(
            "INSERT INTO migrations (name, applied_at) VALUES ('clock_skew', ?1)",
            params![format_timestamp(&future)],
        )
        .unwrap();

        let record = history.record("after").unwrap();
        assert_eq!(record.applied_at, future + Duration::microseconds(1));
    }

    #[test]
    fn history_is_ordered_by_applied_at_not_row_order() {
        let conn = open_in_memory().unwrap();
        let history = store(&conn);
        conn.execute_batch(
            "INSERT INTO migrations (name, applied_at) VALUES ('late', '2024-03-01T00:00:00.000000Z');
             INSERT INTO migrations (name, applied_at) VALUES ('early', '2024-01-01T00:00:00.000000Z');
             INSERT INTO migrations (name, applied_at) VALUES ('middle', '2024-02-01T00:00:00.000000Z');",
        )
        .unwrap();

        let names: Vec<_> = history
            .history()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, ["early", "middle", "late"]);
    }

    fn names(history: &HistoryStore<'_>) -> Vec<String> {
        history
            .history()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect()
    }

    #[test]
    fn history_orders_mixed_formats_by_instant() {
        let conn = open_in_memory().unwrap();
        let history = store(&conn);
        conn.execute_batch(
            "INSERT INTO migrations (name, applied_at) VALUES ('first', '2024-05-06T01:00:00.000000Z');
             INSERT INTO migrations (name, applied_at) VALUES ('second', '2024-05-06 07:08:09');",
        )
        .unwrap();
        assert_eq!(names(&history), ["first", "second"]);
    }

    #[test]
    fn history_orders_offset_timestamps_by_instant() {
        let conn = open_in_memory().unwrap();
        let history = store(&conn);
        // 10:00+09:00 is 01:00Z, four hours before 'second'.
        conn.execute_batch(
            "INSERT INTO migrations (name, applied_at) VALUES ('first', '2024-01-01T10:00:00+09:00');
             INSERT INTO migrations (name, applied_at) VALUES ('second', '2024-01-01T05:00:00.000000Z');",
        )
        .unwrap();
        assert_eq!(names(&history), ["first", "second"]);
    }

    #[test]
    fn record_follows_latest_instant_not_latest_text() {
        let conn = open_in_memory().unwrap();
        let history = store(&conn);
        let future = Utc::now().trunc_subsecs(6) + Duration::hours(2);
        // Sorts below any 'T' form as text, but is the newest instant.
        let sqlite_form = future.format("%Y-%m-%d %H:%M:%S").to_string();
        conn.execute_batch(&format!(
            "INSERT INTO migrations (name, applied_at) VALUES ('skewed', '{sqlite_form}');
             INSERT INTO migrations (name, applied_at) VALUES ('old', '2024-01-01T00:00:00.000000Z');"
        ))
        .unwrap();

        let record = history.record("next").unwrap();
        assert_eq!(
            record.applied_at,
            future.trunc_subsecs(0) + Duration::microseconds(1)
        );
        assert_eq!(names(&history), ["old", "skewed", "next"]);
    }

    #[test]
    fn parses_sqlite_datetime_format() {
        let ts = parse_timestamp("2024-05-06 07:08:09").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-05-06T07:08:09.000000Z");
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn custom_table_name() {
        let conn = open_in_memory().unwrap();
        let history = HistoryStore::with_table(&conn, "schema_history").unwrap();
        history.ensure_schema().unwrap();
        history.record("m1").unwrap();

        let count: i64 = conn
            .query_row("SELECT count(*) FROM schema_history", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert!(HistoryStore::with_table(&conn, "bad table").is_err());
        assert_eq!(HistoryStore::new(&conn).table(), DEFAULT_HISTORY_TABLE);
    }
}
