use chrono::Utc;
use dbpilot_common::{Error, MigrationError, Result};
use rusqlite::{Connection, ErrorCode, params};
use tracing::{info, warn};
use uuid::Uuid;

use crate::history::format_timestamp;

/// Advisory lock held for the duration of a migration run.
///
/// Backed by a single-row table next to the history table, so two processes
/// sharing one database cannot apply the same pending set at once. Released
/// when dropped. A process that dies while holding it leaves the row behind;
/// an operator clears it with [`MigrationLock::force_release`].
pub struct MigrationLock<'c> {
    conn: &'c Connection,
    table: String,
    holder: String,
}

impl<'c> MigrationLock<'c> {
    pub fn acquire(conn: &'c Connection, history_table: &str) -> Result<Self> {
        let table = lock_table(history_table);
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            );"
        ))
        .map_err(|e| Error::Database(format!("failed to create lock table: {e}")))?;

        let holder = Uuid::new_v4().to_string();
        let inserted = conn.execute(
            &format!("INSERT INTO {table} (id, holder, acquired_at) VALUES (1, ?1, ?2)"),
            params![holder, format_timestamp(&Utc::now())],
        );

        match inserted {
            Ok(_) => {
                info!("acquired migration lock {holder}");
                Ok(Self {
                    conn,
                    table,
                    holder,
                })
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                let (holder, acquired_at): (String, String) = conn
                    .query_row(
                        &format!("SELECT holder, acquired_at FROM {table} WHERE id = 1"),
                        [],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .map_err(|e| Error::Database(format!("failed to read lock holder: {e}")))?;
                Err(MigrationError::LockHeld {
                    holder,
                    acquired_at,
                }
                .into())
            }
            Err(e) => Err(Error::Database(format!(
                "failed to acquire migration lock: {e}"
            ))),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Clear a lock left behind by a crashed process. Returns whether a lock
    /// row was present.
    pub fn force_release(conn: &Connection, history_table: &str) -> Result<bool> {
        let table = lock_table(history_table);
        let exists: bool = conn
            .query_row(
                "SELECT count(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                params![table],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to check lock table: {e}")))?;
        if !exists {
            return Ok(false);
        }

        let deleted = conn
            .execute(&format!("DELETE FROM {table} WHERE id = 1"), [])
            .map_err(|e| Error::Database(format!("failed to clear migration lock: {e}")))?;
        Ok(deleted > 0)
    }
}

impl Drop for MigrationLock<'_> {
    fn drop(&mut self) {
        let released = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = 1 AND holder = ?1", self.table),
            params![self.holder],
        );
        match released {
            Ok(_) => info!("released migration lock {}", self.holder),
            Err(e) => warn!("failed to release migration lock {}: {e}", self.holder),
        }
    }
}

fn lock_table(history_table: &str) -> String {
    format!("{history_table}_lock")
}
