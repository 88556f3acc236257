use dbpilot_common::{Error, Result};
use rusqlite::Connection;

/// A named, reversible schema change.
///
/// `apply` moves the schema forward, `revert` undoes it. The name is the
/// stable identity recorded in the history table and must never change once
/// a migration has shipped.
pub trait Migration: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, conn: &Connection) -> Result<()>;

    fn revert(&self, conn: &Connection) -> Result<()>;
}

/// Migration backed by two SQL batches.
///
/// `up` should be safe to run against a database where it already took
/// effect (`IF NOT EXISTS`), since a failed history write leaves the change
/// unrecorded and the next run will execute it again.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    name: String,
    up: String,
    down: String,
}

impl SqlMigration {
    pub fn new(name: impl Into<String>, up: impl Into<String>, down: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up: up.into(),
            down: down.into(),
        }
    }
}

impl Migration for SqlMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&self.up)
            .map_err(|e| Error::Database(format!("failed to apply '{}': {e}", self.name)))
    }

    fn revert(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&self.down)
            .map_err(|e| Error::Database(format!("failed to revert '{}': {e}", self.name)))
    }
}
