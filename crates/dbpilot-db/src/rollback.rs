use dbpilot_common::{MigrationError, Result};
use rusqlite::Connection;
use tracing::{error, info};

use crate::history::{HistoryStore, MigrationRecord};
use crate::lock::MigrationLock;
use crate::registry::MigrationRegistry;

/// Reverts the most recently applied migration, one step per call.
///
/// Uses the same registry as the [`Runner`](crate::Runner), so the revert
/// that runs here is exactly the one paired with the recorded forward action.
pub struct RollbackCommand<'a> {
    registry: &'a MigrationRegistry,
    conn: &'a Connection,
    history: HistoryStore<'a>,
    lock: bool,
}

impl<'a> RollbackCommand<'a> {
    pub fn new(conn: &'a Connection, registry: &'a MigrationRegistry) -> Self {
        Self {
            registry,
            conn,
            history: HistoryStore::new(conn),
            lock: false,
        }
    }

    pub fn with_history_table(mut self, table: &str) -> Result<Self> {
        self.history = HistoryStore::with_table(self.conn, table)?;
        Ok(self)
    }

    /// Hold the same [`MigrationLock`] a locked run takes.
    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    /// The record [`rollback`](Self::rollback) would revert, if any.
    ///
    /// Latest `applied_at` wins; on a tie the migration that comes last in
    /// registry order is taken.
    pub fn target(&self) -> Result<Option<MigrationRecord>> {
        let history = self.history.history()?;
        let Some(latest) = history.iter().map(|r| r.applied_at).max() else {
            return Ok(None);
        };

        Ok(history
            .into_iter()
            .filter(|r| r.applied_at == latest)
            .max_by_key(|r| self.registry.position(&r.name)))
    }

    /// Revert the latest migration and delete its record. Returns the record
    /// that was removed.
    pub fn rollback(&self) -> Result<MigrationRecord> {
        let _lock = if self.lock {
            Some(MigrationLock::acquire(self.conn, self.history.table())?)
        } else {
            None
        };

        let record = self
            .target()?
            .ok_or_else(|| MigrationError::NotFound("no migrations to rollback".into()))?;

        let migration = self.registry.get(&record.name).ok_or_else(|| {
            error!(
                "migration '{}' not found in this build, cannot roll back",
                record.name
            );
            MigrationError::UnknownDefinition {
                name: record.name.clone(),
            }
        })?;

        info!("rolling back migration '{}'", record.name);
        if let Err(e) = migration.revert(self.conn) {
            error!("failed to rollback migration '{}': {e}", record.name);
            return Err(MigrationError::Rollback {
                name: record.name.clone(),
                cause: e.to_string(),
            }
            .into());
        }

        if let Err(e) = self.history.remove(&record.name) {
            error!(
                "migration '{}' reverted but its record remains, manual repair required: {e}",
                record.name
            );
            return Err(MigrationError::HistoryWrite {
                name: record.name.clone(),
                cause: e.to_string(),
            }
            .into());
        }

        info!("successfully rolled back migration '{}'", record.name);
        Ok(record)
    }
}
