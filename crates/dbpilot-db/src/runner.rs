use std::fmt;

use chrono::{DateTime, Utc};
use dbpilot_common::{MigrationError, Result};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::history::HistoryStore;
use crate::lock::MigrationLock;
use crate::migrations::Migration;
use crate::registry::MigrationRegistry;

/// Where a single migration is in a run.
///
/// Success path: `Pending -> Applying -> Applied`.
/// Failure path: `Applying -> Failed -> RollingBack -> RolledBack | RollbackFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Pending,
    Applying,
    Applied,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
        };
        f.write_str(s)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Applied during this run, in order.
    pub applied: Vec<String>,
    /// Already in history before this run.
    pub skipped: Vec<String>,
}

impl RunReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub name: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// One entry per registered migration, in registry order.
    pub migrations: Vec<MigrationStatus>,
    /// History entries with no definition in this build.
    pub orphaned: Vec<String>,
}

impl StatusReport {
    pub fn pending(&self) -> impl Iterator<Item = &MigrationStatus> {
        self.migrations
            .iter()
            .filter(|m| m.state == MigrationState::Pending)
    }
}

/// Applies pending migrations strictly in registry order.
pub struct Runner<'a> {
    conn: &'a Connection,
    registry: &'a MigrationRegistry,
    history: HistoryStore<'a>,
    lock: bool,
}

impl<'a> Runner<'a> {
    pub fn new(conn: &'a Connection, registry: &'a MigrationRegistry) -> Self {
        Self {
            conn,
            registry,
            history: HistoryStore::new(conn),
            lock: false,
        }
    }

    pub fn with_history_table(mut self, table: &str) -> Result<Self> {
        self.history = HistoryStore::with_table(self.conn, table)?;
        Ok(self)
    }

    /// Hold a [`MigrationLock`] for the whole run.
    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    /// Registered migrations not yet in history, in registry order.
    pub fn pending(&self) -> Result<Vec<&'a dyn Migration>> {
        let applied = self.history.applied_names()?;
        Ok(self
            .registry
            .iter()
            .filter(|m| !applied.contains(m.name()))
            .collect())
    }

    /// Apply every pending migration, stopping at the first failure.
    pub fn apply(&self) -> Result<RunReport> {
        self.history.ensure_schema()?;
        let _lock = if self.lock {
            Some(MigrationLock::acquire(self.conn, self.history.table())?)
        } else {
            None
        };

        let applied = self.history.applied_names()?;
        let mut report = RunReport::default();

        for migration in self.registry.iter() {
            let name = migration.name();
            if applied.contains(name) {
                info!("skipping migration '{name}' as it was already applied");
                report.skipped.push(name.to_string());
                continue;
            }
            self.apply_one(migration)?;
            report.applied.push(name.to_string());
        }

        if report.is_noop() {
            info!("schema is up to date ({} migrations)", report.skipped.len());
        } else {
            info!("applied {} migration(s)", report.applied.len());
        }
        Ok(report)
    }

    fn apply_one(&self, migration: &dyn Migration) -> Result<()> {
        let name = migration.name();
        transition(name, MigrationState::Pending, MigrationState::Applying);
        info!("applying migration '{name}'");

        if let Err(cause) = migration.apply(self.conn) {
            transition(name, MigrationState::Applying, MigrationState::Failed);
            error!("failed to apply migration '{name}': {cause}");

            transition(name, MigrationState::Failed, MigrationState::RollingBack);
            let cleanup_error = match migration.revert(self.conn) {
                Ok(()) => {
                    transition(name, MigrationState::RollingBack, MigrationState::RolledBack);
                    None
                }
                Err(e) => {
                    transition(
                        name,
                        MigrationState::RollingBack,
                        MigrationState::RollbackFailed,
                    );
                    error!("failed to rollback migration '{name}': {e}");
                    Some(e.to_string())
                }
            };

            return Err(MigrationError::Apply {
                name: name.to_string(),
                cause: cause.to_string(),
                cleanup_error,
            }
            .into());
        }

        if let Err(e) = self.history.record(name) {
            error!("migration '{name}' applied but not recorded, manual repair required: {e}");
            return Err(MigrationError::HistoryWrite {
                name: name.to_string(),
                cause: e.to_string(),
            }
            .into());
        }

        transition(name, MigrationState::Applying, MigrationState::Applied);
        info!("successfully applied migration '{name}'");
        Ok(())
    }

    /// Applied/pending state of every registered migration. Read-only.
    pub fn status(&self) -> Result<StatusReport> {
        let history = self.history.history()?;
        let mut report = StatusReport::default();

        for migration in self.registry.iter() {
            let record = history.iter().find(|r| r.name == migration.name());
            report.migrations.push(MigrationStatus {
                name: migration.name().to_string(),
                state: if record.is_some() {
                    MigrationState::Applied
                } else {
                    MigrationState::Pending
                },
                applied_at: record.map(|r| r.applied_at),
            });
        }

        for record in &history {
            if !self.registry.contains(&record.name) {
                warn!(
                    "history contains '{}' which is not defined in this build",
                    record.name
                );
                report.orphaned.push(record.name.clone());
            }
        }
        Ok(report)
    }
}

fn transition(name: &str, from: MigrationState, to: MigrationState) {
    debug!(migration = name, %from, %to, "migration state change");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::open_in_memory;
    use crate::migrations::SqlMigration;
    use dbpilot_common::Error;

    fn registry() -> MigrationRegistry {
        MigrationRegistry::new(vec![
            Box::new(SqlMigration::new(
                "create_foo",
                "CREATE TABLE IF NOT EXISTS foo (id INTEGER PRIMARY KEY);",
                "DROP TABLE IF EXISTS foo;",
            )),
            Box::new(SqlMigration::new(
                "create_bar",
                "CREATE TABLE IF NOT EXISTS bar (id INTEGER PRIMARY KEY, code TEXT);",
                "DROP TABLE IF EXISTS bar;",
            )),
        ])
        .unwrap()
    }

    #[test]
    fn applies_all_pending_in_order() {
        let conn = open_in_memory().unwrap();
        let registry = registry();
        let report = Runner::new(&conn, &registry).apply().unwrap();

        assert_eq!(report.applied, ["create_foo", "create_bar"]);
        assert!(report.skipped.is_empty());
        assert!(Runner::new(&conn, &registry).pending().unwrap().is_empty());
    }

    #[test]
    fn second_run_is_a_noop() {
        let conn = open_in_memory().unwrap();
        let registry = registry();
        Runner::new(&conn, &registry).apply().unwrap();

        let report = Runner::new(&conn, &registry).apply().unwrap();
        assert!(report.is_noop());
        assert_eq!(report.skipped, ["create_foo", "create_bar"]);
    }

    #[test]
    fn pending_preserves_registry_order() {
        let conn = open_in_memory().unwrap();
        let registry = registry();
        let history = HistoryStore::new(&conn);
        history.ensure_schema().unwrap();
        history.record("create_bar").unwrap();

        let pending: Vec<_> = Runner::new(&conn, &registry)
            .pending()
            .unwrap()
            .into_iter()
            .map(|m| m.name())
            .collect();
        assert_eq!(pending, ["create_foo"]);
    }

    #[test]
    fn status_reports_applied_pending_and_orphans() {
        let conn = open_in_memory().unwrap();
        let registry = registry();
        let history = HistoryStore::new(&conn);
        history.ensure_schema().unwrap();
        history.record("create_foo").unwrap();
        history.record("dropped_long_ago").unwrap();

        let status = Runner::new(&conn, &registry).status().unwrap();
        assert_eq!(status.migrations.len(), 2);
        assert_eq!(status.migrations[0].state, MigrationState::Applied);
        assert!(status.migrations[0].applied_at.is_some());
        assert_eq!(status.migrations[1].state, MigrationState::Pending);
        assert_eq!(status.pending().count(), 1);
        assert_eq!(status.orphaned, ["dropped_long_ago"]);
    }

    #[test]
    fn failing_forward_aborts_with_apply_error() {
        let conn = open_in_memory().unwrap();
        let registry = MigrationRegistry::new(vec![
            Box::new(SqlMigration::new(
                "ok",
                "CREATE TABLE ok (id INTEGER);",
                "DROP TABLE IF EXISTS ok;",
            )),
            Box::new(SqlMigration::new(
                "broken",
                "CREATE TABLE half (id INTEGER); CREATE TABLEE nope;",
                "DROP TABLE IF EXISTS half;",
            )),
        ])
        .unwrap();

        let err = Runner::new(&conn, &registry).apply().unwrap_err();
        match err {
            Error::Migration(MigrationError::Apply {
                name,
                cleanup_error,
                ..
            }) => {
                assert_eq!(name, "broken");
                assert!(cleanup_error.is_none());
            }
            other => panic!("expected Apply, got: {other:?}"),
        }

        let half: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name = 'half'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(half, 0);
        let names = HistoryStore::new(&conn).applied_names().unwrap();
        assert!(names.contains("ok"));
        assert!(!names.contains("broken"));
    }

    #[test]
    fn locked_run_releases_lock_afterwards() {
        let conn = open_in_memory().unwrap();
        let registry = registry();
        Runner::new(&conn, &registry).with_lock(true).apply().unwrap();

        let held: i64 = conn
            .query_row("SELECT count(*) FROM migrations_lock", [], |row| row.get(0))
            .unwrap();
        assert_eq!(held, 0);
    }

    #[test]
    fn locked_run_fails_when_lock_is_held() {
        let conn = open_in_memory().unwrap();
        let registry = registry();
        let _held = MigrationLock::acquire(&conn, "migrations").unwrap();

        let err = Runner::new(&conn, &registry)
            .with_lock(true)
            .apply()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Migration(MigrationError::LockHeld { .. })
        ));
        assert!(HistoryStore::new(&conn).history().unwrap().is_empty());
    }

    #[test]
    fn custom_history_table() {
        let conn = open_in_memory().unwrap();
        let registry = registry();
        Runner::new(&conn, &registry)
            .with_history_table("schema_history")
            .unwrap()
            .apply()
            .unwrap();

        let history = HistoryStore::with_table(&conn, "schema_history").unwrap();
        assert_eq!(history.history().unwrap().len(), 2);
        assert!(!HistoryStore::new(&conn).exists().unwrap());
    }

    #[test]
    fn state_display_is_snake_case() {
        assert_eq!(MigrationState::RollingBack.to_string(), "rolling_back");
        assert_eq!(MigrationState::RollbackFailed.to_string(), "rollback_failed");
    }
}
