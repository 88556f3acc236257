use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use dbpilot_common::{Error, MigrationError};
use dbpilot_config::DatabaseConfig;
use dbpilot_db::rusqlite::Connection;
use dbpilot_db::{
    HistoryStore, MigrationLock, MigrationRecord, MigrationRegistry, RollbackCommand, Runner,
    schema,
};
use tracing::{info, warn};

pub fn open(db_path: &Path, config: &DatabaseConfig) -> Result<Connection> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let conn = dbpilot_db::open_database(db_path, Duration::from_millis(config.busy_timeout_ms))?;
    Ok(conn)
}

fn registry() -> Result<MigrationRegistry> {
    schema::registry().context("invalid built-in migration registry")
}

pub fn migrate(conn: &Connection, config: &DatabaseConfig) -> Result<()> {
    let registry = registry()?;
    let report = Runner::new(conn, &registry)
        .with_history_table(&config.history_table)?
        .with_lock(config.lock)
        .apply()
        .map_err(explain)?;

    if report.is_noop() {
        println!("Schema is up to date.");
    } else {
        println!("Applied {} migration(s).", report.applied.len());
    }

    // Startup continues on a failed listing; the schema itself is fine.
    match HistoryStore::with_table(conn, &config.history_table)?.history() {
        Ok(records) => print_history(&records),
        Err(e) => warn!("failed to get migration history: {e}"),
    }
    Ok(())
}

pub fn history(conn: &Connection, config: &DatabaseConfig, json: bool) -> Result<()> {
    let records = HistoryStore::with_table(conn, &config.history_table)?.history()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_history(&records);
    }
    Ok(())
}

pub fn status(conn: &Connection, config: &DatabaseConfig, json: bool) -> Result<()> {
    let registry = registry()?;
    let report = Runner::new(conn, &registry)
        .with_history_table(&config.history_table)?
        .status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for migration in &report.migrations {
        match migration.applied_at {
            Some(at) => println!("  [x] {} (applied at: {at})", migration.name),
            None => println!("  [ ] {}", migration.name),
        }
    }
    for name in &report.orphaned {
        println!("  [?] {name} (not defined in this build)");
    }
    Ok(())
}

pub fn rollback(conn: &Connection, config: &DatabaseConfig) -> Result<()> {
    let registry = registry()?;
    let removed = RollbackCommand::new(conn, &registry)
        .with_history_table(&config.history_table)?
        .with_lock(config.lock)
        .rollback()
        .map_err(explain)?;

    println!("Rolled back '{}'.", removed.name);
    Ok(())
}

pub fn unlock(conn: &Connection, config: &DatabaseConfig) -> Result<()> {
    if MigrationLock::force_release(conn, &config.history_table)? {
        info!("migration lock cleared");
        println!("Migration lock cleared.");
    } else {
        println!("No migration lock held.");
    }
    Ok(())
}

fn print_history(records: &[MigrationRecord]) {
    if records.is_empty() {
        println!("No migrations applied.");
        return;
    }
    println!("Applied migrations:");
    for record in records {
        println!("- {} (applied at: {})", record.name, record.applied_at);
    }
}

/// Attach operator guidance to errors that must not be retried blindly.
fn explain(err: Error) -> anyhow::Error {
    let hint = match &err {
        Error::Migration(e) if e.requires_operator() => Some(match e {
            MigrationError::HistoryWrite { .. } => {
                "the schema and the history table disagree; verify the change by hand and fix the history row before running again"
            }
            MigrationError::UnknownDefinition { .. } => {
                "history references a migration this binary does not know; use the build that applied it"
            }
            _ => "the database may be partially reverted; inspect it before retrying",
        }),
        _ => None,
    };

    match hint {
        Some(hint) => {
            anyhow::Error::new(err).context(format!("manual intervention required: {hint}"))
        }
        None => anyhow::Error::new(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explain_flags_operator_errors() {
        let err = explain(
            MigrationError::HistoryWrite {
                name: "m1".into(),
                cause: "disk full".into(),
            }
            .into(),
        );
        assert!(err.to_string().starts_with("manual intervention required"));

        let err = explain(MigrationError::NotFound("empty".into()).into());
        assert!(!err.to_string().contains("manual intervention"));
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dbpilot.db");

        let conn = open(&path, &DatabaseConfig::default()).unwrap();
        migrate(&conn, &DatabaseConfig::default()).unwrap();
        drop(conn);

        assert!(path.exists());
    }

    #[test]
    fn rollback_without_history_fails() {
        let conn = dbpilot_db::open_in_memory().unwrap();
        let err = rollback(&conn, &DatabaseConfig::default()).unwrap_err();
        assert!(err.to_string().contains("no migrations to rollback"));
    }

    #[test]
    fn locked_rollback_waits_for_held_lock() {
        let conn = dbpilot_db::open_in_memory().unwrap();
        let config = DatabaseConfig {
            lock: true,
            ..DatabaseConfig::default()
        };
        migrate(&conn, &config).unwrap();

        let held = MigrationLock::acquire(&conn, &config.history_table).unwrap();
        let err = rollback(&conn, &config).unwrap_err();
        assert!(err.to_string().contains("migration lock is held"));
        assert_eq!(HistoryStore::new(&conn).history().unwrap().len(), 3);

        drop(held);
        rollback(&conn, &config).unwrap();
        assert_eq!(HistoryStore::new(&conn).history().unwrap().len(), 2);
    }

    #[test]
    fn unlock_is_harmless_without_lock() {
        let conn = dbpilot_db::open_in_memory().unwrap();
        unlock(&conn, &DatabaseConfig::default()).unwrap();
    }

    #[test]
    fn migrate_then_rollback_round() {
        let conn = dbpilot_db::open_in_memory().unwrap();
        let config = DatabaseConfig::default();
        migrate(&conn, &config).unwrap();
        rollback(&conn, &config).unwrap();

        let records = HistoryStore::new(&conn).history().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn repeated_migrate_then_status() {
        let conn = dbpilot_db::open_in_memory().unwrap();
        let config = DatabaseConfig::default();
        migrate(&conn, &config).unwrap();
        migrate(&conn, &config).unwrap();
        status(&conn, &config, true).unwrap();
    }
}
