pub mod connection;
pub mod history;
pub mod lock;
pub mod migrations;
pub mod registry;
pub mod relation;
pub mod rollback;
pub mod runner;
pub mod schema;

pub use rusqlite;

pub use connection::{open_database, open_in_memory};
pub use history::{HistoryStore, MigrationRecord};
pub use lock::MigrationLock;
pub use migrations::{Migration, SqlMigration};
pub use registry::MigrationRegistry;
pub use relation::SymmetricPairIndex;
pub use rollback::RollbackCommand;
pub use runner::{MigrationState, MigrationStatus, RunReport, Runner, StatusReport};

use dbpilot_common::Result;
use rusqlite::Connection;

/// Apply every pending built-in migration. Called once at startup, before
/// the service accepts traffic; any error must stop the startup.
pub fn run_migrations(conn: &Connection) -> Result<RunReport> {
    let registry = schema::registry()?;
    Runner::new(conn, &registry).apply()
}

/// Applied migrations in application order. Read-only.
pub fn get_migration_history(conn: &Connection) -> Result<Vec<MigrationRecord>> {
    HistoryStore::new(conn).history()
}

/// Revert the most recently applied built-in migration. Operator action only.
pub fn rollback_last_migration(conn: &Connection) -> Result<MigrationRecord> {
    let registry = schema::registry()?;
    RollbackCommand::new(conn, &registry).rollback()
}
