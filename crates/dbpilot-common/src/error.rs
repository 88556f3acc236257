use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Failures raised by the migration engine.
///
/// Every variant is terminal to the operation that produced it; the engine
/// never continues past one.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("duplicate migration definition '{name}'")]
    DuplicateDefinition { name: String },

    #[error("migration '{name}' failed: {cause}")]
    Apply {
        name: String,
        cause: String,
        /// Set when the best-effort revert after the failure also failed.
        cleanup_error: Option<String>,
    },

    #[error("failed to roll back migration '{name}': {cause}")]
    Rollback { name: String, cause: String },

    #[error("migration '{name}' changed the schema but its history could not be written: {cause}")]
    HistoryWrite { name: String, cause: String },

    #[error("migration '{name}' is already recorded as applied")]
    DuplicateRecord { name: String },

    #[error("no migration history found: {0}")]
    NotFound(String),

    #[error("migration '{name}' is recorded in history but not defined in this build")]
    UnknownDefinition { name: String },

    #[error("migration lock is held by {holder} since {acquired_at}")]
    LockHeld { holder: String, acquired_at: String },
}

impl MigrationError {
    /// Whether an operator has to inspect the database before anything is
    /// retried. Blind retries here risk re-running a half-applied change.
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            Self::Rollback { .. } | Self::HistoryWrite { .. } | Self::UnknownDefinition { .. }
        )
    }

    pub fn migration_name(&self) -> Option<&str> {
        match self {
            Self::DuplicateDefinition { name }
            | Self::Apply { name, .. }
            | Self::Rollback { name, .. }
            | Self::HistoryWrite { name, .. }
            | Self::DuplicateRecord { name }
            | Self::UnknownDefinition { name } => Some(name),
            Self::NotFound(_) | Self::LockHeld { .. } => None,
        }
    }
}
