pub mod error;
pub mod ident;

pub use error::{Error, MigrationError, Result};
pub use ident::validate_identifier;

/// Name of the history table when none is configured.
pub const DEFAULT_HISTORY_TABLE: &str = "migrations";
