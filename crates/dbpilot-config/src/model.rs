use std::path::PathBuf;

pub use dbpilot_common::DEFAULT_HISTORY_TABLE;
use dbpilot_common::{Error, Result, validate_identifier};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file to migrate. `None` means `<config dir>/data/dbpilot.db`.
    pub path: Option<PathBuf>,
    pub history_table: String,
    pub busy_timeout_ms: u64,
    /// Take the single-row migration lock around `migrate`.
    pub lock: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            history_table: DEFAULT_HISTORY_TABLE.to_string(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            lock: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.database.history_table)?;
        if self.log.level.trim().is_empty() {
            return Err(Error::Config("log.level cannot be empty".into()));
        }
        Ok(())
    }
}
