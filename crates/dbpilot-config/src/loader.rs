use std::path::{Path, PathBuf};

use dbpilot_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_DIR_NAME: &str = ".dbpilot";
const CANDIDATE_FILES: &[&str] = &["config.yml", "config.yaml", "config.toml"];

/// Resolves and parses the dbpilot configuration file.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_dir: home.join(CONFIG_DIR_NAME),
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Default location of the SQLite file when the config names none.
    pub fn default_database_path(&self) -> PathBuf {
        self.config_dir.join("data").join("dbpilot.db")
    }

    /// Load the first config file found in the config directory, or the
    /// defaults when there is none.
    pub fn load(&self) -> Result<AppConfig> {
        for name in CANDIDATE_FILES {
            let path = self.config_dir.join(name);
            if path.is_file() {
                return load_file(&path);
            }
        }
        debug!(
            "no config file in {}, using defaults",
            self.config_dir.display()
        );
        Ok(AppConfig::default())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a config file, picking the format from its extension.
pub fn load_file(path: &Path) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let config: AppConfig = match ext {
        "yml" | "yaml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("YAML parse error: {e}")))?,
        "toml" => {
            toml::from_str(&contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))?
        }
        other => {
            return Err(Error::Config(format!(
                "unsupported config extension: {other}"
            )));
        }
    };

    config.validate()?;
    info!("loaded config from {}", path.display());
    Ok(config)
}
