// Docrate configuration
// Secrets live in a JSON file outside the deployable unit, never in the repo
// and never in the database. Loaded once at startup and passed around by
// reference.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use serde_json::Value;

use crate::constants::{
    CONFIG_DATABASE_PATH, CONFIG_ENVIRONMENT, CONFIG_LOCK_TTL, DB_FILENAME,
    DEFAULT_ENVIRONMENT, DEFAULT_LOCK_TTL_SECONDS, DOCRATE_FOLDER, SECRETS_FILENAME,
    SECRETS_FILE_ENV, SECRETS_SUBFOLDER,
};
use crate::error::{DocrateError, Result};

#[derive(Debug, Clone, Default)]
pub struct Config {
    values: BTreeMap<String, Value>,
    source: Option<PathBuf>,
}

impl Config {
    /// Load from `DOCRATE_SECRETS_FILE`, falling back to
    /// `~/.docrate/private/docrate-secrets.json`.
    pub fn load() -> Result<Self> {
        let path = match std::env::var_os(SECRETS_FILE_ENV) {
            Some(p) => PathBuf::from(p),
            None => default_secrets_path()?,
        };
        Self::from_file(&path)
    }

    /// Load from an explicit file. A missing file is an empty config.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No secrets file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
            DocrateError::Config(format!("Invalid secrets file {}: {}", path.display(), e))
        })?;

        let values = match parsed {
            Value::Object(map) => map.into_iter().collect(),
            _ => {
                return Err(DocrateError::Config(format!(
                    "Secrets file {} must contain a JSON object",
                    path.display()
                )))
            }
        };

        Ok(Self {
            values,
            source: Some(path.to_path_buf()),
        })
    }

    pub fn from_values(values: BTreeMap<String, Value>) -> Self {
        Self { values, source: None }
    }

    /// String value for a key. Numbers and booleans are rendered as text.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn environment(&self) -> String {
        self.get(CONFIG_ENVIRONMENT)
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())
    }

    pub fn is_staging(&self) -> bool {
        self.environment() == "staging"
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match self.get(CONFIG_DATABASE_PATH) {
            Some(p) => Ok(PathBuf::from(p)),
            None => Ok(docrate_home()?.join(DB_FILENAME)),
        }
    }

    pub fn lock_ttl_seconds(&self) -> i64 {
        self.get(CONFIG_LOCK_TTL)
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|ttl| *ttl > 0)
            .unwrap_or(DEFAULT_LOCK_TTL_SECONDS)
    }
}

fn docrate_home() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| DocrateError::Config("Could not determine home directory".to_string()))?;
    Ok(home.home_dir().join(DOCRATE_FOLDER))
}

fn default_secrets_path() -> Result<PathBuf> {
    Ok(docrate_home()?.join(SECRETS_SUBFOLDER).join(SECRETS_FILENAME))
}
