//! Store settings that drive filtering and count caching

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LOOKUP_TABLE: &str = "wc_product_attributes_lookup";

/// One day, the lifetime of cached layered navigation counts
pub const DEFAULT_COUNT_CACHE_TTL_SECS: u64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid table name '{0}': expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidTableName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Filter through the lookup table instead of term relationships
    pub use_lookup_table: bool,
    pub hide_out_of_stock: bool,
    /// Keep layered navigation counts in transients
    pub cache_counts: bool,
    pub count_cache_ttl_secs: u64,
    pub lookup_table: String,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            use_lookup_table: true,
            hide_out_of_stock: false,
            cache_counts: true,
            count_cache_ttl_secs: DEFAULT_COUNT_CACHE_TTL_SECS,
            lookup_table: DEFAULT_LOOKUP_TABLE.to_string(),
        }
    }
}

impl FilterSettings {
    /// Load settings from a JSON file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: FilterSettings =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `path` when given, else use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_table_name(&self.lookup_table)
    }

    pub fn count_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.count_cache_ttl_secs)
    }
}

/// Table names are spliced into SQL text, so only plain identifiers pass.
pub fn validate_table_name(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidTableName(name.to_string()))
    }
}
