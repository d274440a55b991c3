use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::acquirer::AcquirerOptions;
use crate::migrate::DEFAULT_BUSY_TIMEOUT;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TermStoreConfig {
    #[serde(default)]
    pub store: StoreSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StoreSection {
    pub primary_db: Option<PathBuf>,
    pub replica_db: Option<PathBuf>,
    pub text_max_bytes: Option<usize>,
    pub max_insert_attempts: Option<usize>,
    pub busy_timeout_ms: Option<u64>,
}

impl TermStoreConfig {
    /// Acquirer tuning: env WBTERMS_TEXT_MAX_BYTES / WBTERMS_MAX_INSERT_ATTEMPTS > config > defaults.
    pub fn acquirer_options(&self) -> Result<AcquirerOptions> {
        self.acquirer_options_with_lookup(|key| env::var(key).ok())
    }

    pub fn acquirer_options_with_lookup<F>(&self, lookup_env: F) -> Result<AcquirerOptions>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AcquirerOptions::default();
        let text_max_bytes = match env_number(&lookup_env, "WBTERMS_TEXT_MAX_BYTES")? {
            Some(value) => value,
            None => self.store.text_max_bytes.unwrap_or(defaults.text_max_bytes),
        };
        let max_insert_attempts = match env_number(&lookup_env, "WBTERMS_MAX_INSERT_ATTEMPTS")? {
            Some(value) => value,
            None => self
                .store
                .max_insert_attempts
                .unwrap_or(defaults.max_insert_attempts),
        };

        if text_max_bytes == 0 {
            bail!("text_max_bytes must be greater than zero");
        }
        if max_insert_attempts == 0 {
            bail!("max_insert_attempts must be greater than zero");
        }
        Ok(AcquirerOptions {
            text_max_bytes,
            max_insert_attempts,
        })
    }

    pub fn busy_timeout(&self) -> Duration {
        self.store
            .busy_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BUSY_TIMEOUT)
    }
}

fn env_number<F>(lookup_env: &F, key: &str) -> Result<Option<usize>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup_env(key) else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .with_context(|| format!("{key} must be a non-negative integer, got '{trimmed}'"))
}

/// Load and parse a TermStoreConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<TermStoreConfig> {
    if !config_path.exists() {
        return Ok(TermStoreConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: TermStoreConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn render_default_config() -> String {
    "# wbterms term store configuration (materialized by `wbterms init`)\n\
     # Relative paths are resolved against the project root.\n\n\
     [store]\n\
     primary_db = \".wbterms/data/terms.db\"\n\
     # replica_db = \".wbterms/data/replica.db\"\n\
     text_max_bytes = 255\n\
     max_insert_attempts = 5\n\
     busy_timeout_ms = 5000\n"
        .to_string()
}
