//! Application configuration management.
//!
//! This module handles loading the client configuration: the backend base
//! URL, the token issuer/audience/secret used to verify access tokens, and
//! where credentials are persisted.
//!
//! Configuration is stored at `~/.config/mealplan/config.json`. Every field
//! can be overridden from the environment (`MEALPLAN_*`).

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
const APP_NAME: &str = "mealplan";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_BASE_URL: &str = "https://api.mealplan.app";
const DEFAULT_TOKEN_ISSUER: &str = "mealplan-api";
const DEFAULT_TOKEN_AUDIENCE: &str = "mealplan-mobile";

/// Shared HS256 secret the backend signs access tokens with.
/// Shipping it in the client means it is not confidential; the backend
/// remains the authority on token validity.
const DEFAULT_TOKEN_SECRET: &str = "mealplan-shared-signing-secret";

const ENV_BASE_URL: &str = "MEALPLAN_BASE_URL";
const ENV_TOKEN_ISSUER: &str = "MEALPLAN_TOKEN_ISSUER";
const ENV_TOKEN_AUDIENCE: &str = "MEALPLAN_TOKEN_AUDIENCE";
const ENV_TOKEN_SECRET: &str = "MEALPLAN_TOKEN_SECRET";
const ENV_DEBUG_STORAGE: &str = "MEALPLAN_DEBUG_STORAGE";
const ENV_DATA_DIR: &str = "MEALPLAN_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub token_issuer: String,
    pub token_audience: String,
    pub token_secret: String,
    /// Use the unencrypted `debug` credential namespace.
    /// Defaults to on for debug builds.
    pub debug_storage: bool,
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token_issuer: DEFAULT_TOKEN_ISSUER.to_string(),
            token_audience: DEFAULT_TOKEN_AUDIENCE.to_string(),
            token_secret: DEFAULT_TOKEN_SECRET.to_string(),
            debug_storage: cfg!(debug_assertions),
            data_dir: None,
        }
    }
}

impl Config {
    /// Load the config file (or defaults) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup(ENV_BASE_URL) {
            self.base_url = value;
        }
        if let Some(value) = lookup(ENV_TOKEN_ISSUER) {
            self.token_issuer = value;
        }
        if let Some(value) = lookup(ENV_TOKEN_AUDIENCE) {
            self.token_audience = value;
        }
        if let Some(value) = lookup(ENV_TOKEN_SECRET) {
            self.token_secret = value;
        }
        if let Some(value) = lookup(ENV_DEBUG_STORAGE) {
            self.debug_storage = matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(value) = lookup(ENV_DATA_DIR) {
            self.data_dir = Some(PathBuf::from(value));
        }
        self
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding persisted credentials and logs.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}
