//! Effects configuration.
//!
//! Layered the usual way: defaults, then an optional JSON file, then
//! environment variables, then validation.
//!
//! | Variable                  | Field              |
//! |---------------------------|--------------------|
//! | `TETHER_FILE_DEBOUNCE_MS` | `file_debounce_ms` |
//! | `TETHER_SETTINGS_PATH`    | `settings_path`    |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::{Dependencies, Result, TetherError};

/// Environment variable overriding the file debounce window.
pub const ENV_FILE_DEBOUNCE_MS: &str = "TETHER_FILE_DEBOUNCE_MS";

/// Environment variable overriding the settings store location.
pub const ENV_SETTINGS_PATH: &str = "TETHER_SETTINGS_PATH";

const MAX_DEBOUNCE_MS: u64 = 60_000;

/// Tunables for the production persistence strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    /// Debounce window for file writes, in milliseconds
    pub file_debounce_ms: u64,
    /// Where the standard settings store persists itself; `None` keeps it in
    /// memory
    pub settings_path: Option<PathBuf>,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            file_debounce_ms: 1_000,
            settings_path: dirs::config_dir().map(|dir| dir.join("tether").join("settings.json")),
        }
    }
}

impl EffectsConfig {
    /// Load a configuration file. Missing fields keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|error| {
            TetherError::config(format!("failed to read {}: {error}", path.display()))
        })?;
        serde_json::from_str(&content)
            .map_err(|error| TetherError::config(format!("invalid JSON in {}: {error}", path.display())))
    }

    /// Apply environment overrides.
    pub fn merge_with_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(ENV_FILE_DEBOUNCE_MS) {
            self.file_debounce_ms = value.trim().parse().map_err(|_| {
                TetherError::config(format!("{ENV_FILE_DEBOUNCE_MS} must be an integer, got {value:?}"))
            })?;
        }
        if let Ok(value) = std::env::var(ENV_SETTINGS_PATH) {
            self.settings_path = if value.is_empty() {
                None
            } else {
                Some(PathBuf::from(value))
            };
        }
        Ok(())
    }

    /// Check invariants.
    pub fn validate(&self) -> Result<()> {
        if self.file_debounce_ms > MAX_DEBOUNCE_MS {
            return Err(TetherError::config(format!(
                "file_debounce_ms must be at most {MAX_DEBOUNCE_MS}, got {}",
                self.file_debounce_ms
            )));
        }
        Ok(())
    }

    /// Defaults, then environment, validated.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.merge_with_env()?;
        config.validate()?;
        Ok(config)
    }

    /// The configuration bound in the current dependency scope, or the
    /// environment-derived one.
    ///
    /// An invalid environment falls back to defaults with a warning.
    pub fn current() -> Self {
        if let Some(config) = Dependencies::current().value::<EffectsConfig>() {
            return config;
        }
        Self::from_env().unwrap_or_else(|error| {
            tracing::warn!(%error, "ignoring invalid environment configuration");
            Self::default()
        })
    }

    /// Debounce window as a duration.
    pub fn file_debounce(&self) -> Duration {
        Duration::from_millis(self.file_debounce_ms)
    }
}
