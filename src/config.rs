//! Application configuration.
//!
//! [`AppConfig`] can be built in code, deserialized from JSON, and adjusted from
//! the environment:
//!
//! | Variable       | Field   | Accepted values                          |
//! |----------------|---------|------------------------------------------|
//! | `BLAZE_DEBUG`  | `debug` | `1`/`true`/`yes`/`on`, `0`/`false`/`no`/`off` |
//! | `BLAZE_TITLE`  | `title` | any string                               |

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_DEBUG: &str = "BLAZE_DEBUG";
pub const ENV_TITLE: &str = "BLAZE_TITLE";

/// Errors raised while loading an [`AppConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("environment variable {var} has invalid value {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Application metadata and the debug switch.
///
/// `debug` controls whether unexpected errors are rendered with their type
/// name, message, and backtrace. Leave it off in production.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub title: String,
    pub version: String,
    pub description: String,
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Blaze".to_owned(),
            version: "0.1.0".to_owned(),
            description: String::new(),
            debug: false,
        }
    }
}

impl AppConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Applies `BLAZE_DEBUG` and `BLAZE_TITLE` from the process environment.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_DEBUG) {
            self.debug = parse_flag(&value).ok_or(ConfigError::InvalidEnv {
                var: ENV_DEBUG,
                value,
            })?;
        }
        if let Some(title) = lookup(ENV_TITLE) {
            self.title = title;
        }
        Ok(self)
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
