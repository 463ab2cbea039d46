use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::events::CORE_MESSAGE_TYPES;

pub const DEFAULT_TICK_RATE: f64 = 20.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse config json at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("validation failed at {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub tick_rate: f64,
    pub max_ticks_per_advance: Option<u64>,
    pub record_commands: bool,
    pub extra_message_types: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            max_ticks_per_advance: None,
            record_commands: false,
            extra_message_types: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = parse_json(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tick_rate.is_finite() || self.tick_rate <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "tick_rate",
                message: format!("expected finite positive number, got {}", self.tick_rate),
            });
        }
        if self.max_ticks_per_advance == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_ticks_per_advance",
                message: "expected at least 1 when set".to_string(),
            });
        }
        if let Some(blank) = self
            .extra_message_types
            .iter()
            .position(|name| name.trim().is_empty())
        {
            return Err(ConfigError::Invalid {
                field: "extra_message_types",
                message: format!("entry {blank} is blank"),
            });
        }
        Ok(())
    }

    /// Core vocabulary followed by the configured extras.
    pub fn message_types(&self) -> Vec<String> {
        CORE_MESSAGE_TYPES
            .iter()
            .map(|name| (*name).to_string())
            .chain(self.extra_message_types.iter().cloned())
            .collect()
    }
}

/// Deserializes JSON, reporting the field path of the first failure.
pub fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, ConfigError> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    serde_path_to_error::deserialize(&mut deserializer).map_err(|error| {
        let path = error.path().to_string();
        ConfigError::Parse {
            path,
            source: error.into_inner(),
        }
    })
}
