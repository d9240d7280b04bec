use std::fs;
use std::path::Path;

use conduit_types::ConfigError;
use serde::Deserialize;
use serde_json::Value;

const fn default_true() -> bool {
    true
}

const fn default_max_concurrent_handlers() -> usize {
    8
}

/// Client configuration, usually read from a TOML file.
///
/// ```toml
/// [engine]
/// network = { endpoints = ["localhost"] }
///
/// [workers]
/// max_concurrent_handlers = 8
///
/// [streams]
/// unsubscribe_on_drop = true
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Passed to the engine as JSON when the context is created. Not
    /// interpreted here.
    #[serde(default)]
    pub engine: Value,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub streams: StreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// App Object handlers allowed to run at once. Must be at least 1.
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: default_max_concurrent_handlers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Send the unsubscribe call when a subscription stream is dropped
    /// before it finished.
    #[serde(default = "default_true")]
    pub unsubscribe_on_drop: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            unsubscribe_on_drop: true,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded client config");
        Ok(config)
    }

    #[must_use]
    pub fn with_engine(mut self, engine: Value) -> Self {
        self.engine = engine;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.max_concurrent_handlers == 0 {
            return Err(ConfigError::Invalid(
                "workers.max_concurrent_handlers must be at least 1".to_string(),
            ));
        }
        if !(self.engine.is_object() || self.engine.is_null()) {
            return Err(ConfigError::Invalid(
                "engine must be a table".to_string(),
            ));
        }
        Ok(())
    }

    /// Engine section as the JSON string handed to `create_context`.
    pub(crate) fn engine_json(&self) -> String {
        if self.engine.is_null() {
            "{}".to_string()
        } else {
            self.engine.to_string()
        }
    }
}
