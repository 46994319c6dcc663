//! Engine configuration.
//!
//! Configuration is plain data that can be deserialized from JSON and then
//! turned into per-cell [`CellOptions`](crate::reactive::CellOptions).
//!
//! ```json
//! { "teardown": "deferred", "label_prefix": "checkout" }
//! ```

use std::sync::Arc;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::reactive::CellOptions;
use crate::scheduler::{ImmediateScheduler, Scheduler, TokioScheduler};

/// When a cell with no subscribers left runs its mount cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownMode {
    /// On the next turn of the tokio event loop, if still unobserved.
    #[default]
    Deferred,
    /// As soon as the last subscriber leaves.
    Immediate,
}

/// Engine-wide defaults applied to cells built from this configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub teardown: TeardownMode,

    /// Prefix for cell labels in log records.
    pub label_prefix: Option<String>,
}

impl EngineConfig {
    /// Parse a configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build the teardown scheduler selected by this configuration.
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        match self.teardown {
            TeardownMode::Deferred => Arc::new(TokioScheduler),
            TeardownMode::Immediate => Arc::new(ImmediateScheduler),
        }
    }

    /// Compose a cell label under the configured prefix.
    pub fn label(&self, name: &str) -> String {
        match &self.label_prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.to_string(),
        }
    }

    /// Options for a cell named `name` under this configuration.
    pub fn cell_options(&self, name: &str) -> CellOptions {
        CellOptions::new()
            .label(self.label(name))
            .scheduler(self.scheduler())
    }
}

impl From<&EngineConfig> for CellOptions {
    /// Options carrying the configured scheduler, labelled with the bare
    /// prefix if one is set.
    fn from(config: &EngineConfig) -> Self {
        let options = CellOptions::new().scheduler(config.scheduler());
        match &config.label_prefix {
            Some(prefix) => options.label(prefix.clone()),
            None => options,
        }
    }
}
