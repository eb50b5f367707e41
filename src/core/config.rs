use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::core::errors::{LockstepError, Result};

/// Literal token `#[parallel]` leaves in source text.
pub const DEFAULT_MARKER: &str = "#[parallel";

/// Session configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Root module names the scanner descends from
    pub roots: Vec<String>,
    /// Source marker required before a module is imported (None = import everything)
    pub marker: Option<String>,
    /// Compare table fingerprints across the group before dispatching
    pub verify_table: bool,
    /// Frames a `LocalGroup` buffers ahead of its slowest member. Sessions
    /// never read this; pass the config to `LocalGroup::run_configured`.
    pub channel_capacity: usize,
    /// Default tracing level for `init_tracing`
    pub log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            marker: Some(DEFAULT_MARKER.to_string()),
            verify_table: true,
            channel_capacity: 64,
            log_level: "info".to_string(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration builder
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Parse a configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| LockstepError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(LockstepError::configuration(
                "channel_capacity must be greater than 0",
            ));
        }

        if let Some(root) = self.roots.iter().find(|r| r.trim().is_empty()) {
            return Err(LockstepError::configuration(format!(
                "scan root names cannot be empty (got {:?})",
                root
            )));
        }

        if let Some(marker) = &self.marker {
            if marker.is_empty() {
                return Err(LockstepError::configuration(
                    "marker cannot be empty; use null to disable filtering",
                ));
            }
        }

        self.level()?;
        Ok(())
    }

    /// Parsed `log_level`
    pub fn level(&self) -> Result<Level> {
        Level::from_str(&self.log_level).map_err(|_| {
            LockstepError::configuration(format!("unknown log level {:?}", self.log_level))
        })
    }
}

/// Builder for SessionConfig
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }

    /// Add a scan root
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.config.roots.push(root.into());
        self
    }

    /// Set the source marker, or disable filtering with `None`
    pub fn marker(mut self, marker: Option<&str>) -> Self {
        self.config.marker = marker.map(str::to_string);
        self
    }

    pub fn verify_table(mut self, verify: bool) -> Self {
        self.config.verify_table = verify;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
