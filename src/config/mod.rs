//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - CLI arguments

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub mod types;

pub use types::{
    AccessConfig, CompatibilityConfig, LoggingConfig, MonitorConfig, ToolboxConfig,
    TransitionConfig, TransportConfig, WorkflowConfig,
};

const APP_DIR: &str = "devflow";

/// Default config file location (`$XDG_CONFIG_HOME/devflow/config.toml`)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map_or_else(|| PathBuf::from("/etc").join(APP_DIR), |d| d.join(APP_DIR))
        .join("config.toml")
}

/// Resolve log directory, falling back to `$XDG_DATA_HOME/devflow/logs`
pub fn resolve_log_dir(configured: &Option<PathBuf>) -> PathBuf {
    configured.clone().unwrap_or_else(|| {
        dirs::data_dir().map_or_else(
            || std::env::temp_dir().join(APP_DIR),
            |d| d.join(APP_DIR).join("logs"),
        )
    })
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Device monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Mode transition configuration
    #[serde(default)]
    pub transition: TransitionConfig,
    /// Workflow configuration
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Compatibility table configuration
    #[serde(default)]
    pub compatibility: CompatibilityConfig,
    /// Toolbox access configuration
    #[serde(default)]
    pub access: AccessConfig,
    /// Toolbox operation inputs
    #[serde(default)]
    pub toolbox: ToolboxConfig,
    /// Device transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default path if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = default_config_path();
                if default.exists() {
                    Self::load(&default)
                } else {
                    Self::default_config()
                }
            }
        }
    }

    /// Create default configuration
    pub fn default_config() -> Result<Self> {
        Ok(Config::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.monitor.poll_interval_ms == 0 {
            anyhow::bail!("monitor.poll_interval_ms must be greater than 0");
        }
        if self.monitor.buffer == 0 {
            anyhow::bail!("monitor.buffer must be greater than 0");
        }

        if self.transition.confirm_timeout_ms < self.monitor.poll_interval_ms {
            anyhow::bail!(
                "transition.confirm_timeout_ms ({}) must be at least monitor.poll_interval_ms ({})",
                self.transition.confirm_timeout_ms,
                self.monitor.poll_interval_ms
            );
        }

        if let Some(path) = &self.compatibility.table_path {
            if !path.exists() {
                anyhow::bail!("Compatibility table not found: {}", path.display());
            }
        }

        for name in &self.access.allowed_operations {
            if name != "*" && name.parse::<crate::toolbox::ToolboxOperation>().is_err() {
                anyhow::bail!("Unknown toolbox operation in access.allowed_operations: {name}");
            }
        }

        match self.transport.backend.as_str() {
            "libimobiledevice" | "simulated" => {}
            _ => anyhow::bail!("Invalid transport backend: {}", self.transport.backend),
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            _ => anyhow::bail!("Invalid log format: {}", self.logging.format),
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}", self.logging.level),
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, simulate: bool, log_format: Option<String>) -> Self {
        if simulate {
            self.transport.backend = "simulated".to_string();
        }
        if let Some(format) = log_format {
            self.logging.format = format;
        }
        self
    }

    pub fn is_simulated(&self) -> bool {
        self.transport.backend == "simulated"
    }
}
