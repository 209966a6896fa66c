//! Configuration section types

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Device monitor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between transport enumerations
    pub poll_interval_ms: u64,
    /// Snapshots buffered per subscriber before the oldest are dropped
    pub buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
            buffer: 64,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Mode transition configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    /// How long to wait for the monitor to report the target mode
    pub confirm_timeout_ms: u64,
    /// How long to wait for the real outcome after a cancel
    pub cancel_settle_ms: u64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: 30_000,
            cancel_settle_ms: 5_000,
        }
    }
}

impl TransitionConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn cancel_settle(&self) -> Duration {
        Duration::from_millis(self.cancel_settle_ms)
    }
}

/// Workflow configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Consecutive retryable failures of one step before it counts as fatal (0 = unlimited)
    pub max_step_attempts: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: 5,
        }
    }
}

/// Compatibility table source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatibilityConfig {
    /// TOML table to load instead of the built-in one
    pub table_path: Option<PathBuf>,
}

/// Toolbox access configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Toolbox operations that may run; `"*"` allows all
    pub allowed_operations: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            allowed_operations: vec!["*".to_string()],
        }
    }
}

/// Toolbox operation inputs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolboxConfig {
    /// Ramdisk image for `boot-ramdisk`; checked when the operation runs
    pub ramdisk_path: Option<PathBuf>,
}

/// Device transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// "libimobiledevice" or "simulated"
    pub backend: String,
    /// Per-invocation timeout for external tools
    pub command_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: "libimobiledevice".to_string(),
            command_timeout_ms: 10_000,
        }
    }
}

impl TransportConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Crate log level when no `-v` is given
    pub level: String,
    /// Directory for log files
    pub log_dir: Option<PathBuf>,
    /// "pretty", "compact" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            format: "pretty".to_string(),
        }
    }
}
