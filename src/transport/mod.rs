//! Transport/driver collaborator interface
//!
//! The engine talks to hardware only through [`DeviceTransport`]. Two
//! implementations ship with the crate:
//!
//! - [`SimulatedTransport`]: scripted in-memory devices (tests, `--simulate`)
//! - [`LibimobiledeviceTransport`]: wraps the libimobiledevice command-line tools

mod command;
pub mod libimobiledevice;
pub mod simulated;

use async_trait::async_trait;
use thiserror::Error;

use crate::device::{DeviceKey, DeviceSnapshot, SlotId};

pub use command::{
    ActivationFlags, CommandAck, CommandKind, CommandTarget, DeviceCommand, JailbreakVariant,
};
pub use libimobiledevice::{LibimobiledeviceTransport, REQUIRED_TOOLS};
pub use simulated::{ScriptedReply, SimulatedDevice, SimulatedTransport};

/// Errors reported by a transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Slot or device no longer present
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Device dropped off the bus mid-command
    #[error("Device disconnected: {0}")]
    Disconnected(String),

    /// Device or driver temporarily unable to accept the command
    #[error("Device busy: {0}")]
    Busy(String),

    /// Driver-level timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Driver does not implement the command
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Device refused the command
    #[error("Refused: {0}")]
    Refused(String),

    /// External tool failed
    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    /// Command cancelled before completion
    #[error("Cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl TransportError {
    /// Failures that may succeed if the same command is issued again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Busy(_) | Self::Timeout(_) | Self::Io(_) | Self::Cancelled
        )
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Disconnected(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Driver collaborator
///
/// Implementations must be safe to call concurrently; the engine serializes
/// commands per device itself.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Raw descriptors of everything currently attached
    async fn enumerate(&self) -> Result<Vec<SlotId>, TransportError>;

    /// Read identity and mode for one descriptor
    async fn describe(&self, slot: &SlotId) -> Result<DeviceSnapshot, TransportError>;

    /// Issue one command and wait for the driver's acknowledgement
    async fn send_command(
        &self,
        target: &CommandTarget,
        command: &DeviceCommand,
    ) -> Result<CommandAck, TransportError>;

    /// Ask the driver to abandon whatever it is doing for this device
    async fn cancel_outstanding(&self, key: &DeviceKey) -> Result<(), TransportError>;
}
