//! Driver command vocabulary
//!
//! The engine never constructs protocol bytes. It names the action it wants
//! and the transport decides how to carry it out.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::{DeviceKey, FirmwareVersion, SlotId};

/// Flags applied by activation steps
///
/// Fixed for the lifetime of a workflow run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationFlags {
    /// Prevent OTA updates after activation
    #[serde(default)]
    pub block_updates: bool,
    /// Prevent restores from the host after activation
    #[serde(default)]
    pub block_restores: bool,
    /// Skip the remaining setup assistant screens
    #[serde(default)]
    pub skip_setup: bool,
}

impl ActivationFlags {
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.block_updates {
            parts.push("block-updates");
        }
        if self.block_restores {
            parts.push("block-restores");
        }
        if self.skip_setup {
            parts.push("skip-setup");
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(",")
        }
    }
}

/// Jailbreak tool variants offered by the toolbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JailbreakVariant {
    Automatic,
    Checkra1n,
    Palera1nRootful,
    Palera1nRootless,
}

impl JailbreakVariant {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Checkra1n => "checkra1n",
            Self::Palera1nRootful => "palera1n-rootful",
            Self::Palera1nRootless => "palera1n-rootless",
        }
    }
}

impl fmt::Display for JailbreakVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single action for the driver to perform on one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum DeviceCommand {
    EnterRecovery,
    EnterDfu,
    ExitToNormal,
    EnterPurple,
    LoadBootFiles { firmware: Option<FirmwareVersion> },
    BackupTokens,
    Activate { flags: ActivationFlags },
    DisableFmi,
    Restore,
    Jailbreak { variant: JailbreakVariant },
    /// Upload a ramdisk image and boot it
    BootRamdisk { path: PathBuf },
}

/// Payload-free discriminant of [`DeviceCommand`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    EnterRecovery,
    EnterDfu,
    ExitToNormal,
    EnterPurple,
    LoadBootFiles,
    BackupTokens,
    Activate,
    DisableFmi,
    Restore,
    Jailbreak,
    BootRamdisk,
}

impl DeviceCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::EnterRecovery => CommandKind::EnterRecovery,
            Self::EnterDfu => CommandKind::EnterDfu,
            Self::ExitToNormal => CommandKind::ExitToNormal,
            Self::EnterPurple => CommandKind::EnterPurple,
            Self::LoadBootFiles { .. } => CommandKind::LoadBootFiles,
            Self::BackupTokens => CommandKind::BackupTokens,
            Self::Activate { .. } => CommandKind::Activate,
            Self::DisableFmi => CommandKind::DisableFmi,
            Self::Restore => CommandKind::Restore,
            Self::Jailbreak { .. } => CommandKind::Jailbreak,
            Self::BootRamdisk { .. } => CommandKind::BootRamdisk,
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnterRecovery => write!(f, "enter-recovery"),
            Self::EnterDfu => write!(f, "enter-dfu"),
            Self::ExitToNormal => write!(f, "exit-to-normal"),
            Self::EnterPurple => write!(f, "enter-purple"),
            Self::LoadBootFiles { firmware: Some(fw) } => {
                write!(f, "load-boot-files({})", fw.family())
            }
            Self::LoadBootFiles { firmware: None } => write!(f, "load-boot-files"),
            Self::BackupTokens => write!(f, "backup-tokens"),
            Self::Activate { flags } => write!(f, "activate({})", flags.summary()),
            Self::DisableFmi => write!(f, "disable-fmi"),
            Self::Restore => write!(f, "restore"),
            Self::Jailbreak { variant } => write!(f, "jailbreak({variant})"),
            Self::BootRamdisk { path } => write!(f, "boot-ramdisk({})", path.display()),
        }
    }
}

/// Where a command is delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTarget {
    pub key: DeviceKey,
    pub slot: SlotId,
}

/// Driver acknowledgement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandAck {
    /// Opaque data produced by the command (e.g. a token backup blob)
    pub artifact: Option<Vec<u8>>,
    /// Driver-supplied detail for the event log
    pub message: Option<String>,
}

impl CommandAck {
    pub fn with_artifact(artifact: Vec<u8>) -> Self {
        Self {
            artifact: Some(artifact),
            message: None,
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            artifact: None,
            message: Some(message.into()),
        }
    }
}
