//! Workflow kinds and their step lists

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Supported bypass procedures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    /// Activation from the "Hello" setup screen
    HelloScreen,
    /// Activation of a passcode-locked device via boot files
    PasscodeScreen,
    /// Turn off Find My
    FmiOff,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 3] = [Self::HelloScreen, Self::PasscodeScreen, Self::FmiOff];

    pub fn name(&self) -> &'static str {
        match self {
            Self::HelloScreen => "hello-screen",
            Self::PasscodeScreen => "passcode-screen",
            Self::FmiOff => "fmi-off",
        }
    }

    /// Ordered steps; the last one is terminal
    pub fn steps(&self) -> &'static [StepName] {
        match self {
            Self::HelloScreen => &[StepName::ProbeCompatibility, StepName::Activate],
            Self::PasscodeScreen => &[
                StepName::EnterBootFilesMode,
                StepName::ProbeAndBackupTokens,
                StepName::Activate,
            ],
            Self::FmiOff => &[StepName::ProbeCompatibility, StepName::DisableFmi],
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WorkflowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!(
                    "unknown workflow '{s}' (expected one of: hello-screen, passcode-screen, fmi-off)"
                )
            })
    }
}

/// Named workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    ProbeCompatibility,
    EnterBootFilesMode,
    ProbeAndBackupTokens,
    Activate,
    DisableFmi,
}

impl StepName {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProbeCompatibility => "probe-compatibility",
            Self::EnterBootFilesMode => "enter-bootfiles-mode",
            Self::ProbeAndBackupTokens => "probe-and-backup-tokens",
            Self::Activate => "activate",
            Self::DisableFmi => "disable-fmi",
        }
    }

    /// Steps that finish the run on success and are never re-entered
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Activate | Self::DisableFmi)
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
