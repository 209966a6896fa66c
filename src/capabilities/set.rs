//! Capability names and sets

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

/// One thing a device/firmware combination is known to support
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Custom boot files can be loaded (ramdisk environment)
    #[serde(rename = "supports-bootfiles-mode")]
    BootFilesMode,
    /// Activation tokens can be read from the ramdisk
    #[serde(rename = "supports-token-backup")]
    TokenBackup,
    /// Final activation step
    #[serde(rename = "supports-activation")]
    Activation,
    /// OTA updates can be blocked after activation
    #[serde(rename = "supports-update-blocking")]
    UpdateBlocking,
    /// Restores can be blocked after activation
    #[serde(rename = "supports-restore-blocking")]
    RestoreBlocking,
    /// Setup assistant can be skipped
    #[serde(rename = "supports-setup-skip")]
    SetupSkip,
    /// Find My can be turned off
    #[serde(rename = "supports-fmi-off")]
    FmiOff,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::BootFilesMode,
        Capability::TokenBackup,
        Capability::Activation,
        Capability::UpdateBlocking,
        Capability::RestoreBlocking,
        Capability::SetupSkip,
        Capability::FmiOff,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::BootFilesMode => "supports-bootfiles-mode",
            Self::TokenBackup => "supports-token-backup",
            Self::Activation => "supports-activation",
            Self::UpdateBlocking => "supports-update-blocking",
            Self::RestoreBlocking => "supports-restore-blocking",
            Self::SetupSkip => "supports-setup-skip",
            Self::FmiOff => "supports-fmi-off",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered set of capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn extend(&mut self, other: &CapabilitySet) {
        self.0.extend(other.iter());
    }

    pub fn is_subset(&self, other: &CapabilitySet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Members of `self` not present in `other`
    pub fn difference(&self, other: &CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0.difference(&other.0).copied().collect())
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(none)");
        }
        let names: Vec<&str> = self.iter().map(|c| c.name()).collect();
        f.write_str(&names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difference_lists_missing() {
        let required: CapabilitySet = [Capability::Activation, Capability::TokenBackup]
            .into_iter()
            .collect();
        let probed: CapabilitySet = [Capability::Activation].into_iter().collect();

        assert!(!required.is_subset(&probed));
        assert_eq!(
            required.difference(&probed).to_string(),
            "supports-token-backup"
        );
    }

    #[test]
    fn test_serde_names() {
        let set: CapabilitySet = [Capability::FmiOff, Capability::BootFilesMode]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["supports-bootfiles-mode","supports-fmi-off"]"#);
    }
}
