//! Static compatibility table
//!
//! Rows map a half-open firmware range to the capabilities available for a
//! set of workflow kinds. The table is read once at startup, either from the
//! built-in default or from a TOML file:
//!
//! ```toml
//! [[rows]]
//! min = "15.0"
//! max = "16.0"
//! kinds = ["passcode-screen"]
//! capabilities = ["supports-bootfiles-mode", "supports-token-backup"]
//! ```

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::set::{Capability, CapabilitySet};
use crate::{device::FirmwareVersion, workflow::WorkflowKind};

/// One firmware range and what it enables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityRow {
    /// Inclusive lower bound
    pub min: FirmwareVersion,
    /// Exclusive upper bound; open-ended when absent
    #[serde(default)]
    pub max: Option<FirmwareVersion>,
    /// Workflow kinds this row applies to; empty means all kinds
    #[serde(default)]
    pub kinds: Vec<WorkflowKind>,
    pub capabilities: CapabilitySet,
}

impl CompatibilityRow {
    fn new(min: (u32, u32), max: (u32, u32), kinds: &[WorkflowKind], caps: &[Capability]) -> Self {
        Self {
            min: FirmwareVersion::new(min.0, min.1, 0),
            max: Some(FirmwareVersion::new(max.0, max.1, 0)),
            kinds: kinds.to_vec(),
            capabilities: caps.iter().copied().collect(),
        }
    }

    pub fn covers(&self, firmware: &FirmwareVersion) -> bool {
        firmware >= &self.min && self.max.as_ref().map_or(true, |max| firmware < max)
    }

    pub fn applies_to(&self, kind: WorkflowKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// Read-only compatibility table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityTable {
    #[serde(default)]
    pub rows: Vec<CompatibilityRow>,
}

impl Default for CompatibilityTable {
    /// Built-in table for the iOS 14, 15 and 16 families
    fn default() -> Self {
        use Capability::*;
        use WorkflowKind::*;

        Self {
            rows: vec![
                CompatibilityRow::new(
                    (14, 0),
                    (16, 0),
                    &[HelloScreen],
                    &[Activation, UpdateBlocking, RestoreBlocking, SetupSkip],
                ),
                CompatibilityRow::new(
                    (14, 0),
                    (16, 0),
                    &[PasscodeScreen],
                    &[BootFilesMode, TokenBackup, Activation, UpdateBlocking, SetupSkip],
                ),
                CompatibilityRow::new(
                    (14, 0),
                    (16, 0),
                    &[WorkflowKind::FmiOff],
                    &[Capability::FmiOff],
                ),
                CompatibilityRow::new(
                    (16, 0),
                    (17, 0),
                    &[HelloScreen],
                    &[Activation, UpdateBlocking, SetupSkip],
                ),
                CompatibilityRow::new(
                    (16, 0),
                    (17, 0),
                    &[PasscodeScreen],
                    &[BootFilesMode, TokenBackup, Activation],
                ),
            ],
        }
    }
}

impl CompatibilityTable {
    /// Load from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read compatibility table {}", path.display()))?;
        let table = Self::parse(&content)
            .with_context(|| format!("Invalid compatibility table {}", path.display()))?;

        info!(
            "Loaded compatibility table from {} ({} rows)",
            path.display(),
            table.rows.len()
        );
        Ok(table)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let table: Self = toml::from_str(content).context("Failed to parse TOML")?;
        table.validate()?;
        Ok(table)
    }

    /// Built-in table, or the file at `path` when given
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (i, row) in self.rows.iter().enumerate() {
            if let Some(max) = &row.max {
                if max <= &row.min {
                    bail!("Row {i}: empty firmware range [{}, {max})", row.min);
                }
            }
        }
        Ok(())
    }

    /// Union of the capabilities of every row covering `firmware` for `kind`
    pub fn lookup(&self, firmware: &FirmwareVersion, kind: WorkflowKind) -> CapabilitySet {
        let mut caps = CapabilitySet::new();
        for row in self
            .rows
            .iter()
            .filter(|r| r.applies_to(kind) && r.covers(firmware))
        {
            caps.extend(&row.capabilities);
        }
        caps
    }

    /// Union over every workflow kind
    pub fn lookup_any(&self, firmware: &FirmwareVersion) -> CapabilitySet {
        let mut caps = CapabilitySet::new();
        for row in self.rows.iter().filter(|r| r.covers(firmware)) {
            caps.extend(&row.capabilities);
        }
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fw(s: &str) -> FirmwareVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_default_table_is_valid() {
        CompatibilityTable::default().validate().unwrap();
    }

    #[test]
    fn test_range_is_half_open() {
        let table = CompatibilityTable::default();
        assert!(table
            .lookup(&fw("15.7.1"), WorkflowKind::FmiOff)
            .contains(Capability::FmiOff));
        assert!(table.lookup(&fw("16.0"), WorkflowKind::FmiOff).is_empty());
        assert!(table.lookup(&fw("13.9"), WorkflowKind::HelloScreen).is_empty());
        assert!(table.lookup(&fw("17.0"), WorkflowKind::PasscodeScreen).is_empty());
    }

    #[test]
    fn test_parse_toml_table() {
        let table = CompatibilityTable::parse(
            r#"
            [[rows]]
            min = "15.0"
            max = "16.0"
            kinds = ["passcode-screen"]
            capabilities = ["supports-bootfiles-mode", "supports-token-backup"]

            [[rows]]
            min = "15.0"
            capabilities = ["supports-activation"]
            "#,
        )
        .unwrap();

        let caps = table.lookup(&fw("15.4"), WorkflowKind::PasscodeScreen);
        assert_eq!(caps.len(), 3);

        // Open-ended, kind-agnostic row
        let caps = table.lookup(&fw("18.1"), WorkflowKind::HelloScreen);
        assert_eq!(caps.to_string(), "supports-activation");
    }

    #[test]
    fn test_rejects_empty_range() {
        let err = CompatibilityTable::parse(
            r#"
            [[rows]]
            min = "16.0"
            max = "15.0"
            capabilities = []
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty firmware range"));
    }

    #[test]
    fn test_rejects_unknown_capability() {
        assert!(CompatibilityTable::parse(
            r#"
            [[rows]]
            min = "15.0"
            capabilities = ["supports-teleport"]
            "#,
        )
        .is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compat.toml");
        std::fs::write(&path, "[[rows]]\nmin = \"14.0\"\ncapabilities = [\"supports-fmi-off\"]\n")
            .unwrap();

        let table = CompatibilityTable::load(&path).unwrap();
        assert_eq!(table.rows.len(), 1);
        assert!(CompatibilityTable::load(dir.path().join("missing.toml")).is_err());
    }
}
